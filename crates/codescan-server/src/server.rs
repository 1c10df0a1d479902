//! HTTP upload endpoint.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use codescan_core::{DecodeRequest, ErrorKind, ScanResponse};
use codescan_decode::DecodeOrchestrator;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Multipart field that carries the photo.
const IMAGE_FIELD: &str = "image";

struct AppState {
    orchestrator: DecodeOrchestrator,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    vision_fallback: bool,
}

/// Build the router. `max_upload_bytes` bounds the request body.
pub fn router(orchestrator: DecodeOrchestrator, max_upload_bytes: usize) -> Router {
    let state = Arc::new(AppState { orchestrator });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/scan", post(scan_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn run_server(
    orchestrator: DecodeOrchestrator,
    max_upload_bytes: usize,
    host: &str,
    port: u16,
) -> color_eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let app = router(orchestrator, max_upload_bytes);

    info!("Server listening on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /health   - Health check");
    info!("  POST /api/scan - Decode an uploaded image (multipart field \"{}\")", IMAGE_FIELD);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vision_fallback: state.orchestrator.has_vision(),
    })
}

async fn scan_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> (StatusCode, Json<ScanResponse>) {
    let request = match read_upload(multipart).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ScanResponse::failure(
                    ErrorKind::ProcessingError,
                    "No image uploaded.".to_string(),
                )),
            );
        }
        Err((status, message)) => {
            warn!("Rejected upload: {}", message);
            return (
                status,
                Json(ScanResponse::failure(ErrorKind::ProcessingError, message)),
            );
        }
    };

    let report = state.orchestrator.decode(&request).await;
    let status = match report.result.error_kind() {
        None => StatusCode::OK,
        Some(kind) => status_for(kind),
    };
    (status, Json(report.result.to_response()))
}

/// The `image` field, or else the first field carrying a file name.
async fn read_upload(
    mut multipart: Multipart,
) -> Result<Option<DecodeRequest>, (StatusCode, String)> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err((e.status(), format!("Invalid upload: {}", e.body_text()))),
        };

        let is_image = field.name() == Some(IMAGE_FIELD) || field.file_name().is_some();
        if !is_image {
            continue;
        }

        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (e.status(), format!("Invalid upload: {}", e.body_text())))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        return Ok(Some(DecodeRequest::new(bytes.to_vec(), content_type)));
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ExternalServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NoCodeFound
        | ErrorKind::ProcessingError
        | ErrorKind::PermissionDenied
        | ErrorKind::NoDeviceFound => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
