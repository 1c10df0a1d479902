//! End-to-end runs of the strategy chain against a temporary scratch area.

mod common;

use codescan_core::{
    AttemptOutcome, DecodeRequest, DecodeResult, ErrorKind, NativeReader, Rotation, ScratchArea,
    StrategyKind,
};
use codescan_decode::DecodeOrchestrator;
use common::*;
use image::GrayImage;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn orchestrator() -> (TempDir, DecodeOrchestrator) {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchArea::new(tmp.path().join("scratch")).unwrap();
    (tmp, DecodeOrchestrator::new(scratch))
}

fn assert_scratch_empty(orchestrator: &DecodeOrchestrator) {
    assert_eq!(orchestrator.scratch().entry_count().unwrap(), 0);
}

#[tokio::test]
async fn upright_qr_decodes_on_raw_upload() {
    let (_tmp, orchestrator) = orchestrator();
    let request = DecodeRequest::new(png(&render_qr("https://example.com/p/7", 6)), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(
        report.result,
        DecodeResult::Decoded {
            text: "https://example.com/p/7".to_string(),
            strategy: StrategyKind::Raw,
        }
    );
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.token, request.token());
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn upc_a_barcode_decodes() {
    let (_tmp, orchestrator) = orchestrator();
    let request = DecodeRequest::new(png(&render_upc_a(UPC_A, 3, 120)), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.result.text(), Some(UPC_A));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn rotated_codes_decode_to_same_text() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_reader(Arc::new(NativeReader::new(false)));
    let qr = render_qr("ROTATE-ME", 6);
    let upc = render_upc_a(UPC_A, 3, 120);

    // Upright bars read forwards or backwards; sideways bars need one quarter turn.
    let cases: [(fn(&GrayImage) -> GrayImage, StrategyKind); 3] = [
        (image::imageops::rotate90, StrategyKind::Rotated(Rotation::Deg90)),
        (image::imageops::rotate180, StrategyKind::Raw),
        (image::imageops::rotate270, StrategyKind::Rotated(Rotation::Deg90)),
    ];
    for (rotate, winner) in cases {
        let report = orchestrator
            .decode(&DecodeRequest::new(png(&rotate(&qr)), "image/png"))
            .await;
        assert_eq!(
            report.result,
            DecodeResult::Decoded {
                text: "ROTATE-ME".to_string(),
                strategy: StrategyKind::Raw,
            }
        );

        let report = orchestrator
            .decode(&DecodeRequest::new(png(&rotate(&upc)), "image/png"))
            .await;
        assert_eq!(
            report.result,
            DecodeResult::Decoded {
                text: UPC_A.to_string(),
                strategy: winner,
            }
        );
    }
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn rotated_upc_a_photo_resolves() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_reader(Arc::new(NativeReader::new(false)));
    let photo = image::imageops::rotate90(&on_canvas(&render_upc_a(UPC_A, 8, 500), 1200, 900));
    let request = DecodeRequest::new(jpeg(&photo, 90), "image/jpeg");

    let report = orchestrator.decode(&request).await;

    assert_eq!(
        report.trail(),
        vec![
            (StrategyKind::Raw, &AttemptOutcome::NoCodeFound),
            (StrategyKind::Optimized, &AttemptOutcome::NoCodeFound),
            (
                StrategyKind::Rotated(Rotation::Deg90),
                &AttemptOutcome::Decoded(UPC_A.to_string())
            ),
        ]
    );
    let response = report.result.to_response();
    assert!(response.success);
    assert_eq!(response.barcode.as_deref(), Some(UPC_A));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn rotated_code_found_on_first_rotation() {
    init_tracing();
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_reader(Arc::new(PortraitReader));
    let request = DecodeRequest::new(blank_png(60, 30), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(
        report.trail(),
        vec![
            (StrategyKind::Raw, &AttemptOutcome::NoCodeFound),
            (StrategyKind::Optimized, &AttemptOutcome::NoCodeFound),
            (
                StrategyKind::Rotated(Rotation::Deg90),
                &AttemptOutcome::Decoded("PORTRAIT-1".to_string())
            ),
        ]
    );
    assert_eq!(
        report.result,
        DecodeResult::Decoded {
            text: "PORTRAIT-1".to_string(),
            strategy: StrategyKind::Rotated(Rotation::Deg90),
        }
    );
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn blank_image_exhausts_local_chain() {
    let (_tmp, orchestrator) = orchestrator();
    let request = DecodeRequest::new(blank_png(80, 80), "image/png");

    let report = orchestrator.decode(&request).await;

    let strategies: Vec<_> = report.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(
        strategies,
        vec![
            StrategyKind::Raw,
            StrategyKind::Optimized,
            StrategyKind::Rotated(Rotation::Deg90),
            StrategyKind::Rotated(Rotation::Deg180),
            StrategyKind::Rotated(Rotation::Deg270),
        ]
    );
    assert!(
        report
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::NoCodeFound)
    );
    assert_eq!(report.result.error_kind(), Some(ErrorKind::NoCodeFound));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn vision_fallback_runs_last_and_once() {
    init_tracing();
    let (_tmp, orchestrator) = orchestrator();
    let vision = Arc::new(ScriptedVision::new(Script::Nothing));
    let orchestrator = orchestrator.with_vision(vision.clone());
    let request = DecodeRequest::new(blank_png(80, 80), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.attempts.len(), 6);
    assert_eq!(
        report.attempts.last().map(|a| a.strategy),
        Some(StrategyKind::VisionFallback)
    );
    assert_eq!(report.result.error_kind(), Some(ErrorKind::NoCodeFound));
    assert_eq!(vision.calls(), 1);
    assert_eq!(vision.last_mime().as_deref(), Some("image/jpeg"));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn vision_fallback_can_decode() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_vision(Arc::new(ScriptedVision::new(Script::Text("ABC-123"))));
    let request = DecodeRequest::new(blank_png(80, 80), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(
        report.result,
        DecodeResult::Decoded {
            text: "ABC-123".to_string(),
            strategy: StrategyKind::VisionFallback,
        }
    );
}

#[tokio::test]
async fn vision_not_called_when_local_succeeds() {
    let (_tmp, orchestrator) = orchestrator();
    let vision = Arc::new(ScriptedVision::new(Script::Text("WRONG")));
    let orchestrator = orchestrator.with_vision(vision.clone());
    let request = DecodeRequest::new(png(&render_qr("LOCAL", 6)), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.result.text(), Some("LOCAL"));
    assert_eq!(vision.calls(), 0);
}

#[tokio::test]
async fn vision_quota_is_surfaced() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_vision(Arc::new(ScriptedVision::new(Script::Quota)));
    let request = DecodeRequest::new(blank_png(40, 40), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.result.error_kind(), Some(ErrorKind::QuotaExceeded));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn vision_timeout_is_service_unavailable() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator
        .with_vision(Arc::new(ScriptedVision::new(Script::Hang(Duration::from_secs(5)))))
        .with_vision_timeout(Duration::from_millis(50));
    let request = DecodeRequest::new(blank_png(40, 40), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(
        report.result.error_kind(),
        Some(ErrorKind::ExternalServiceUnavailable)
    );
    assert!(matches!(
        report.attempts.last().map(|a| &a.outcome),
        Some(AttemptOutcome::ServiceFailure {
            kind: ErrorKind::ExternalServiceUnavailable,
            ..
        })
    ));
}

#[tokio::test]
async fn corrupt_upload_is_processing_error() {
    let (_tmp, orchestrator) = orchestrator();
    let request = DecodeRequest::new(b"definitely not an image".to_vec(), "image/jpeg");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.attempts.len(), 5);
    assert!(report.attempts[1..].iter().all(|a| a.used_original));
    assert_eq!(report.result.error_kind(), Some(ErrorKind::ProcessingError));
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn panicking_reader_leaves_no_scratch_files() {
    init_tracing();
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_reader(Arc::new(PanickingReader));
    let request = DecodeRequest::new(blank_png(32, 32), "image/png");

    let report = orchestrator.decode(&request).await;

    assert_eq!(report.result.error_kind(), Some(ErrorKind::ProcessingError));
    assert_eq!(report.attempts.len(), 5);
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn elapsed_deadline_skips_strategies() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_deadline(Duration::ZERO);
    let request = DecodeRequest::new(png(&render_qr("LATE", 6)), "image/png");

    let report = orchestrator.decode(&request).await;

    assert!(report.attempts.is_empty());
    assert_eq!(
        report.result.error_kind(),
        Some(ErrorKind::ExternalServiceUnavailable)
    );
    assert_scratch_empty(&orchestrator);
}

#[tokio::test]
async fn same_input_same_trail() {
    let (_tmp, orchestrator) = orchestrator();
    let orchestrator = orchestrator.with_reader(Arc::new(PortraitReader));
    let bytes = blank_png(50, 20);

    let first = orchestrator
        .decode(&DecodeRequest::new(bytes.clone(), "image/png"))
        .await;
    let second = orchestrator
        .decode(&DecodeRequest::new(bytes, "image/png"))
        .await;

    assert_ne!(first.token, second.token);
    assert_eq!(first.attempts, second.attempts);
    assert_eq!(first.result, second.result);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_isolated() {
    let (_tmp, orchestrator) = orchestrator();

    let tasks = (0..10).map(|i| {
        let orchestrator = orchestrator.clone();
        let payload = format!("ITEM-{:03}", i);
        tokio::spawn(async move {
            let request = DecodeRequest::new(png(&render_qr(&payload, 5)), "image/png");
            let report = orchestrator.decode(&request).await;
            (payload, report)
        })
    });

    for joined in futures::future::join_all(tasks).await {
        let (payload, report) = joined.unwrap();
        assert_eq!(report.result.text(), Some(payload.as_str()));
    }
    assert_scratch_empty(&orchestrator);
}
