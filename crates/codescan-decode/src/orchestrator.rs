//! Ordered fallback decoding of one uploaded image.
//!
//! For each request the orchestrator opens a private scratch scope, writes the
//! upload to it, then walks the strategy chain cheapest first:
//!
//! 1. native decode on the raw upload
//! 2. native decode on the optimized variant
//! 3. native decode on the 90°, 180° and 270° rotations of the optimized variant
//! 4. the vision-model fallback, when configured
//!
//! The first decoded text wins. The scope is closed before the report is
//! returned, and its `Drop` covers every early exit and panic.

use codescan_core::{
    AttemptOutcome, CodeReader, DecodeAttempt, DecodeReport, DecodeRequest, DecodeResult,
    ErrorKind, ImagePreprocessor, NativeReader, ScratchArea, ScratchScope, ServiceConfig,
    StrategyKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ServiceError;
use crate::strategy::{LocalChain, attempt_vision};
use crate::vision::{HttpVisionModel, VisionModel, VisionPayload};

/// Resolves decode requests to exactly one result each. Cheap to clone; clones
/// share the reader and vision client.
#[derive(Clone)]
pub struct DecodeOrchestrator {
    preprocessor: Arc<ImagePreprocessor>,
    reader: Arc<dyn CodeReader>,
    vision: Option<Arc<dyn VisionModel>>,
    scratch: ScratchArea,
    vision_timeout: Duration,
    deadline: Option<Duration>,
}

/// What the blocking local phase hands back to the async phase.
struct LocalPhase {
    attempts: Vec<DecodeAttempt>,
    decoded: Option<(String, StrategyKind)>,
    deadline_hit: bool,
    payload: Option<VisionPayload>,
    scope: ScratchScope,
}

impl DecodeOrchestrator {
    /// Native reader, default preprocessing, no vision fallback.
    pub fn new(scratch: ScratchArea) -> Self {
        Self {
            preprocessor: Arc::new(ImagePreprocessor::default()),
            reader: Arc::new(NativeReader::default()),
            vision: None,
            scratch,
            vision_timeout: Duration::from_secs(20),
            deadline: None,
        }
    }

    /// Build from service configuration. The vision fallback is enabled only
    /// when an API key is configured.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let scratch = ScratchArea::new(&config.scratch_dir)?;
        let mut orchestrator = Self::new(scratch)
            .with_preprocessor(ImagePreprocessor::new(config.preprocess.clone()))
            .with_vision_timeout(config.vision.timeout());

        if let Some(deadline) = config.request_deadline() {
            orchestrator = orchestrator.with_deadline(deadline);
        }

        if config.vision.is_enabled() {
            let model = HttpVisionModel::new(&config.vision)?;
            tracing::info!("Vision fallback enabled with model {}", config.vision.model);
            orchestrator = orchestrator.with_vision(Arc::new(model));
        } else {
            tracing::info!("Vision fallback disabled (no API key configured)");
        }

        Ok(orchestrator)
    }

    pub fn with_preprocessor(mut self, preprocessor: ImagePreprocessor) -> Self {
        self.preprocessor = Arc::new(preprocessor);
        self
    }

    pub fn with_reader(mut self, reader: Arc<dyn CodeReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_vision_timeout(mut self, timeout: Duration) -> Self {
        self.vision_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    pub fn has_vision(&self) -> bool {
        self.vision.is_some()
    }

    /// Run the strategy chain for one request. Never fails: every fault is
    /// folded into the returned report.
    #[tracing::instrument(
        name = "decode",
        skip(self, request),
        fields(token = %request.token(), bytes = request.bytes().len())
    )]
    pub async fn decode(&self, request: &DecodeRequest) -> DecodeReport {
        let started = Instant::now();
        let deadline = self.deadline.map(|d| started + d);

        let mut scope = match self.scratch.scope(request.token()) {
            Ok(scope) => scope,
            Err(e) => {
                tracing::error!("Failed to open scratch scope: {}", e);
                return report(request, Vec::new(), DecodeResult::failed(ErrorKind::ProcessingError));
            }
        };

        let raw = match scope.acquire("raw", request.extension(), request.bytes()) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to persist upload: {}", e);
                scope.close();
                return report(request, Vec::new(), DecodeResult::failed(ErrorKind::ProcessingError));
            }
        };

        let preprocessor = Arc::clone(&self.preprocessor);
        let reader = Arc::clone(&self.reader);
        let wants_payload = self.vision.is_some();
        let content_type = request.content_type().to_string();
        let span = tracing::Span::current();

        let local = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut chain = LocalChain::new(&preprocessor, reader.as_ref(), scope, raw);
            let mut attempts = Vec::new();
            let mut decoded = None;
            let mut deadline_hit = false;

            for kind in StrategyKind::chain().into_iter().filter(|k| k.is_local()) {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    deadline_hit = true;
                    break;
                }
                let attempt = chain.attempt(kind);
                tracing::debug!("Attempt {}: {:?}", kind, attempt.outcome);
                let text = attempt.outcome.text().map(str::to_string);
                attempts.push(attempt);
                if let Some(text) = text {
                    decoded = Some((text, kind));
                    break;
                }
            }

            let payload = if decoded.is_none() && !deadline_hit && wants_payload {
                match chain.vision_payload(&content_type) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!("Could not prepare vision payload: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            LocalPhase {
                attempts,
                decoded,
                deadline_hit,
                payload,
                scope: chain.into_scope(),
            }
        })
        .await;

        // A panic here already dropped (and cleaned) the scope on the blocking thread.
        let LocalPhase {
            mut attempts,
            decoded,
            deadline_hit,
            payload,
            scope,
        } = match local {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!("Local decode task failed: {}", e);
                return report(request, Vec::new(), DecodeResult::failed(ErrorKind::ProcessingError));
            }
        };

        // Local variants are no longer needed; the vision payload lives in memory.
        scope.close();

        if let Some((text, strategy)) = decoded {
            tracing::info!(
                "Decoded with {} after {} attempt(s) in {:?}",
                strategy,
                attempts.len(),
                started.elapsed()
            );
            return report(request, attempts, DecodeResult::Decoded { text, strategy });
        }

        if deadline_hit {
            tracing::warn!("Request deadline exceeded after {} attempt(s)", attempts.len());
            return report(
                request,
                attempts,
                DecodeResult::failed(ErrorKind::ExternalServiceUnavailable),
            );
        }

        if let (Some(vision), Some(payload)) = (&self.vision, payload) {
            let timeout = match deadline {
                Some(d) => self
                    .vision_timeout
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.vision_timeout,
            };
            let attempt = attempt_vision(vision.as_ref(), &payload, timeout).await;
            tracing::debug!("Attempt {}: {:?}", attempt.strategy, attempt.outcome);
            attempts.push(attempt);
        }

        let result = aggregate(&attempts);
        match &result {
            DecodeResult::Decoded { strategy, .. } => {
                tracing::info!("Decoded with {} in {:?}", strategy, started.elapsed())
            }
            DecodeResult::Failed { kind, .. } => tracing::info!(
                "No code after {} attempt(s) in {:?}: {}",
                attempts.len(),
                started.elapsed(),
                kind
            ),
        }
        report(request, attempts, result)
    }
}

/// Fold the attempt trail into the single final result.
///
/// The first success wins. Otherwise a vision service failure is surfaced
/// as-is; a trail made only of processing errors is a processing error; any
/// other trail means no code was found.
pub fn aggregate(attempts: &[DecodeAttempt]) -> DecodeResult {
    if let Some((text, strategy)) = attempts
        .iter()
        .find_map(|a| a.outcome.text().map(|t| (t.to_string(), a.strategy)))
    {
        return DecodeResult::Decoded { text, strategy };
    }

    if let Some(kind) = attempts.iter().find_map(|a| match &a.outcome {
        AttemptOutcome::ServiceFailure { kind, .. } => Some(*kind),
        _ => None,
    }) {
        return DecodeResult::failed(kind);
    }

    let local: Vec<_> = attempts.iter().filter(|a| a.strategy.is_local()).collect();
    let all_faulted = !local.is_empty()
        && local
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::ProcessingError(_)));
    let vision_saw_image = attempts
        .iter()
        .any(|a| !a.strategy.is_local() && a.outcome == AttemptOutcome::NoCodeFound);

    if all_faulted && !vision_saw_image {
        DecodeResult::failed(ErrorKind::ProcessingError)
    } else {
        DecodeResult::failed(ErrorKind::NoCodeFound)
    }
}

fn report(request: &DecodeRequest, attempts: Vec<DecodeAttempt>, result: DecodeResult) -> DecodeReport {
    DecodeReport {
        token: request.token(),
        attempts,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescan_core::Rotation;

    fn attempt(strategy: StrategyKind, outcome: AttemptOutcome) -> DecodeAttempt {
        DecodeAttempt {
            strategy,
            input: None,
            used_original: false,
            outcome,
        }
    }

    #[test]
    fn test_aggregate_first_success_wins() {
        let attempts = vec![
            attempt(StrategyKind::Raw, AttemptOutcome::NoCodeFound),
            attempt(
                StrategyKind::Rotated(Rotation::Deg90),
                AttemptOutcome::Decoded("A".into()),
            ),
        ];
        assert_eq!(
            aggregate(&attempts),
            DecodeResult::Decoded {
                text: "A".into(),
                strategy: StrategyKind::Rotated(Rotation::Deg90)
            }
        );
    }

    #[test]
    fn test_aggregate_surfaces_quota() {
        let attempts = vec![
            attempt(StrategyKind::Raw, AttemptOutcome::NoCodeFound),
            attempt(
                StrategyKind::VisionFallback,
                AttemptOutcome::ServiceFailure {
                    kind: ErrorKind::QuotaExceeded,
                    message: "429".into(),
                },
            ),
        ];
        assert_eq!(aggregate(&attempts).error_kind(), Some(ErrorKind::QuotaExceeded));
    }

    #[test]
    fn test_aggregate_all_faults_is_processing_error() {
        let attempts = vec![
            attempt(StrategyKind::Raw, AttemptOutcome::ProcessingError("bad".into())),
            attempt(StrategyKind::Optimized, AttemptOutcome::ProcessingError("bad".into())),
        ];
        assert_eq!(aggregate(&attempts).error_kind(), Some(ErrorKind::ProcessingError));
    }

    #[test]
    fn test_aggregate_vision_no_code_overrides_local_faults() {
        let attempts = vec![
            attempt(StrategyKind::Raw, AttemptOutcome::ProcessingError("bad".into())),
            attempt(StrategyKind::VisionFallback, AttemptOutcome::NoCodeFound),
        ];
        assert_eq!(aggregate(&attempts).error_kind(), Some(ErrorKind::NoCodeFound));
    }

    #[test]
    fn test_aggregate_mixed_is_no_code() {
        let attempts = vec![
            attempt(StrategyKind::Raw, AttemptOutcome::ProcessingError("bad".into())),
            attempt(StrategyKind::Optimized, AttemptOutcome::NoCodeFound),
        ];
        assert_eq!(aggregate(&attempts).error_kind(), Some(ErrorKind::NoCodeFound));
    }
}
