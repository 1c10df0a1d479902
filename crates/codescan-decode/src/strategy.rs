//! Decode strategies.
//!
//! The chain is the closed set in [`StrategyKind::chain`]. Local strategies run
//! synchronously through [`LocalChain::attempt`]; the vision fallback is async
//! and lives in [`attempt_vision`].

use codescan_core::{
    AttemptOutcome, CodeReader, DecodeAttempt, ImagePreprocessor, Rotation, ScratchHandle,
    ScratchScope, StrategyKind, preprocess,
};
use image::GrayImage;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::error::VisionError;
use crate::vision::{VisionModel, VisionPayload};

/// State shared by the local strategies of one request.
///
/// Owns the request's scratch scope; dropping the chain deletes every file it
/// created.
pub struct LocalChain<'a> {
    preprocessor: &'a ImagePreprocessor,
    reader: &'a dyn CodeReader,
    scope: ScratchScope,
    raw: ScratchHandle,
    /// Optimized variant, computed once on first use.
    optimized: Option<Result<GrayImage, String>>,
}

impl<'a> LocalChain<'a> {
    /// Takes ownership of `scope`; `raw` must have been acquired from it.
    pub fn new(
        preprocessor: &'a ImagePreprocessor,
        reader: &'a dyn CodeReader,
        scope: ScratchScope,
        raw: ScratchHandle,
    ) -> Self {
        Self {
            preprocessor,
            reader,
            scope,
            raw,
            optimized: None,
        }
    }

    pub fn scope(&self) -> &ScratchScope {
        &self.scope
    }

    /// Hand the scope back, e.g. to keep it alive across the vision call.
    pub fn into_scope(self) -> ScratchScope {
        self.scope
    }

    /// Run one local strategy. Panics inside preprocessing or the reader are
    /// caught and reported as a processing error.
    pub fn attempt(&mut self, kind: StrategyKind) -> DecodeAttempt {
        match catch_unwind(AssertUnwindSafe(|| self.run(kind))) {
            Ok(attempt) => attempt,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!("Strategy {} panicked: {}", kind, message);
                DecodeAttempt {
                    strategy: kind,
                    input: None,
                    used_original: false,
                    outcome: AttemptOutcome::ProcessingError(format!("decoder panicked: {}", message)),
                }
            }
        }
    }

    fn run(&mut self, kind: StrategyKind) -> DecodeAttempt {
        match kind {
            StrategyKind::Raw => {
                let raw = self.raw.clone();
                DecodeAttempt {
                    strategy: kind,
                    input: None,
                    used_original: false,
                    outcome: self.decode_handle(&raw),
                }
            }
            StrategyKind::Optimized => match self.optimized_image() {
                Ok(gray) => {
                    let gray = gray.clone();
                    self.attempt_variant(kind, "optimized", &gray)
                }
                Err(reason) => self.attempt_original(kind, &reason),
            },
            StrategyKind::Rotated(rotation) => match self.rotation_base() {
                Ok(base) => {
                    let rotated = self.preprocessor.rotate_image(&base, rotation);
                    self.attempt_variant(kind, rotation_label(rotation), &rotated)
                }
                Err(reason) => self.attempt_original(kind, &reason),
            },
            StrategyKind::VisionFallback => DecodeAttempt {
                strategy: kind,
                input: None,
                used_original: false,
                outcome: AttemptOutcome::ProcessingError(
                    "vision fallback is not a local strategy".to_string(),
                ),
            },
        }
    }

    /// Build the vision payload: the optimized variant as JPEG, or the original
    /// upload when optimization failed.
    pub fn vision_payload(&mut self, content_type: &str) -> Result<VisionPayload, String> {
        if let Ok(gray) = self.optimized_image() {
            let gray = gray.clone();
            if let Ok(jpeg) = self.preprocessor.encode_for_transport(&gray) {
                return Ok(VisionPayload::new(jpeg, "image/jpeg"));
            }
        }
        let raw = self.raw.clone();
        let bytes = self.scope.read(&raw).map_err(|e| e.to_string())?;
        Ok(VisionPayload::new(bytes, content_type))
    }

    fn optimized_image(&mut self) -> Result<&GrayImage, String> {
        if self.optimized.is_none() {
            let computed = self
                .scope
                .read(&self.raw)
                .map_err(|e| e.to_string())
                .and_then(|bytes| self.preprocessor.load(&bytes).map_err(|e| e.to_string()))
                .map(|img| self.preprocessor.optimize_image(&img));
            self.optimized = Some(computed);
        }
        match &self.optimized {
            Some(Ok(gray)) => Ok(gray),
            Some(Err(reason)) => Err(reason.clone()),
            None => Err("optimized variant unavailable".to_string()),
        }
    }

    /// Rotations work on the optimized image, or on the plain greyscale upload
    /// if optimization failed.
    fn rotation_base(&mut self) -> Result<GrayImage, String> {
        if let Ok(gray) = self.optimized_image() {
            return Ok(gray.clone());
        }
        let bytes = self.scope.read(&self.raw).map_err(|e| e.to_string())?;
        self.preprocessor
            .load(&bytes)
            .map(|img| img.to_luma8())
            .map_err(|e| e.to_string())
    }

    fn attempt_variant(&mut self, kind: StrategyKind, label: &str, gray: &GrayImage) -> DecodeAttempt {
        let encoded = match preprocess::encode_png(gray) {
            Ok(bytes) => bytes,
            Err(e) => return self.attempt_original(kind, &e.to_string()),
        };

        let outcome = match self.scope.acquire(label, "png", &encoded) {
            Ok(handle) => {
                let outcome = self.decode_handle(&handle);
                self.scope.release(&handle);
                outcome
            }
            Err(e) => AttemptOutcome::ProcessingError(e.to_string()),
        };

        DecodeAttempt {
            strategy: kind,
            input: Some(Arc::from(encoded)),
            used_original: false,
            outcome,
        }
    }

    fn attempt_original(&mut self, kind: StrategyKind, reason: &str) -> DecodeAttempt {
        tracing::debug!("Preprocessing for {} failed ({}), decoding original", kind, reason);
        let raw = self.raw.clone();
        DecodeAttempt {
            strategy: kind,
            input: None,
            used_original: true,
            outcome: self.decode_handle(&raw),
        }
    }

    fn decode_handle(&self, handle: &ScratchHandle) -> AttemptOutcome {
        let bytes = match self.scope.read(handle) {
            Ok(bytes) => bytes,
            Err(e) => return AttemptOutcome::ProcessingError(e.to_string()),
        };
        let gray = match self.preprocessor.load(&bytes) {
            Ok(img) => img.to_luma8(),
            Err(e) => return AttemptOutcome::ProcessingError(e.to_string()),
        };
        match self.reader.read(&gray) {
            Some(code) => {
                tracing::debug!("{} reader found {} code", self.reader.name(), code.symbology);
                AttemptOutcome::Decoded(code.text)
            }
            None => AttemptOutcome::NoCodeFound,
        }
    }
}

/// Run the vision fallback once, bounded by `timeout`.
pub async fn attempt_vision(
    model: &dyn VisionModel,
    payload: &VisionPayload,
    timeout: Duration,
) -> DecodeAttempt {
    let result = match tokio::time::timeout(timeout, model.read_code(payload)).await {
        Ok(result) => result,
        Err(_) => Err(VisionError::Timeout(timeout)),
    };

    let outcome = match result {
        Ok(Some(text)) => AttemptOutcome::Decoded(text),
        Ok(None) => AttemptOutcome::NoCodeFound,
        Err(e) => {
            tracing::warn!("Vision model {} failed: {}", model.name(), e);
            AttemptOutcome::ServiceFailure {
                kind: e.kind(),
                message: e.to_string(),
            }
        }
    };

    DecodeAttempt {
        strategy: StrategyKind::VisionFallback,
        input: Some(Arc::from(payload.bytes.as_slice())),
        used_original: false,
        outcome,
    }
}

fn rotation_label(rotation: Rotation) -> &'static str {
    match rotation {
        Rotation::Deg90 => "rotate-90",
        Rotation::Deg180 => "rotate-180",
        Rotation::Deg270 => "rotate-270",
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescan_core::{DecodedCode, RequestToken, ScratchArea};
    use image::Luma;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReader {
        calls: AtomicUsize,
    }

    impl CodeReader for CountingReader {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn read(&self, _image: &GrayImage) -> Option<DecodedCode> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    struct PanickingReader;

    impl CodeReader for PanickingReader {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn read(&self, _image: &GrayImage) -> Option<DecodedCode> {
            panic!("reader blew up");
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        preprocess::encode_png(&GrayImage::from_fn(width, height, |x, _| {
            Luma([if x % 2 == 0 { 0 } else { 255 }])
        }))
        .unwrap()
    }

    fn open_scope(bytes: &[u8]) -> (tempfile::TempDir, ScratchArea, ScratchScope, ScratchHandle) {
        let tmp = tempfile::tempdir().unwrap();
        let area = ScratchArea::new(tmp.path()).unwrap();
        let mut scope = area.scope(RequestToken::new()).unwrap();
        let raw = scope.acquire("raw", "png", bytes).unwrap();
        (tmp, area, scope, raw)
    }

    #[test]
    fn test_variants_are_released_after_each_attempt() {
        let (_tmp, area, scope, raw) = open_scope(&png(20, 10));
        let pre = ImagePreprocessor::default();
        let reader = CountingReader {
            calls: AtomicUsize::new(0),
        };
        let mut chain = LocalChain::new(&pre, &reader, scope, raw);

        for kind in StrategyKind::chain().into_iter().filter(|k| k.is_local()) {
            let attempt = chain.attempt(kind);
            assert_eq!(attempt.outcome, AttemptOutcome::NoCodeFound);
            assert_eq!(chain.scope().live_count(), 1, "only the raw upload stays live");
        }
        assert_eq!(reader.calls.load(Ordering::SeqCst), 5);

        drop(chain);
        assert_eq!(area.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_rotated_variant_has_swapped_dimensions() {
        let (_tmp, _area, scope, raw) = open_scope(&png(20, 10));
        let pre = ImagePreprocessor::default();
        let reader = CountingReader {
            calls: AtomicUsize::new(0),
        };
        let mut chain = LocalChain::new(&pre, &reader, scope, raw);

        let attempt = chain.attempt(StrategyKind::Rotated(Rotation::Deg90));
        let input = attempt.input.unwrap();
        let img = image::load_from_memory(&input).unwrap();
        assert_eq!((img.width(), img.height()), (10, 20));
    }

    #[test]
    fn test_corrupt_upload_falls_back_to_original() {
        let (_tmp, _area, scope, raw) = open_scope(b"not an image");
        let pre = ImagePreprocessor::default();
        let reader = CountingReader {
            calls: AtomicUsize::new(0),
        };
        let mut chain = LocalChain::new(&pre, &reader, scope, raw);

        let attempt = chain.attempt(StrategyKind::Optimized);
        assert!(attempt.used_original);
        assert!(attempt.input.is_none());
        assert!(matches!(attempt.outcome, AttemptOutcome::ProcessingError(_)));
        assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reader_panic_becomes_processing_error() {
        let (_tmp, area, scope, raw) = open_scope(&png(8, 8));
        let pre = ImagePreprocessor::default();
        let mut chain = LocalChain::new(&pre, &PanickingReader, scope, raw);

        let attempt = chain.attempt(StrategyKind::Optimized);
        match attempt.outcome {
            AttemptOutcome::ProcessingError(msg) => assert!(msg.contains("reader blew up")),
            other => panic!("unexpected outcome {:?}", other),
        }

        drop(chain);
        assert_eq!(area.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_vision_payload_prefers_optimized_jpeg() {
        let (_tmp, _area, scope, raw) = open_scope(&png(16, 16));
        let pre = ImagePreprocessor::default();
        let reader = CountingReader {
            calls: AtomicUsize::new(0),
        };
        let mut chain = LocalChain::new(&pre, &reader, scope, raw);

        let payload = chain.vision_payload("image/png").unwrap();
        assert_eq!(payload.mime_type, "image/jpeg");
        assert_eq!(&payload.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_vision_payload_falls_back_to_upload() {
        let (_tmp, _area, scope, raw) = open_scope(b"opaque heic bytes");
        let pre = ImagePreprocessor::default();
        let reader = CountingReader {
            calls: AtomicUsize::new(0),
        };
        let mut chain = LocalChain::new(&pre, &reader, scope, raw);

        let payload = chain.vision_payload("image/heic").unwrap();
        assert_eq!(payload.mime_type, "image/heic");
        assert_eq!(payload.bytes, b"opaque heic bytes");
    }
}
