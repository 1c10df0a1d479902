//! Core domain types for code decoding.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// User-facing error taxonomy shared by the capture client and the decode service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PermissionDenied,
    NoDeviceFound,
    NoCodeFound,
    ProcessingError,
    ExternalServiceUnavailable,
    /// The vision service refused the call because a usage quota ran out.
    QuotaExceeded,
}

impl ErrorKind {
    /// Wire identifier (kebab-case).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::NoDeviceFound => "no-device-found",
            ErrorKind::NoCodeFound => "no-code-found",
            ErrorKind::ProcessingError => "processing-error",
            ErrorKind::ExternalServiceUnavailable => "external-service-unavailable",
            ErrorKind::QuotaExceeded => "quota-exceeded",
        }
    }

    /// Get display label.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "Camera Permission Denied",
            ErrorKind::NoDeviceFound => "No Camera Found",
            ErrorKind::NoCodeFound => "No Code Found",
            ErrorKind::ProcessingError => "Image Processing Error",
            ErrorKind::ExternalServiceUnavailable => "AI Service Unavailable",
            ErrorKind::QuotaExceeded => "AI Quota Exceeded",
        }
    }

    /// A single actionable sentence to show the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => {
                "Camera access was denied. Allow camera access in your settings and try again."
            }
            ErrorKind::NoDeviceFound => "No camera was found. Connect a camera or upload a photo.",
            ErrorKind::NoCodeFound => {
                "No code found. Ensure the code is well-lit and fully framed, then try again."
            }
            ErrorKind::ProcessingError => {
                "The image could not be processed. Try another photo in JPEG or PNG format."
            }
            ErrorKind::ExternalServiceUnavailable => {
                "AI service unavailable. Please enter the code manually."
            }
            ErrorKind::QuotaExceeded => {
                "AI service quota exceeded. Please enter the code manually."
            }
        }
    }

    /// Whether the failure came from the external vision service.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalServiceUnavailable | ErrorKind::QuotaExceeded
        )
    }

    /// Whether the user must do something (grant access, pick a device, type the
    /// code) before trying again.
    pub fn is_user_actionable(&self) -> bool {
        !matches!(self, ErrorKind::NoCodeFound | ErrorKind::ProcessingError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quarter-turn rotations tried by the rotation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// All rotations in chain order.
    pub fn all() -> &'static [Rotation] {
        &[Rotation::Deg90, Rotation::Deg180, Rotation::Deg270]
    }

    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }
}

/// Identifies one slot in the strategy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Native decode on the untouched upload.
    Raw,
    /// Native decode on the resized/greyscale/normalized/sharpened variant.
    Optimized,
    /// Native decode on a rotation of the optimized variant.
    Rotated(Rotation),
    /// External vision-model fallback.
    VisionFallback,
}

impl StrategyKind {
    /// The full chain in execution order.
    pub fn chain() -> [StrategyKind; 6] {
        [
            StrategyKind::Raw,
            StrategyKind::Optimized,
            StrategyKind::Rotated(Rotation::Deg90),
            StrategyKind::Rotated(Rotation::Deg180),
            StrategyKind::Rotated(Rotation::Deg270),
            StrategyKind::VisionFallback,
        ]
    }

    /// Whether this strategy runs entirely on the local machine.
    pub fn is_local(&self) -> bool {
        !matches!(self, StrategyKind::VisionFallback)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::Raw => "raw",
            StrategyKind::Optimized => "optimized",
            StrategyKind::Rotated(Rotation::Deg90) => "rotate-90",
            StrategyKind::Rotated(Rotation::Deg180) => "rotate-180",
            StrategyKind::Rotated(Rotation::Deg270) => "rotate-270",
            StrategyKind::VisionFallback => "vision-fallback",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of a single strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A code was read.
    Decoded(String),
    /// The image was readable but no code was found in it.
    NoCodeFound,
    /// Preprocessing or the decoder library faulted.
    ProcessingError(String),
    /// The external service failed in a way the user should know about.
    ServiceFailure { kind: ErrorKind, message: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Decoded(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Decoded(text) => Some(text),
            _ => None,
        }
    }
}

/// One strategy execution within a request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeAttempt {
    pub strategy: StrategyKind,
    /// The preprocessed buffer the decoder ran against, `None` for the raw upload.
    pub input: Option<Arc<[u8]>>,
    /// Preprocessing failed and the slot decoded the original bytes instead.
    pub used_original: bool,
    pub outcome: AttemptOutcome,
}

/// The single, final result of one decode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    Decoded {
        text: String,
        strategy: StrategyKind,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl DecodeResult {
    pub fn failed(kind: ErrorKind) -> Self {
        DecodeResult::Failed {
            kind,
            message: kind.user_message().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DecodeResult::Decoded { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            DecodeResult::Decoded { text, .. } => Some(text),
            DecodeResult::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            DecodeResult::Decoded { .. } => None,
            DecodeResult::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Convert to the upload endpoint's response shape.
    pub fn to_response(&self) -> ScanResponse {
        match self {
            DecodeResult::Decoded { text, .. } => ScanResponse::success(text.clone()),
            DecodeResult::Failed { kind, message } => ScanResponse::failure(*kind, message.clone()),
        }
    }
}

/// JSON body returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ScanResponse {
    pub fn success(barcode: String) -> Self {
        Self {
            success: true,
            barcode: Some(barcode),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: String) -> Self {
        Self {
            success: false,
            barcode: None,
            error: Some(message),
            error_kind: Some(kind),
        }
    }
}

/// Unique token naming a request's scratch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(Uuid);

impl RequestToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// One uploaded image awaiting decode. Immutable once created.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    bytes: Arc<[u8]>,
    content_type: String,
    token: RequestToken,
}

impl DecodeRequest {
    pub fn new(bytes: impl Into<Arc<[u8]>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            token: RequestToken::new(),
        }
    }

    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// File extension for the scratch copy of the upload.
    pub fn extension(&self) -> &'static str {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/bmp" | "image/x-ms-bmp" => "bmp",
            "image/tiff" => "tiff",
            "image/heic" | "image/heif" => "heic",
            _ => "bin",
        }
    }
}

/// Final result plus the ordered attempt trail that produced it.
#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub token: RequestToken,
    pub attempts: Vec<DecodeAttempt>,
    pub result: DecodeResult,
}

impl DecodeReport {
    /// Strategy labels and outcomes, in execution order.
    pub fn trail(&self) -> Vec<(StrategyKind, &AttemptOutcome)> {
        self.attempts
            .iter()
            .map(|a| (a.strategy, &a.outcome))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::ExternalServiceUnavailable).unwrap();
        assert_eq!(json, "\"external-service-unavailable\"");
        assert_eq!(ErrorKind::QuotaExceeded.as_str(), "quota-exceeded");
        assert_eq!(ErrorKind::NoCodeFound.to_string(), "no-code-found");
    }

    #[test]
    fn test_error_kind_external_grouping() {
        assert!(ErrorKind::QuotaExceeded.is_external());
        assert!(ErrorKind::ExternalServiceUnavailable.is_external());
        assert!(!ErrorKind::NoCodeFound.is_external());
        assert!(ErrorKind::QuotaExceeded.is_user_actionable());
        assert!(!ErrorKind::ProcessingError.is_user_actionable());
    }

    #[test]
    fn test_strategy_chain_order() {
        let labels: Vec<_> = StrategyKind::chain().iter().map(|s| s.label()).collect();
        assert_eq!(
            labels,
            [
                "raw",
                "optimized",
                "rotate-90",
                "rotate-180",
                "rotate-270",
                "vision-fallback"
            ]
        );
        assert!(!StrategyKind::VisionFallback.is_local());
    }

    #[test]
    fn test_rotation_degrees_roundtrip() {
        for rotation in Rotation::all() {
            assert_eq!(Rotation::from_degrees(rotation.degrees()), Some(*rotation));
        }
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn test_success_response_omits_error_fields() {
        let result = DecodeResult::Decoded {
            text: "012345678905".to_string(),
            strategy: StrategyKind::Raw,
        };
        let json = serde_json::to_value(result.to_response()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": true, "barcode": "012345678905" })
        );
    }

    #[test]
    fn test_failure_response_carries_message_and_kind() {
        let result = DecodeResult::failed(ErrorKind::NoCodeFound);
        let json = serde_json::to_value(result.to_response()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorKind"], "no-code-found");
        assert_eq!(json["error"], ErrorKind::NoCodeFound.user_message());
        assert!(json.get("barcode").is_none());
    }

    #[test]
    fn test_request_extension_from_content_type() {
        assert_eq!(DecodeRequest::new(Vec::<u8>::new(), "image/jpeg").extension(), "jpg");
        assert_eq!(
            DecodeRequest::new(Vec::<u8>::new(), "image/PNG; charset=binary").extension(),
            "png"
        );
        assert_eq!(
            DecodeRequest::new(Vec::<u8>::new(), "application/octet-stream").extension(),
            "bin"
        );
    }

    #[test]
    fn test_request_tokens_are_unique() {
        let a = DecodeRequest::new(vec![1u8, 2, 3], "image/png");
        let b = DecodeRequest::new(vec![1u8, 2, 3], "image/png");
        assert_ne!(a.token(), b.token());
        assert_eq!(a.token().to_string().len(), 32);
    }
}
