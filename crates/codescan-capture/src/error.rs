//! Error types for capture operations.

use codescan_core::ErrorKind;
use thiserror::Error;

use crate::controller::CaptureState;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Camera permission denied")]
    PermissionDenied,

    #[error("No camera device found")]
    NoDeviceFound,

    #[error("Unknown camera device: {0}")]
    UnknownDevice(String),

    #[error("Camera backend error: {0}")]
    Backend(String),

    #[error("Camera stream error: {0}")]
    Stream(String),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CaptureState,
    },
}

impl CaptureError {
    /// Classify for the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::PermissionDenied => ErrorKind::PermissionDenied,
            CaptureError::NoDeviceFound | CaptureError::UnknownDevice(_) => ErrorKind::NoDeviceFound,
            CaptureError::Backend(_)
            | CaptureError::Stream(_)
            | CaptureError::InvalidState { .. } => ErrorKind::ProcessingError,
        }
    }
}
