//! Error types for decode operations.

use codescan_core::{ErrorKind, ScratchError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Vision fallback is not configured (missing API key)")]
    NotConfigured,

    #[error("Vision service timed out after {0:?}")]
    Timeout(Duration),

    #[error("Vision service unavailable: {0}")]
    Unavailable(String),

    #[error("Vision service quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unexpected vision service response: {0}")]
    InvalidResponse(String),
}

impl VisionError {
    /// Classify for the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VisionError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            VisionError::NotConfigured
            | VisionError::Timeout(_)
            | VisionError::Unavailable(_)
            | VisionError::InvalidResponse(_) => ErrorKind::ExternalServiceUnavailable,
        }
    }
}

impl From<reqwest::Error> for VisionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            VisionError::InvalidResponse(e.to_string())
        } else {
            VisionError::Unavailable(e.to_string())
        }
    }
}

/// Errors raised while building the decode service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Scratch area error: {0}")]
    Scratch(#[from] ScratchError),

    #[error("Vision client error: {0}")]
    Vision(#[from] VisionError),
}
