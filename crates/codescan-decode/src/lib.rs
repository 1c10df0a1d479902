//! Strategy-chain decoding for uploaded images.
//!
//! [`DecodeOrchestrator`] runs the local strategies (raw, optimized, three
//! rotations) on a blocking thread and finishes with the optional vision-model
//! fallback. Every request resolves to exactly one [`DecodeReport`].
//!
//! [`DecodeReport`]: codescan_core::DecodeReport

pub mod error;
pub mod orchestrator;
pub mod strategy;
pub mod vision;

pub use error::{ServiceError, VisionError};
pub use orchestrator::{DecodeOrchestrator, aggregate};
pub use strategy::{LocalChain, attempt_vision};
pub use vision::{HttpVisionModel, VisionModel, VisionPayload, parse_reply};
