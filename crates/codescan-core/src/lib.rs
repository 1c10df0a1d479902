//! Core domain logic for optical code decoding.
//!
//! This crate provides:
//! - Domain types and the error taxonomy (`types` module)
//! - Deterministic image preprocessing (`preprocess` module)
//! - Native code reading on greyscale images (`reader` module)
//! - Request-scoped scratch files (`scratch` module)
//! - Service configuration (`config` module)

pub mod config;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod preprocess;
pub mod reader;
pub mod scratch;
pub mod types;

pub use config::{ConfigError, ServiceConfig, VisionConfig, load_config};
pub use preprocess::{ImagePreprocessor, PreprocessConfig, PreprocessError};
pub use reader::{CodeReader, DecodedCode, NativeReader};
pub use scratch::{ScratchArea, ScratchError, ScratchHandle, ScratchScope};
pub use types::*;
