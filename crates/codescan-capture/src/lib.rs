//! Live camera capture and continuous local decoding.
//!
//! [`CaptureController`] owns at most one [`CaptureSession`] and exposes the
//! scan state machine to a UI. Camera access goes through [`CaptureBackend`];
//! the `camera` feature provides a native implementation on top of nokhwa.

pub mod controller;
pub mod device;
pub mod error;
#[cfg(feature = "camera")]
pub mod nokhwa_backend;
pub mod session;

pub use controller::{CaptureController, CaptureSettings, CaptureState, ScanCallbacks};
pub use device::{
    CaptureBackend, CaptureStream, DeviceInfo, ResolutionHint, StreamCapabilities, ZoomRange,
    auto_select,
};
pub use error::CaptureError;
#[cfg(feature = "camera")]
pub use nokhwa_backend::NokhwaBackend;
pub use session::CaptureSession;
