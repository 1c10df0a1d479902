//! Ownership of one live camera stream.

use image::GrayImage;

use crate::device::{CaptureStream, DeviceInfo};
use crate::error::CaptureError;

/// A stream opened on one device. Releasing is single and idempotent; dropping
/// the session releases it.
pub struct CaptureSession {
    device: DeviceInfo,
    stream: Option<Box<dyn CaptureStream>>,
}

impl CaptureSession {
    pub fn new(device: DeviceInfo, stream: Box<dyn CaptureStream>) -> Self {
        Self {
            device,
            stream: Some(stream),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream_mut(&mut self) -> Option<&mut (dyn CaptureStream + 'static)> {
        self.stream.as_deref_mut()
    }

    pub fn grab_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        match self.stream.as_mut() {
            Some(stream) => stream.grab_frame(),
            None => Err(CaptureError::Stream("session already released".into())),
        }
    }

    /// Stop the stream. Returns `true` if this call released it.
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop();
                tracing::debug!("Released camera stream on {}", self.device.label);
                true
            }
            None => false,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device)
            .field("live", &self.is_live())
            .finish()
    }
}
