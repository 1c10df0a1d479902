//! Capture device abstraction.
//!
//! A [`CaptureBackend`] lists devices and opens streams; a [`CaptureStream`]
//! yields greyscale frames until stopped. The controller only ever talks to
//! these traits, so tests can substitute a mock camera.

use image::GrayImage;
use serde::Serialize;

use crate::error::CaptureError;

/// One enumerated camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "deviceId")]
    pub id: String,
    pub label: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Whether the label suggests a rear-facing camera.
    pub fn is_rear_facing(&self) -> bool {
        let label = self.label.to_lowercase();
        ["back", "rear", "environment"]
            .iter()
            .any(|hint| label.contains(hint))
    }
}

/// Requested stream resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionHint {
    pub min_width: u32,
    pub min_height: u32,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for ResolutionHint {
    fn default() -> Self {
        Self {
            min_width: 640,
            min_height: 480,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomRange {
    pub min: f64,
    pub max: f64,
}

impl ZoomRange {
    pub fn clamp(&self, zoom: f64) -> f64 {
        zoom.clamp(self.min, self.max)
    }
}

/// Optional tuning a stream supports.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamCapabilities {
    pub autofocus: bool,
    pub zoom: Option<ZoomRange>,
}

/// A live camera stream.
pub trait CaptureStream {
    fn capabilities(&self) -> StreamCapabilities;

    fn enable_continuous_autofocus(&mut self) -> Result<(), CaptureError>;

    fn set_zoom(&mut self, zoom: f64) -> Result<(), CaptureError>;

    /// Next frame, or `None` if none is ready yet.
    fn grab_frame(&mut self) -> Result<Option<GrayImage>, CaptureError>;

    /// Stop the stream and release the hardware. Called exactly once.
    fn stop(&mut self);
}

/// Platform camera access.
pub trait CaptureBackend {
    /// Ask the platform for camera access. `Ok(false)` means denied.
    fn request_permission(&mut self) -> Result<bool, CaptureError>;

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>, CaptureError>;

    fn open_stream(
        &mut self,
        device: &DeviceInfo,
        hint: &ResolutionHint,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// Prefer a rear-facing camera, otherwise the last enumerated one.
pub fn auto_select(devices: &[DeviceInfo]) -> Option<usize> {
    devices
        .iter()
        .position(DeviceInfo::is_rear_facing)
        .or_else(|| devices.len().checked_sub(1))
}
