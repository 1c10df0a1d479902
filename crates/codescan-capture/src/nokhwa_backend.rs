//! Native camera access through nokhwa.

use image::GrayImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, ControlValueDescription, ControlValueSetter,
    FrameFormat, KnownCameraControl, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::{Camera, nokhwa_initialize};
use std::sync::mpsc;
use std::time::Duration;

use crate::device::{
    CaptureBackend, CaptureStream, DeviceInfo, ResolutionHint, StreamCapabilities, ZoomRange,
};
use crate::error::CaptureError;

/// How long to wait for the platform permission prompt.
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for NokhwaBackend {
    fn request_permission(&mut self) -> Result<bool, CaptureError> {
        let (tx, rx) = mpsc::channel();
        nokhwa_initialize(move |granted| {
            let _ = tx.send(granted);
        });
        rx.recv_timeout(PERMISSION_TIMEOUT)
            .map_err(|e| CaptureError::Backend(format!("No permission answer: {}", e)))
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| CaptureError::Backend(format!("Failed to list cameras: {}", e)))?;
        Ok(cameras
            .iter()
            .map(|info| DeviceInfo::new(info.index().as_string(), info.human_name()))
            .collect())
    }

    fn open_stream(
        &mut self,
        device: &DeviceInfo,
        hint: &ResolutionHint,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let index = match device.id.parse::<u32>() {
            Ok(i) => CameraIndex::Index(i),
            Err(_) => CameraIndex::String(device.id.clone()),
        };

        // Preferred formats first; the camera's own default last.
        let formats_to_try = [
            closest(hint.ideal_width, hint.ideal_height, FrameFormat::MJPEG),
            closest(hint.ideal_width, hint.ideal_height, FrameFormat::YUYV),
            closest(hint.min_width, hint.min_height, FrameFormat::MJPEG),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ];

        let mut last_error = String::new();
        let mut camera = None;
        for (i, requested) in formats_to_try.iter().enumerate() {
            match Camera::new(index.clone(), *requested) {
                Ok(cam) => {
                    camera = Some(cam);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Camera format {}/{} failed: {}", i + 1, formats_to_try.len(), e);
                    last_error = e.to_string();
                }
            }
        }
        let mut camera = camera.ok_or_else(|| {
            CaptureError::Stream(format!(
                "Failed to open {} with any format: {}",
                device.label, last_error
            ))
        })?;

        camera
            .open_stream()
            .map_err(|e| CaptureError::Stream(format!("Failed to start camera stream: {}", e)))?;

        let resolution = camera.resolution();
        if resolution.width() < hint.min_width || resolution.height() < hint.min_height {
            tracing::warn!(
                "Camera resolution {}x{} is below the requested minimum {}x{}",
                resolution.width(),
                resolution.height(),
                hint.min_width,
                hint.min_height
            );
        }
        tracing::info!("Camera opened: {} at {:?}", device.label, resolution);

        Ok(Box::new(NokhwaStream {
            camera,
            stopped: false,
        }))
    }
}

fn closest(width: u32, height: u32, format: FrameFormat) -> RequestedFormat<'static> {
    RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
        Resolution::new(width, height),
        format,
        30,
    )))
}

struct NokhwaStream {
    camera: Camera,
    stopped: bool,
}

impl NokhwaStream {
    fn zoom_control(&self) -> Option<ZoomControl> {
        let control = self.camera.camera_control(KnownCameraControl::Zoom).ok()?;
        match control.description() {
            ControlValueDescription::IntegerRange { min, max, .. } => ZoomControl::new(*min, *max),
            _ => None,
        }
    }
}

impl CaptureStream for NokhwaStream {
    fn capabilities(&self) -> StreamCapabilities {
        let autofocus = autofocus_control()
            .is_some_and(|control| self.camera.camera_control(control).is_ok());
        let zoom = self.zoom_control().map(|control| control.factor_range());
        StreamCapabilities { autofocus, zoom }
    }

    fn enable_continuous_autofocus(&mut self) -> Result<(), CaptureError> {
        let control = autofocus_control()
            .ok_or_else(|| CaptureError::Stream("no auto-focus control on this platform".into()))?;
        self.camera
            .set_camera_control(control, ControlValueSetter::Boolean(true))
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }

    fn set_zoom(&mut self, zoom: f64) -> Result<(), CaptureError> {
        let control = self
            .zoom_control()
            .ok_or_else(|| CaptureError::Stream("camera has no zoom control".into()))?;
        let steps = control.steps_for(zoom);
        tracing::debug!("Zoom {:.2}x -> control value {}", zoom, steps);
        self.camera
            .set_camera_control(KnownCameraControl::Zoom, ControlValueSetter::Integer(steps))
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }

    fn grab_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| CaptureError::Stream(format!("Frame capture error: {}", e)))?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Stream(format!("Frame decode error: {}", e)))?;

        let width = decoded.width();
        let height = decoded.height();
        Ok(rgb_to_luma(width, height, &decoded.into_raw()))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        }
    }
}

impl Drop for NokhwaStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// V4L2 `V4L2_CID_FOCUS_AUTO`.
#[cfg(target_os = "linux")]
const V4L2_CID_FOCUS_AUTO: u128 = 0x009a_090c;

/// The continuous auto-focus switch, where the platform exposes one.
fn autofocus_control() -> Option<KnownCameraControl> {
    #[cfg(target_os = "linux")]
    {
        Some(KnownCameraControl::Other(V4L2_CID_FOCUS_AUTO))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Zoom factor assumed for the top of a range whose minimum is zero.
const NOMINAL_MAX_ZOOM: f64 = 4.0;

/// A camera's absolute zoom control, in raw steps.
///
/// The minimum step is 1x. With a positive minimum the steps scale linearly
/// from zero (UVC cameras commonly report 100..=500 for 1x..5x); a range
/// starting at zero is spread over `1x..=NOMINAL_MAX_ZOOM`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ZoomControl {
    min: i64,
    max: i64,
}

impl ZoomControl {
    fn new(min: i64, max: i64) -> Option<Self> {
        (max > min && min >= 0).then_some(Self { min, max })
    }

    fn max_factor(&self) -> f64 {
        if self.min > 0 {
            self.max as f64 / self.min as f64
        } else {
            NOMINAL_MAX_ZOOM
        }
    }

    fn factor_range(&self) -> ZoomRange {
        ZoomRange {
            min: 1.0,
            max: self.max_factor(),
        }
    }

    fn steps_for(&self, factor: f64) -> i64 {
        let factor = factor.clamp(1.0, self.max_factor());
        let steps = if self.min > 0 {
            self.min as f64 * factor
        } else {
            (factor - 1.0) / (NOMINAL_MAX_ZOOM - 1.0) * self.max as f64
        };
        (steps.round() as i64).clamp(self.min, self.max)
    }
}

/// Y = 0.299 R + 0.587 G + 0.114 B
fn rgb_to_luma(width: u32, height: u32, rgb: &[u8]) -> Option<GrayImage> {
    let gray: Vec<u8> = rgb
        .chunks_exact(3)
        .map(|c| ((c[0] as u32 * 299 + c[1] as u32 * 587 + c[2] as u32 * 114) / 1000) as u8)
        .collect();
    GrayImage::from_raw(width, height, gray)
}
