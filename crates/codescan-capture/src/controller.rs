//! Live camera scanning state machine.
//!
//! ```text
//! Idle -> Initializing -> Ready -> Scanning -> Found -> Idle
//!              |            ^         |
//!              v            |         +-> Cancelled -> Idle
//!      PermissionDenied     +------ Error
//! ```
//!
//! The controller is driven from a single thread: the caller invokes
//! [`CaptureController::poll`] once per frame tick. Every call returns after at
//! most one frame decode. Stopping, closing or switching devices releases the
//! stream before the call returns.

use codescan_core::{CodeReader, ErrorKind};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::device::{CaptureBackend, DeviceInfo, ResolutionHint, auto_select};
use crate::error::CaptureError;
use crate::session::CaptureSession;

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    Idle,
    Initializing,
    /// Terminal until [`CaptureController::reset_permission`].
    PermissionDenied,
    Ready,
    Scanning,
    Found,
    Cancelled,
    Error,
}

impl CaptureState {
    pub fn label(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Initializing => "initializing",
            CaptureState::PermissionDenied => "permission-denied",
            CaptureState::Ready => "ready",
            CaptureState::Scanning => "scanning",
            CaptureState::Found => "found",
            CaptureState::Cancelled => "cancelled",
            CaptureState::Error => "error",
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub resolution: ResolutionHint,
    /// Zoom factor (1.0 = none) requested when the stream supports it, clamped to its range.
    pub zoom: f64,
    /// Consecutive failed frames (grab errors or reader panics) tolerated before
    /// the session errors out.
    pub max_consecutive_frame_errors: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution: ResolutionHint::default(),
            zoom: 1.5,
            max_consecutive_frame_errors: 30,
        }
    }
}

/// Hooks the UI registers with the controller.
pub struct ScanCallbacks {
    on_scan: Box<dyn FnMut(&str)>,
    on_close: Box<dyn FnMut()>,
    on_state: Option<Box<dyn FnMut(CaptureState)>>,
}

impl ScanCallbacks {
    pub fn new(on_scan: impl FnMut(&str) + 'static, on_close: impl FnMut() + 'static) -> Self {
        Self {
            on_scan: Box::new(on_scan),
            on_close: Box::new(on_close),
            on_state: None,
        }
    }

    /// Observe every state transition.
    pub fn with_state_observer(mut self, on_state: impl FnMut(CaptureState) + 'static) -> Self {
        self.on_state = Some(Box::new(on_state));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Unknown,
    Granted,
    Denied,
}

pub struct CaptureController<B: CaptureBackend> {
    backend: B,
    reader: Arc<dyn CodeReader>,
    settings: CaptureSettings,
    callbacks: ScanCallbacks,
    state: CaptureState,
    permission: Permission,
    devices: Vec<DeviceInfo>,
    selected: Option<usize>,
    session: Option<CaptureSession>,
    last_error: Option<ErrorKind>,
    frame_errors: u32,
    closed: bool,
}

impl<B: CaptureBackend> CaptureController<B> {
    pub fn new(backend: B, reader: Arc<dyn CodeReader>, callbacks: ScanCallbacks) -> Self {
        Self {
            backend,
            reader,
            settings: CaptureSettings::default(),
            callbacks,
            state: CaptureState::Idle,
            permission: Permission::Unknown,
            devices: Vec::new(),
            selected: None,
            session: None,
            last_error: None,
            frame_errors: 0,
            closed: false,
        }
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn selected_device(&self) -> Option<&DeviceInfo> {
        self.selected.and_then(|i| self.devices.get(i))
    }

    pub fn is_streaming(&self) -> bool {
        self.session.as_ref().is_some_and(CaptureSession::is_live)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Request permission (once), enumerate devices and auto-select one.
    pub fn open(&mut self) -> Result<(), CaptureError> {
        match self.state {
            CaptureState::Idle => {}
            CaptureState::PermissionDenied => return Err(CaptureError::PermissionDenied),
            state => {
                return Err(CaptureError::InvalidState {
                    operation: "open",
                    state,
                });
            }
        }
        self.closed = false;
        self.set_state(CaptureState::Initializing);

        if self.permission == Permission::Unknown {
            let granted = match self.backend.request_permission() {
                Ok(granted) => granted,
                Err(e) => return Err(self.fail(e)),
            };
            self.permission = if granted {
                Permission::Granted
            } else {
                Permission::Denied
            };
        }
        if self.permission == Permission::Denied {
            tracing::warn!("Camera permission denied");
            self.last_error = Some(ErrorKind::PermissionDenied);
            self.set_state(CaptureState::PermissionDenied);
            return Err(CaptureError::PermissionDenied);
        }

        let devices = match self.backend.enumerate_devices() {
            Ok(devices) => devices,
            Err(e) => return Err(self.fail(e)),
        };
        if devices.is_empty() {
            return Err(self.fail(CaptureError::NoDeviceFound));
        }

        // Keep the user's earlier choice if that device is still present.
        let previous = self.selected_device().map(|d| d.id.clone());
        self.selected = previous
            .and_then(|id| devices.iter().position(|d| d.id == id))
            .or_else(|| auto_select(&devices));
        self.devices = devices;

        if let Some(device) = self.selected_device() {
            tracing::info!(
                "Found {} camera(s), selected {}",
                self.devices.len(),
                device.label
            );
        }
        self.last_error = None;
        self.set_state(CaptureState::Ready);
        Ok(())
    }

    /// Switch device. Any live stream is released first.
    pub fn select_device(&mut self, id: &str) -> Result<(), CaptureError> {
        let index = self
            .devices
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| CaptureError::UnknownDevice(id.to_string()))?;

        match self.state {
            CaptureState::Ready | CaptureState::Error => {}
            CaptureState::Scanning => {
                self.release_session();
                self.set_state(CaptureState::Cancelled);
            }
            state => {
                return Err(CaptureError::InvalidState {
                    operation: "select a device",
                    state,
                });
            }
        }

        self.selected = Some(index);
        self.last_error = None;
        self.set_state(CaptureState::Ready);
        Ok(())
    }

    /// Open a stream on the selected device and begin scanning. A running
    /// session is torn down first.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state {
            CaptureState::Ready => {}
            CaptureState::Scanning => {
                self.release_session();
                self.set_state(CaptureState::Ready);
            }
            state => {
                return Err(CaptureError::InvalidState {
                    operation: "start",
                    state,
                });
            }
        }

        let Some(device) = self.selected_device().cloned() else {
            return Err(self.fail(CaptureError::NoDeviceFound));
        };

        let mut stream = match self
            .backend
            .open_stream(&device, &self.settings.resolution)
        {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };

        let capabilities = stream.capabilities();
        if capabilities.autofocus
            && let Err(e) = stream.enable_continuous_autofocus()
        {
            tracing::warn!("Continuous autofocus unavailable: {}", e);
        }
        if let Some(range) = capabilities.zoom {
            let zoom = range.clamp(self.settings.zoom);
            if let Err(e) = stream.set_zoom(zoom) {
                tracing::warn!("Failed to set zoom {:.2}: {}", zoom, e);
            }
        }

        tracing::info!("Scanning on {}", device.label);
        self.session = Some(CaptureSession::new(device, stream));
        self.frame_errors = 0;
        self.set_state(CaptureState::Scanning);
        Ok(())
    }

    /// Grab and decode one frame. Returns the text once, when a code is found.
    pub fn poll(&mut self) -> Option<String> {
        if self.state != CaptureState::Scanning {
            return None;
        }
        let session = self.session.as_mut()?;

        let frame = match session.grab_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                self.frame_failed(&format!("Frame capture error: {}", e));
                return None;
            }
        };

        let reader = &self.reader;
        let code = match catch_unwind(AssertUnwindSafe(|| reader.read(&frame))) {
            Ok(code) => {
                self.frame_errors = 0;
                code?
            }
            Err(_) => {
                let reason = format!("{} reader panicked on a live frame", reader.name());
                self.frame_failed(&reason);
                return None;
            }
        };
        tracing::info!("Decoded {} code from live frame", code.symbology);

        self.release_session();
        self.set_state(CaptureState::Found);
        (self.callbacks.on_scan)(&code.text);
        self.set_state(CaptureState::Idle);
        Some(code.text)
    }

    /// Too many failures in a row end the session.
    fn frame_failed(&mut self, reason: &str) {
        self.frame_errors += 1;
        tracing::warn!("{} ({} in a row)", reason, self.frame_errors);
        if self.frame_errors > self.settings.max_consecutive_frame_errors {
            self.release_session();
            self.last_error = Some(ErrorKind::ProcessingError);
            self.set_state(CaptureState::Error);
        }
    }

    /// Stop scanning and release the camera immediately.
    pub fn stop(&mut self) {
        match self.state {
            CaptureState::Scanning => {
                self.release_session();
                self.set_state(CaptureState::Cancelled);
                self.set_state(CaptureState::Idle);
            }
            CaptureState::Ready | CaptureState::Error => {
                self.release_session();
                self.set_state(CaptureState::Idle);
            }
            _ => {}
        }
    }

    /// The UI is closing: stop and notify the owner once.
    pub fn close(&mut self) {
        self.stop();
        if !self.closed {
            self.closed = true;
            (self.callbacks.on_close)();
        }
    }

    /// Acknowledge a recoverable error.
    pub fn dismiss_error(&mut self) {
        if self.state != CaptureState::Error {
            return;
        }
        self.last_error = None;
        if self.selected_device().is_some() {
            self.set_state(CaptureState::Ready);
        } else {
            self.set_state(CaptureState::Idle);
        }
    }

    /// Forget a denied permission so the next [`open`](Self::open) asks again.
    pub fn reset_permission(&mut self) {
        self.permission = Permission::Unknown;
        if self.state == CaptureState::PermissionDenied {
            self.last_error = None;
            self.set_state(CaptureState::Idle);
        }
    }

    fn fail(&mut self, error: CaptureError) -> CaptureError {
        tracing::warn!("Capture failed: {}", error);
        self.release_session();
        self.last_error = Some(error.kind());
        self.set_state(CaptureState::Error);
        error
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Capture state {} -> {}", self.state, state);
        self.state = state;
        if let Some(on_state) = self.callbacks.on_state.as_mut() {
            on_state(state);
        }
    }
}

impl<B: CaptureBackend> Drop for CaptureController<B> {
    fn drop(&mut self) {
        self.release_session();
    }
}
