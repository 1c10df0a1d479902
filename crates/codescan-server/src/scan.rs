//! Live camera scanning from the terminal.

use codescan_capture::{CaptureController, CaptureState, NokhwaBackend, ScanCallbacks};
use codescan_core::NativeReader;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Pause between frame polls.
const POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Drive the capture controller until a code is found or Ctrl+C.
pub fn run_scan(list: bool, device: Option<&str>) -> Result<()> {
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let callbacks = ScanCallbacks::new(
        |code| println!("{}", code),
        || tracing::info!("Scanner closed"),
    )
    .with_state_observer(|state| tracing::debug!("Scanner state: {}", state));

    let mut controller = CaptureController::new(
        NokhwaBackend::new(),
        Arc::new(NativeReader::default()),
        callbacks,
    );

    controller.open()?;

    if list {
        println!("{}", serde_json::to_string_pretty(controller.devices())?);
        controller.close();
        return Ok(());
    }

    if let Some(id) = device {
        controller.select_device(id)?;
    }
    controller.start()?;
    eprintln!("Scanning... press Ctrl+C to stop");

    let found = loop {
        if cancelled.load(Ordering::SeqCst) {
            break None;
        }
        if let Some(code) = controller.poll() {
            break Some(code);
        }
        if controller.state() == CaptureState::Error {
            let kind = controller.last_error();
            controller.close();
            return Err(eyre!(
                "{}",
                kind.map(|k| k.user_message()).unwrap_or("Camera error")
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    controller.close();
    if found.is_none() {
        eprintln!("Cancelled");
    }
    Ok(())
}
