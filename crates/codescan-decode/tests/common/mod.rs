//! Shared fixtures for decode integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use codescan_core::{CodeReader, DecodedCode, fixtures, preprocess};
use codescan_decode::{VisionError, VisionModel, VisionPayload};
use image::{GrayImage, Luma};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const UPC_A: &str = "012345678905";

/// Route decode logs to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("codescan_decode=debug,info")
        .with_test_writer()
        .try_init();
}

pub fn render_qr(payload: &str, scale: u32) -> GrayImage {
    fixtures::render_qr(payload, scale).unwrap()
}

pub fn render_upc_a(digits: &str, scale: u32, height: u32) -> GrayImage {
    fixtures::render_upc_a(digits, scale, height).unwrap()
}

pub fn png(image: &GrayImage) -> Vec<u8> {
    preprocess::encode_png(image).unwrap()
}

pub fn blank_png(width: u32, height: u32) -> Vec<u8> {
    png(&GrayImage::from_pixel(width, height, Luma([255])))
}

/// A reader that only sees codes in portrait images, like a scanner that
/// sweeps in one direction.
pub struct PortraitReader;

impl CodeReader for PortraitReader {
    fn name(&self) -> &'static str {
        "portrait"
    }

    fn read(&self, image: &GrayImage) -> Option<DecodedCode> {
        (image.height() > image.width()).then(|| DecodedCode {
            text: "PORTRAIT-1".to_string(),
            symbology: "TEST".to_string(),
        })
    }
}

pub struct PanickingReader;

impl CodeReader for PanickingReader {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn read(&self, _image: &GrayImage) -> Option<DecodedCode> {
        panic!("reader exploded")
    }
}

/// What a scripted vision model answers.
pub enum Script {
    Text(&'static str),
    Nothing,
    Quota,
    Hang(Duration),
}

pub struct ScriptedVision {
    script: Script,
    calls: AtomicUsize,
    last_mime: Mutex<Option<String>>,
}

impl ScriptedVision {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            last_mime: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_mime(&self) -> Option<String> {
        self.last_mime.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn read_code(&self, payload: &VisionPayload) -> Result<Option<String>, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_mime.lock().unwrap() = Some(payload.mime_type.clone());
        match &self.script {
            Script::Text(text) => Ok(Some(text.to_string())),
            Script::Nothing => Ok(None),
            Script::Quota => Err(VisionError::QuotaExceeded("HTTP 429".into())),
            Script::Hang(d) => {
                tokio::time::sleep(*d).await;
                Ok(Some("too late".into()))
            }
        }
    }
}

/// Paste `image` centred on a white canvas.
pub fn on_canvas(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut canvas = GrayImage::from_pixel(width, height, Luma([255]));
    let x = (width.saturating_sub(image.width()) / 2) as i64;
    let y = (height.saturating_sub(image.height()) / 2) as i64;
    image::imageops::overlay(&mut canvas, image, x, y);
    canvas
}

pub fn jpeg(image: &GrayImage, quality: u8) -> Vec<u8> {
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .unwrap();
    out
}
