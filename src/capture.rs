//! Camera capture from V4L2 devices
//!
//! This module implements the acquisition camera on top of a USB camera or
//! any other V4L2 capture device. It supports multiple pixel formats (YUYV,
//! MJPEG, RGB, BGR) and automatically selects the best available one.
//!
//! Every frame is decoded to RGB, resized to the working resolution and, for
//! gray reads, normalized to [0, 1] with the dark frame subtracted.
//!
//! Performance notes:
//! - Uses turbojpeg for hardware-accelerated MJPEG decoding (libjpeg-turbo with SIMD)
//! - Integer-only YUYV to RGB conversion (no floating point)
//! - Pre-allocated decode buffer reused for every frame

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::acquisition::{Camera, GrayFrame};
use crate::camera_controls::CameraControlsManager;
use crate::config::{CameraConfig, CaptureFormat};

/// Thread-local turbojpeg decompressor for hardware-accelerated MJPEG decoding
thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

/// Attempts per read when a frame fails to decode
const DECODE_ATTEMPTS: usize = 3;

/// Supported pixel formats in order of preference for a given config
fn preferred_formats(format: CaptureFormat) -> &'static [&'static [u8; 4]] {
    match format {
        CaptureFormat::Mjpeg => &[b"MJPG", b"YUYV", b"RGB3", b"BGR3"],
        CaptureFormat::Yuyv => &[b"YUYV", b"MJPG", b"RGB3", b"BGR3"],
    }
}

/// Input pixel layout of the negotiated format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl InputFormat {
    fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"MJPG" => InputFormat::Mjpeg,
            b"YUYV" => InputFormat::Yuyv,
            b"BGR3" => InputFormat::Bgr,
            _ => InputFormat::Rgb,
        }
    }
}

/// Acquisition camera backed by a V4L2 device
pub struct V4lCamera {
    stream: Stream<'static>,
    _device: Device,
    input: InputFormat,
    capture_width: u32,
    capture_height: u32,
    width: u32,
    height: u32,
    discard_frames: u32,
    rgb_buffer: Vec<u8>,
    dark: Option<Vec<f32>>,
    frames: u64,
}

impl V4lCamera {
    /// Open and configure the capture device
    pub fn open(config: &CameraConfig) -> Result<Self> {
        info!("Opening camera {}", config.device);

        let dev = Device::with_path(&config.device)
            .with_context(|| format!("Failed to open input device: {}", config.device))?;

        // Query and log device capabilities
        let caps = dev.query_caps()
            .context("Failed to query device capabilities")?;
        info!("Camera: {} (driver: {})", caps.card, caps.driver);

        let format = configure_capture_format(
            &dev,
            config.capture_width,
            config.capture_height,
            config.format,
        )?;
        info!(
            "Capture format: {}x{} {:?}",
            format.width, format.height,
            String::from_utf8_lossy(&format.fourcc.repr)
        );

        if let Err(e) = set_frame_rate(&dev, config.fps) {
            warn!("Could not set frame rate to {} fps: {}", config.fps, e);
        }

        // Fixed exposure and gain are required for comparable measurements
        if !config.controls.is_empty() {
            let mut controls = CameraControlsManager::new(&config.device);
            controls.query_controls()?;
            controls.apply_settings(&config.controls)?;
        } else {
            warn!("No camera controls configured; auto exposure may distort measurements");
        }

        let stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
            .context("Failed to create capture stream")?;

        let input = InputFormat::from_fourcc(&format.fourcc.repr);
        if input == InputFormat::Mjpeg {
            if JPEG_DECOMPRESSOR.with(|d| d.borrow().is_some()) {
                info!("TurboJPEG decompressor initialized");
            } else {
                warn!("TurboJPEG unavailable, using software MJPEG decoding");
            }
        }

        Ok(Self {
            stream,
            _device: dev,
            input,
            capture_width: format.width,
            capture_height: format.height,
            width: config.width,
            height: config.height,
            discard_frames: config.discard_frames,
            rgb_buffer: vec![0u8; format.width as usize * format.height as usize * 3],
            dark: None,
            frames: 0,
        })
    }

    /// Grab a fresh frame at capture resolution
    fn grab_rgb(&mut self) -> Result<RgbImage> {
        // Buffered frames may predate the current projector pattern
        for _ in 0..self.discard_frames {
            self.stream.next().context("Failed to capture frame")?;
        }

        let width = self.capture_width as usize;
        let height = self.capture_height as usize;

        for attempt in 1..=DECODE_ATTEMPTS {
            let (buf, _meta) = self.stream.next()
                .context("Failed to capture frame")?;

            let decoded = match self.input {
                InputFormat::Mjpeg => decode_mjpeg(buf, &mut self.rgb_buffer, width, height).is_ok(),
                InputFormat::Yuyv => {
                    yuyv_to_rgb(buf, &mut self.rgb_buffer, width, height);
                    true
                }
                InputFormat::Bgr => {
                    bgr_to_rgb(buf, &mut self.rgb_buffer);
                    true
                }
                InputFormat::Rgb => {
                    let copy_len = buf.len().min(self.rgb_buffer.len());
                    self.rgb_buffer[..copy_len].copy_from_slice(&buf[..copy_len]);
                    true
                }
            };

            if decoded {
                self.frames += 1;
                return RgbImage::from_raw(self.capture_width, self.capture_height, self.rgb_buffer.clone())
                    .context("Decoded frame has the wrong size");
            }
            warn!("Failed to decode MJPEG frame (attempt {}/{})", attempt, DECODE_ATTEMPTS);
        }

        anyhow::bail!("No decodable frame after {} attempts", DECODE_ATTEMPTS)
    }

    /// Frame at working resolution
    fn grab_working(&mut self) -> Result<RgbImage> {
        let frame = self.grab_rgb()?;
        if frame.dimensions() == (self.width, self.height) {
            return Ok(frame);
        }
        Ok(imageops::resize(&frame, self.width, self.height, FilterType::Triangle))
    }

    /// Normalized gray frame without dark subtraction
    fn grab_gray(&mut self) -> Result<Vec<f32>> {
        let frame = self.grab_working()?;
        Ok(normalized_gray(&frame))
    }
}

impl Camera for V4lCamera {
    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture_dark_frame(&mut self) -> Result<()> {
        let dark = self.grab_gray()?;
        let mean = dark.iter().sum::<f32>() / dark.len().max(1) as f32;
        info!("Captured dark frame (mean {:.4})", mean);
        self.dark = Some(dark);
        Ok(())
    }

    fn read_gray(&mut self) -> Result<GrayFrame> {
        let mut gray = self.grab_gray()?;
        if let Some(dark) = &self.dark {
            subtract_dark(&mut gray, dark);
        }
        debug!("Gray frame {} captured", self.frames);
        ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(self.width, self.height, gray)
            .context("Gray frame has the wrong size")
    }

    fn read_color(&mut self) -> Result<RgbImage> {
        self.grab_working()
    }
}

/// Rec.601 luma of every pixel, scaled so the brightest pixel is 1
fn normalized_gray(frame: &RgbImage) -> Vec<f32> {
    let mut gray: Vec<f32> = frame
        .pixels()
        .map(|p| 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32)
        .collect();
    let max = gray.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        gray.iter_mut().for_each(|v| *v /= max);
    }
    gray
}

/// Subtract the dark frame and clamp to [0, 1]
fn subtract_dark(gray: &mut [f32], dark: &[f32]) {
    for (v, d) in gray.iter_mut().zip(dark) {
        *v = (*v - d).clamp(0.0, 1.0);
    }
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(
    dev: &Device,
    width: u32,
    height: u32,
    preference: CaptureFormat,
) -> Result<v4l::Format> {
    // First, try to enumerate available formats
    let formats = dev.enum_formats()
        .context("Failed to enumerate formats")?;

    info!("Available formats:");
    for fmt in &formats {
        info!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    // Try preferred formats in order
    for preferred in preferred_formats(preference) {
        let fourcc = FourCC::new(preferred);
        if formats.iter().any(|f| f.fourcc == fourcc) {
            info!("Trying format: {:?} at {}x{}", String::from_utf8_lossy(*preferred), width, height);

            let mut format = dev.format()
                .context("Failed to get current format")?;

            format.width = width;
            format.height = height;
            format.fourcc = fourcc;

            match dev.set_format(&format) {
                Ok(actual) => {
                    info!("Successfully set format to {}x{} {:?}",
                        actual.width, actual.height,
                        String::from_utf8_lossy(&actual.fourcc.repr));
                    return Ok(actual);
                }
                Err(e) => {
                    warn!("Could not set format {:?} at {}x{}: {}",
                        String::from_utf8_lossy(*preferred), width, height, e);
                }
            }
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    warn!("No preferred format accepted, using device format {}x{} {:?}",
        current.width, current.height,
        String::from_utf8_lossy(&current.fourcc.repr));
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params()
        .context("Failed to get parameters")?;

    params.interval = v4l::Fraction::new(1, fps);

    dev.set_params(&params)
        .context("Failed to set parameters")?;

    let actual_params = dev.params().context("Failed to read back parameters")?;
    info!("Set frame interval to: {}/{} ({:.1} fps requested: {})",
        actual_params.interval.numerator,
        actual_params.interval.denominator,
        actual_params.interval.denominator as f64 / actual_params.interval.numerator.max(1) as f64,
        fps);

    Ok(())
}

/// Decode MJPEG frame to RGB using turbojpeg (hardware-accelerated via libjpeg-turbo)
/// Falls back to software jpeg-decoder if turbojpeg fails
fn decode_mjpeg<'a>(mjpeg_data: &[u8], rgb_buffer: &'a mut [u8], width: usize, height: usize) -> Result<&'a [u8], ()> {
    let expected_size = width * height * 3;

    let turbo_result = JPEG_DECOMPRESSOR.with(|decomp| {
        if let Some(ref mut decompressor) = *decomp.borrow_mut() {
            if let Ok(header) = decompressor.read_header(mjpeg_data) {
                if header.width != width || header.height != height {
                    return None;
                }

                let image = turbojpeg::Image {
                    pixels: &mut rgb_buffer[..expected_size],
                    width: header.width,
                    pitch: header.width * 3,
                    height: header.height,
                    format: turbojpeg::PixelFormat::RGB,
                };

                if decompressor.decompress(mjpeg_data, image).is_ok() {
                    return Some(());
                }
            }
        }
        None
    });

    if turbo_result.is_some() {
        return Ok(&rgb_buffer[..expected_size]);
    }

    decode_mjpeg_software(mjpeg_data, rgb_buffer, width, height)
}

/// Software fallback MJPEG decoder using jpeg-decoder crate
fn decode_mjpeg_software<'a>(mjpeg_data: &[u8], rgb_buffer: &'a mut [u8], width: usize, height: usize) -> Result<&'a [u8], ()> {
    use std::io::Cursor;

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(mjpeg_data));

    let pixels = decoder.decode().map_err(|_| ())?;
    let info = decoder.info().ok_or(())?;

    if info.width as usize != width || info.height as usize != height {
        return Err(());
    }

    let expected_size = width * height * 3;

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            let copy_len = pixels.len().min(expected_size);
            rgb_buffer[..copy_len].copy_from_slice(&pixels[..copy_len]);
        }
        jpeg_decoder::PixelFormat::L8 => {
            for (rgb, &gray) in rgb_buffer.chunks_exact_mut(3).zip(pixels.iter()) {
                rgb.fill(gray);
            }
        }
        _ => return Err(()),
    }

    Ok(&rgb_buffer[..expected_size])
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pairs = width * height / 2;

    // Process 2 pixels at a time (4 bytes YUYV -> 6 bytes RGB)
    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)).take(pairs) {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 * V, G = Y - 0.344 * U - 0.714 * V, B = Y + 1.772 * U
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        dst[0] = (y0 + v_r).clamp(0, 255) as u8;
        dst[1] = (y0 - uv_g).clamp(0, 255) as u8;
        dst[2] = (y0 + u_b).clamp(0, 255) as u8;
        dst[3] = (y1 + v_r).clamp(0, 255) as u8;
        dst[4] = (y1 - uv_g).clamp(0, 255) as u8;
        dst[5] = (y1 + u_b).clamp(0, 255) as u8;
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (bgr_chunk, rgb_chunk) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        rgb_chunk[0] = bgr_chunk[2];
        rgb_chunk[1] = bgr_chunk[1];
        rgb_chunk[2] = bgr_chunk[0];
    }
}
