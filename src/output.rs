// Projector output through v4l2loopback
//
// The projector is driven as a second screen showing a fullscreen player
// that reads from a v4l2loopback device. Each pattern is written as one
// frame with the write() API, then we wait for the projector and the player
// to actually display it before the camera is read.
//
// Unlike a live video feed, a dropped pattern corrupts the measurement, so
// writes are blocking.

use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::acquisition::Projector;
use crate::block::Block;
use crate::config::ProjectorConfig;

/// Supported pixel formats for output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelFormat {
    Yuyv,   // YUYV 4:2:2
    Rgb24,  // RGB24
    Bgr24,  // BGR24
}

impl PixelFormat {
    /// V4L2 fourcc code
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Rgb24 => fourcc(b"RGB3"),
            PixelFormat::Bgr24 => fourcc(b"BGR3"),
        }
    }

    /// Bytes per pixel (or average for packed formats)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Bgr24 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
        }
    }
}

/// Create fourcc code from bytes
fn fourcc(s: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*s)
}

// V4L2 ioctl definitions
const VIDIOC_S_FMT: libc::c_ulong = 0xc0d05605;
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;

/// V4L2 format structure - matches kernel definition exactly
#[repr(C)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc_or_hsv_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
struct v4l2_format {
    type_: u32,
    // 4 bytes padding to align the union to 8-byte boundary (matching kernel struct)
    _pad_before_fmt: u32,
    // Union - pix_format is the largest at 48 bytes, pad to 200 bytes total for union
    fmt: v4l2_pix_format,
    _pad: [u8; 200 - std::mem::size_of::<v4l2_pix_format>()],
}

/// Projector fed through a v4l2loopback output device
pub struct LoopbackProjector {
    device_path: String,
    file: File,
    width: u32,
    height: u32,
    format: PixelFormat,
    settle: Duration,
    /// RGB24 pattern buffer, reused for every frame
    pattern: Vec<u8>,
    patterns_shown: u64,
}

impl LoopbackProjector {
    /// Open the loopback device and negotiate an output format
    pub fn open(config: &ProjectorConfig) -> anyhow::Result<Self> {
        info!(
            "Opening projector output: {} ({}x{})",
            config.device, config.width, config.height
        );

        // Check if device exists
        if !Path::new(&config.device).exists() {
            anyhow::bail!(
                "Projector output device {} not found. Is v4l2loopback loaded? \
                 sudo modprobe v4l2loopback video_nr=10 card_label=DualCapture exclusive_caps=0",
                config.device
            );
        }

        let formats_to_try = [PixelFormat::Yuyv, PixelFormat::Rgb24, PixelFormat::Bgr24];

        for format in formats_to_try {
            info!("Trying format: {}", format.name());

            match open_with_format(&config.device, config.width, config.height, format) {
                Ok(file) => {
                    info!("Projector output initialized with format {}", format.name());
                    return Ok(Self {
                        device_path: config.device.clone(),
                        file,
                        width: config.width,
                        height: config.height,
                        format,
                        settle: Duration::from_millis(config.settle_ms),
                        pattern: vec![0u8; config.width as usize * config.height as usize * 3],
                        patterns_shown: 0,
                    });
                }
                Err(e) => {
                    warn!("Format {} rejected: {}", format.name(), e);
                }
            }
        }

        anyhow::bail!(
            "Failed to initialize projector output {}. Ensure v4l2loopback is loaded correctly",
            config.device
        )
    }

    /// Encode the current pattern, write it and wait for it to be displayed
    fn present(&mut self) -> anyhow::Result<()> {
        let frame = match self.format {
            PixelFormat::Rgb24 => self.pattern.clone(),
            PixelFormat::Bgr24 => rgb_to_bgr(&self.pattern),
            PixelFormat::Yuyv => rgb_to_yuyv(&self.pattern, self.width as usize, self.height as usize),
        };

        self.file
            .write_all(&frame)
            .with_context(|| format!("Failed to write pattern to {}", self.device_path))?;

        self.patterns_shown += 1;
        if self.patterns_shown % 100 == 0 {
            debug!("Written {} patterns to {}", self.patterns_shown, self.device_path);
        }

        thread::sleep(self.settle);
        Ok(())
    }
}

impl Projector for LoopbackProjector {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn show(&mut self, blocks: &[&Block]) -> anyhow::Result<()> {
        render_mask(&mut self.pattern, self.width, self.height, blocks);
        self.present()
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.pattern.fill(0);
        self.present()
    }

    fn floodlight(&mut self) -> anyhow::Result<()> {
        self.pattern.fill(255);
        self.present()
    }
}

impl Drop for LoopbackProjector {
    fn drop(&mut self) {
        info!("Projector output closed after {} patterns", self.patterns_shown);
    }
}

/// Set the output format and return the open device
fn open_with_format(path: &str, width: u32, height: u32, format: PixelFormat) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;

    let fd = file.as_raw_fd();

    let bytesperline = width * format.bytes_per_pixel() as u32;
    let sizeimage = bytesperline * height;

    let mut v4l2_fmt = v4l2_format {
        type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
        _pad_before_fmt: 0,
        fmt: v4l2_pix_format {
            width,
            height,
            pixelformat: format.fourcc(),
            field: V4L2_FIELD_NONE,
            bytesperline,
            sizeimage,
            colorspace: 0,
            priv_: 0,
            flags: 0,
            ycbcr_enc_or_hsv_enc: 0,
            quantization: 0,
            xfer_func: 0,
        },
        _pad: [0u8; 200 - std::mem::size_of::<v4l2_pix_format>()],
    };

    let ret = unsafe {
        libc::ioctl(fd, VIDIOC_S_FMT, &mut v4l2_fmt as *mut v4l2_format)
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // A resized pattern would no longer line up with the block coordinates
    if v4l2_fmt.fmt.width != width || v4l2_fmt.fmt.height != height {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "size changed: requested {}x{}, got {}x{}",
                width, height, v4l2_fmt.fmt.width, v4l2_fmt.fmt.height
            ),
        ));
    }

    Ok(file)
}

/// Paint the blocks white on black into an RGB24 buffer.
/// Block rows run along the image height, block columns along the width.
fn render_mask(rgb: &mut [u8], width: u32, height: u32, blocks: &[&Block]) {
    rgb.fill(0);
    let stride = width as usize * 3;
    for block in blocks {
        let max_x = block.max_x.min(height) as usize;
        let max_y = block.max_y.min(width) as usize;
        let min_y = (block.min_y as usize).min(max_y);
        for row in block.min_x as usize..max_x {
            let start = row * stride;
            rgb[start + min_y * 3..start + max_y * 3].fill(255);
        }
    }
}

/// Convert RGB24 to BGR24
fn rgb_to_bgr(rgb: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(rgb.len());
    for chunk in rgb.chunks_exact(3) {
        bgr.push(chunk[2]); // B
        bgr.push(chunk[1]); // G
        bgr.push(chunk[0]); // R
    }
    bgr
}

/// Convert RGB24 to YUYV (YUV 4:2:2 packed)
fn rgb_to_yuyv(rgb: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut yuyv = Vec::with_capacity(width * height * 2);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let idx1 = (y * width + x) * 3;
            let idx2 = (y * width + x + 1) * 3;

            // First pixel
            let r1 = rgb[idx1] as i32;
            let g1 = rgb[idx1 + 1] as i32;
            let b1 = rgb[idx1 + 2] as i32;

            // Second pixel (handle edge case)
            let (r2, g2, b2) = if x + 1 < width {
                (rgb[idx2] as i32, rgb[idx2 + 1] as i32, rgb[idx2 + 2] as i32)
            } else {
                (r1, g1, b1)
            };

            // Convert to YUV (BT.601)
            let y1 = ((66 * r1 + 129 * g1 + 25 * b1 + 128) >> 8) + 16;
            let y2 = ((66 * r2 + 129 * g2 + 25 * b2 + 128) >> 8) + 16;

            let u = ((-38 * r1 - 74 * g1 + 112 * b1 + 128) >> 8) + 128;
            let v = ((112 * r1 - 94 * g1 - 18 * b1 + 128) >> 8) + 128;

            yuyv.push(y1.clamp(0, 255) as u8);
            yuyv.push(u.clamp(0, 255) as u8);
            yuyv.push(y2.clamp(0, 255) as u8);
            yuyv.push(v.clamp(0, 255) as u8);
        }
    }

    yuyv
}
