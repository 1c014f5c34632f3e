//! Synthetic projector-camera rig for hardware-free runs
//!
//! The projector and the camera share a lit-pixel mask. Each camera pixel
//! observes the patch of projector pixels given by a proportional mapping
//! between the two grids and reports the lit fraction of that patch scaled
//! by a per-pixel albedo.

use image::{ImageBuffer, Rgb, RgbImage};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::acquisition::{Camera, GrayFrame, Projector};
use crate::block::Block;

type Albedo = Arc<dyn Fn(u32, u32) -> f32 + Send + Sync>;

/// Lit state of every projector pixel, row-major
struct LitMask {
    width: u32,
    height: u32,
    lit: Vec<bool>,
}

impl LitMask {
    fn fill(&mut self, value: bool) {
        self.lit.iter_mut().for_each(|p| *p = value);
    }

    /// Summed-area table with one row and column of zero padding
    fn integral(&self) -> Vec<u32> {
        let w = self.width as usize + 1;
        let mut table = vec![0u32; w * (self.height as usize + 1)];
        for row in 0..self.height as usize {
            let mut run = 0;
            for col in 0..self.width as usize {
                run += self.lit[row * self.width as usize + col] as u32;
                table[(row + 1) * w + col + 1] = table[row * w + col + 1] + run;
            }
        }
        table
    }
}

/// Builder for a synthetic projector/camera pair
pub struct SyntheticRig {
    projector_width: u32,
    projector_height: u32,
    camera_width: u32,
    camera_height: u32,
    albedo: Albedo,
}

impl SyntheticRig {
    pub fn new(projector_width: u32, projector_height: u32, camera_width: u32, camera_height: u32) -> Self {
        Self {
            projector_width,
            projector_height,
            camera_width,
            camera_height,
            albedo: Arc::new(|_, _| 0.8),
        }
    }

    /// Per camera pixel reflectance, `f(row, col)`
    pub fn with_albedo(mut self, albedo: impl Fn(u32, u32) -> f32 + Send + Sync + 'static) -> Self {
        self.albedo = Arc::new(albedo);
        self
    }

    pub fn split(self) -> (SyntheticProjector, SyntheticCamera) {
        let mask = Arc::new(Mutex::new(LitMask {
            width: self.projector_width,
            height: self.projector_height,
            lit: vec![false; self.projector_width as usize * self.projector_height as usize],
        }));

        (
            SyntheticProjector {
                mask: mask.clone(),
                shown: 0,
            },
            SyntheticCamera {
                mask,
                width: self.camera_width,
                height: self.camera_height,
                albedo: self.albedo,
                frames: 0,
            },
        )
    }
}

pub struct SyntheticProjector {
    mask: Arc<Mutex<LitMask>>,
    shown: u64,
}

impl SyntheticProjector {
    /// Number of patterns shown so far
    pub fn patterns_shown(&self) -> u64 {
        self.shown
    }
}

impl Projector for SyntheticProjector {
    fn resolution(&self) -> (u32, u32) {
        let mask = self.mask.lock();
        (mask.width, mask.height)
    }

    fn show(&mut self, blocks: &[&Block]) -> anyhow::Result<()> {
        let mut mask = self.mask.lock();
        mask.fill(false);
        let width = mask.width as usize;
        for block in blocks {
            let max_x = block.max_x.min(mask.height);
            let max_y = block.max_y.min(mask.width);
            for row in block.min_x..max_x {
                let start = row as usize * width;
                mask.lit[start + block.min_y as usize..start + max_y as usize].fill(true);
            }
        }
        self.shown += 1;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.mask.lock().fill(false);
        self.shown += 1;
        Ok(())
    }

    fn floodlight(&mut self) -> anyhow::Result<()> {
        self.mask.lock().fill(true);
        self.shown += 1;
        Ok(())
    }
}

pub struct SyntheticCamera {
    mask: Arc<Mutex<LitMask>>,
    width: u32,
    height: u32,
    albedo: Albedo,
    frames: u64,
}

impl SyntheticCamera {
    /// Number of frames read so far
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Lit fraction of every camera pixel's projector footprint, times albedo
    fn render(&mut self) -> Vec<f32> {
        let mask = self.mask.lock();
        let table = mask.integral();
        let stride = mask.width as usize + 1;
        let (pw, ph) = (mask.width, mask.height);
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize);

        for row in 0..self.height {
            let (r0, r1) = footprint(row, self.height, ph);
            for col in 0..self.width {
                let (c0, c1) = footprint(col, self.width, pw);
                let lit = table[r1 * stride + c1] + table[r0 * stride + c0]
                    - table[r0 * stride + c1]
                    - table[r1 * stride + c0];
                let area = ((r1 - r0) * (c1 - c0)) as f32;
                out.push((self.albedo)(row, col) * lit as f32 / area);
            }
        }

        self.frames += 1;
        out
    }
}

/// Projector index range seen by camera index `i`, at least one pixel wide
fn footprint(i: u32, camera_len: u32, projector_len: u32) -> (usize, usize) {
    let start = (i as u64 * projector_len as u64 / camera_len as u64) as usize;
    let end = ((i as u64 + 1) * projector_len as u64 / camera_len as u64) as usize;
    (start, end.max(start + 1).min(projector_len as usize))
}

impl Camera for SyntheticCamera {
    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_gray(&mut self) -> anyhow::Result<GrayFrame> {
        let values = self.render();
        ImageBuffer::from_raw(self.width, self.height, values)
            .ok_or_else(|| anyhow::anyhow!("Synthetic frame has the wrong size"))
    }

    fn read_color(&mut self) -> anyhow::Result<RgbImage> {
        let values = self.render();
        let tint = [1.0f32, 0.8, 0.6];
        Ok(ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let v = values[(y * self.width + x) as usize];
            Rgb(tint.map(|t| (v * t * 255.0).round().clamp(0.0, 255.0) as u8))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_to_one_block() {
        let (mut projector, mut camera) = SyntheticRig::new(4, 4, 4, 4).split();
        let block = Block::new(0, 2, 2, 4, 0);
        projector.show(&[&block]).unwrap();

        let frame = camera.read_gray().unwrap();
        assert_eq!(frame.get_pixel(3, 1).0[0], 0.8);
        assert_eq!(frame.get_pixel(1, 1).0[0], 0.0);
        assert_eq!(frame.get_pixel(3, 2).0[0], 0.0);
        assert_eq!(camera.frames_read(), 1);
        assert_eq!(projector.patterns_shown(), 1);
    }

    #[test]
    fn test_downscaled_camera_averages_footprint() {
        let (mut projector, mut camera) = SyntheticRig::new(4, 4, 2, 2)
            .with_albedo(|_, _| 1.0)
            .split();
        // Light a single projector pixel inside camera pixel (0, 0)'s 2x2 footprint
        projector.show(&[&Block::new(0, 0, 1, 1, 0)]).unwrap();

        let frame = camera.read_gray().unwrap();
        assert_eq!(frame.get_pixel(0, 0).0[0], 0.25);
        assert_eq!(frame.get_pixel(1, 1).0[0], 0.0);
    }

    #[test]
    fn test_floodlight_and_clear() {
        let (mut projector, mut camera) = SyntheticRig::new(8, 6, 4, 3).split();
        assert_eq!(projector.resolution(), (8, 6));
        projector.floodlight().unwrap();
        let lit = camera.read_gray().unwrap();
        assert!(lit.pixels().all(|p| p.0[0] == 0.8));

        let prime = camera.read_color().unwrap();
        assert_eq!(prime.get_pixel(0, 0).0, [204, 163, 122]);

        projector.clear().unwrap();
        let dark = camera.read_gray().unwrap();
        assert!(dark.pixels().all(|p| p.0[0] == 0.0));
    }

    #[test]
    fn test_footprint_never_empty() {
        assert_eq!(footprint(0, 8, 4), (0, 1));
        assert_eq!(footprint(7, 8, 4), (3, 4));
        assert_eq!(footprint(1, 3, 24), (8, 16));
    }
}
