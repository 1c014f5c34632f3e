//! Dual image reconstruction
//!
//! By Helmholtz reciprocity, multiplying the transport matrix by the scene as
//! seen under floodlight gives the image the projector would see if it were a
//! camera lit by the real camera. Each quadtree level produces a coarse
//! `2^l x 2^l` estimate; the estimates are upsampled to camera resolution,
//! normalised, and blended.
//!
//! This is a pure function of its inputs: no I/O, no hidden state.

use image::{Rgb, RgbImage};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::archive::TransportArchive;
use crate::block::BlockId;

/// Deepest level whose grid is still a sane allocation (4096 x 4096 cells)
pub const MAX_RENDER_LEVEL: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum ReconstructError {
    #[error("archive has no root block")]
    MissingRoot,
    #[error("root block covers no projector pixels")]
    EmptyProjector,
    #[error("archive has no levels")]
    NoLevels,
    #[error("prime image is {got_width}x{got_height}, transport was captured at {width}x{height}")]
    PrimeSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("block {block} references pixel {pixel} outside the prime image")]
    PixelOutOfRange { block: BlockId, pixel: usize },
    #[error("level {level} references unknown block {block}")]
    UnknownBlock { level: usize, block: BlockId },
    #[error("maximum render level {0} exceeds {MAX_RENDER_LEVEL}")]
    LevelTooDeep(usize),
}

/// Rendering parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RenderParams {
    /// Deepest quadtree level blended into the result
    pub max_level: usize,
    /// Output is raised to `1 / gamma`
    pub gamma: f64,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            max_level: 6,
            gamma: 3.0,
        }
    }
}

/// Linear RGB dual image with values in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct DualImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Vector3<f64>>,
}

impl DualImage {
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Vector3<f64> {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn to_rgb8(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let p = self.get(x, y);
            Rgb([to_u8(p.x), to_u8(p.y), to_u8(p.z)])
        })
    }
}

#[inline]
fn to_u8(v: f64) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Render the dual image from a finished acquisition and its prime image
pub fn reconstruct(
    archive: &TransportArchive,
    prime: &RgbImage,
    params: &RenderParams,
) -> Result<DualImage, ReconstructError> {
    if params.max_level > MAX_RENDER_LEVEL {
        return Err(ReconstructError::LevelTooDeep(params.max_level));
    }
    let root = archive.blocks.root().ok_or(ReconstructError::MissingRoot)?;
    if root.is_empty() {
        return Err(ReconstructError::EmptyProjector);
    }
    if archive.levels.is_empty() {
        return Err(ReconstructError::NoLevels);
    }
    if prime.dimensions() != (archive.camera_width, archive.camera_height) {
        return Err(ReconstructError::PrimeSize {
            width: archive.camera_width,
            height: archive.camera_height,
            got_width: prime.width(),
            got_height: prime.height(),
        });
    }

    let (projector_rows, projector_cols) = (root.max_x as u64, root.max_y as u64);
    let (width, height) = prime.dimensions();
    let prime = prime_column(prime);

    let mut dual = vec![Vector3::zeros(); prime.len()];

    for (level, range) in archive.levels.iter() {
        if level > params.max_level {
            break;
        }

        let n = 1usize << level;
        let mut grid = vec![Vector3::<f64>::zeros(); n * n];

        for block_id in range.clone() {
            let block = archive
                .blocks
                .get(block_id)
                .ok_or(ReconstructError::UnknownBlock { level, block: block_id })?;

            let mut contribution = Vector3::zeros();
            if let Some(row) = archive.transport.row(block_id) {
                for (&pixel, &value) in row {
                    let color = prime
                        .get(pixel)
                        .ok_or(ReconstructError::PixelOutOfRange { block: block_id, pixel })?;
                    contribution += color * value as f64;
                }
            }

            let grid_row = ((block.min_x as u64 * n as u64 / projector_rows) as usize).min(n - 1);
            let grid_col = ((block.min_y as u64 * n as u64 / projector_cols) as usize).min(n - 1);
            grid[grid_row * n + grid_col] = contribution;
        }

        let mut layer = upsample_bicubic(&grid, n, n, width as usize, height as usize);
        let sum = normalize_layer(&mut layer);
        debug!("Level {}: {} blocks, layer sum {:.4e}", level, range.len(), sum);

        for (acc, p) in dual.iter_mut().zip(&layer) {
            *acc += p;
        }
    }

    let max = dual.iter().map(|p| p.max()).fold(f64::NEG_INFINITY, f64::max);
    let inv_gamma = 1.0 / params.gamma;
    for p in dual.iter_mut() {
        if max > 0.0 {
            *p /= max;
        }
        *p = p.map(|v| v.max(0.0).powf(inv_gamma).clamp(0.0, 1.0));
    }

    Ok(DualImage {
        width,
        height,
        pixels: dual,
    })
}

/// Prime image as one RGB vector per pixel, normalised by its brightest channel
fn prime_column(prime: &RgbImage) -> Vec<Vector3<f64>> {
    let max = prime.as_raw().iter().copied().max().unwrap_or(0);
    let scale = if max > 0 { 1.0 / max as f64 } else { 0.0 };
    prime
        .pixels()
        .map(|p| Vector3::new(p.0[0] as f64, p.0[1] as f64, p.0[2] as f64) * scale)
        .collect()
}

/// Keys cubic convolution kernel with a = -0.5 (Catmull-Rom)
#[inline]
fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

/// Source taps and weights for every destination index along one axis
fn axis_taps(src_len: usize, dst_len: usize) -> Vec<([usize; 4], [f64; 4])> {
    let scale = src_len as f64 / dst_len as f64;
    let last = src_len as isize - 1;
    (0..dst_len)
        .map(|d| {
            let s = (d as f64 + 0.5) * scale - 0.5;
            let base = s.floor();
            let frac = s - base;
            let mut idx = [0usize; 4];
            let mut w = [0f64; 4];
            for k in 0..4 {
                let offset = k as isize - 1;
                idx[k] = (base as isize + offset).clamp(0, last) as usize;
                w[k] = cubic_weight(frac - offset as f64);
            }
            (idx, w)
        })
        .collect()
}

/// Divide a layer by its total energy and return that total.
///
/// Layers whose total is not positive (empty levels, or ringing around
/// near-zero data) are left as they are.
fn normalize_layer(layer: &mut [Vector3<f64>]) -> f64 {
    let sum: f64 = layer.iter().map(|p| p.sum()).sum();
    if sum > 0.0 {
        layer.iter_mut().for_each(|p| *p /= sum);
    }
    sum
}

/// Separable bicubic resize of a row-major RGB grid with clamped edges
fn upsample_bicubic(
    src: &[Vector3<f64>],
    src_rows: usize,
    src_cols: usize,
    dst_cols: usize,
    dst_rows: usize,
) -> Vec<Vector3<f64>> {
    let col_taps = axis_taps(src_cols, dst_cols);
    let row_taps = axis_taps(src_rows, dst_rows);

    // Horizontal pass: src_rows x dst_cols
    let mut horizontal = vec![Vector3::zeros(); src_rows * dst_cols];
    for r in 0..src_rows {
        let line = &src[r * src_cols..(r + 1) * src_cols];
        for (c, (idx, w)) in col_taps.iter().enumerate() {
            horizontal[r * dst_cols + c] = (0..4).map(|k| line[idx[k]] * w[k]).sum();
        }
    }

    // Vertical pass: dst_rows x dst_cols
    let mut out = vec![Vector3::zeros(); dst_rows * dst_cols];
    out.par_chunks_mut(dst_cols)
        .zip(row_taps.par_iter())
        .for_each(|(line, (idx, w))| {
            for (c, px) in line.iter_mut().enumerate() {
                *px = (0..4).map(|k| horizontal[idx[k] * dst_cols + c] * w[k]).sum();
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{LevelMap, QuadtreeStore};
    use crate::transport::TransportMatrix;

    fn flat_archive(width: u32, height: u32, value: f32) -> TransportArchive {
        let mut transport = TransportMatrix::new();
        for pixel in 0..(width * height) as usize {
            transport.record(0, pixel, value);
        }
        TransportArchive {
            camera_width: width,
            camera_height: height,
            transport,
            blocks: QuadtreeStore::with_root(16, 16),
            levels: LevelMap::new(),
        }
    }

    #[test]
    fn test_uniform_transport_gives_flat_field() {
        let archive = flat_archive(12, 8, 0.4);
        let prime = RgbImage::from_pixel(12, 8, Rgb([200, 100, 50]));
        let dual = reconstruct(&archive, &prime, &RenderParams::default()).unwrap();

        let first = dual.get(0, 0);
        assert!((first.x - 1.0).abs() < 1e-9);
        for p in &dual.pixels {
            assert!((p - first).norm() < 1e-9);
        }
        // Channel ratios survive normalisation, bent by the gamma curve
        assert!((first.y - 0.5f64.powf(1.0 / 3.0)).abs() < 1e-9);
        assert!((first.z - 0.25f64.powf(1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let mut blocks = QuadtreeStore::with_root(8, 8);
        let created = blocks.subdivide(0).unwrap();
        let mut levels = LevelMap::new();
        levels.insert(1, created);
        let mut transport = TransportMatrix::new();
        transport.record(1, 0, 0.3);
        transport.record(2, 5, 0.7);
        transport.record(4, 63, 0.2);
        transport.record(3, 17, 0.04);
        let archive = TransportArchive {
            camera_width: 8,
            camera_height: 8,
            transport,
            blocks,
            levels,
        };
        let prime = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 90]));

        let a = reconstruct(&archive, &prime, &RenderParams::default()).unwrap();
        let b = reconstruct(&archive, &prime, &RenderParams::default()).unwrap();
        let bits = |d: &DualImage| -> Vec<u64> {
            d.pixels.iter().flat_map(|p| p.iter().map(|v| v.to_bits())).collect()
        };
        assert_eq!(bits(&a), bits(&b));
        assert!(a.pixels.iter().all(|p| p.iter().all(|v| (0.0..=1.0).contains(v))));
    }

    #[test]
    fn test_levels_above_cutoff_are_ignored() {
        let mut blocks = QuadtreeStore::with_root(4, 4);
        let created = blocks.subdivide(0).unwrap();
        let mut levels = LevelMap::new();
        levels.insert(1, created);
        let mut transport = TransportMatrix::new();
        transport.record(2, 0, 0.9);
        let archive = TransportArchive {
            camera_width: 4,
            camera_height: 4,
            transport,
            blocks,
            levels,
        };
        let prime = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));

        let params = RenderParams {
            max_level: 0,
            ..Default::default()
        };
        let dual = reconstruct(&archive, &prime, &params).unwrap();
        assert!(dual.pixels.iter().all(|p| *p == Vector3::zeros()));
    }

    #[test]
    fn test_prime_size_mismatch() {
        let archive = flat_archive(4, 4, 0.5);
        let prime = RgbImage::new(5, 4);
        assert!(matches!(
            reconstruct(&archive, &prime, &RenderParams::default()),
            Err(ReconstructError::PrimeSize { got_width: 5, .. })
        ));
    }

    #[test]
    fn test_missing_root() {
        let mut archive = flat_archive(4, 4, 0.5);
        archive.blocks = QuadtreeStore::default();
        let prime = RgbImage::new(4, 4);
        assert_eq!(
            reconstruct(&archive, &prime, &RenderParams::default()),
            Err(ReconstructError::MissingRoot)
        );
    }

    #[test]
    fn test_bicubic_preserves_constants() {
        let src = vec![Vector3::new(0.5, 0.25, 1.0); 4];
        let out = upsample_bicubic(&src, 2, 2, 7, 5);
        assert_eq!(out.len(), 35);
        for p in out {
            assert!((p - Vector3::new(0.5, 0.25, 1.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn test_layer_with_negative_total_is_not_flipped() {
        let mut layer = vec![Vector3::new(-1e-9, 0.0, 0.0), Vector3::new(2e-10, 0.0, 0.0)];
        let sum = normalize_layer(&mut layer);
        assert!(sum < 0.0);
        assert_eq!(layer[0], Vector3::new(-1e-9, 0.0, 0.0));
        assert_eq!(layer[1], Vector3::new(2e-10, 0.0, 0.0));

        let mut layer = vec![Vector3::new(1.0, 1.0, 0.0), Vector3::new(2.0, 0.0, 0.0)];
        assert_eq!(normalize_layer(&mut layer), 4.0);
        assert_eq!(layer[0], Vector3::new(0.25, 0.25, 0.0));
        assert_eq!(layer[1], Vector3::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_cubic_weights_partition_unity() {
        for frac in [0.0, 0.1, 0.5, 0.9] {
            let total: f64 = (-1..3).map(|k| cubic_weight(frac - k as f64)).sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
    }
}
