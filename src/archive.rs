//! Persisted acquisition results
//!
//! The transport matrix, the block list and the level map reference each
//! other by block index, so they are always written and read as one document.
//! The prime image is stored next to it as a lossless PNG.

use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::block::{BlockId, LevelMap, QuadtreeStore};
use crate::transport::{PixelIndex, TransportMatrix};

pub const ARCHIVE_FILE: &str = "transport.json";
pub const PRIME_FILE: &str = "prime_image.png";

/// Cross-reference problems in a loaded archive
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("archive contains no blocks")]
    NoBlocks,
    #[error("archive contains no levels")]
    NoLevels,
    #[error("level {level} references blocks {start}..{end} but only {blocks} exist")]
    LevelOutOfRange {
        level: usize,
        start: BlockId,
        end: BlockId,
        blocks: usize,
    },
    #[error("transport matrix references unknown block {0}")]
    UnknownBlock(BlockId),
    #[error("block {block} references pixel {pixel} outside the {width}x{height} camera frame")]
    PixelOutOfRange {
        block: BlockId,
        pixel: PixelIndex,
        width: u32,
        height: u32,
    },
}

/// Transport matrix with the quadtree and level map it indexes into
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportArchive {
    pub camera_width: u32,
    pub camera_height: u32,
    pub transport: TransportMatrix,
    pub blocks: QuadtreeStore,
    pub levels: LevelMap,
}

impl TransportArchive {
    /// Check that every index in the archive resolves
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.blocks.is_empty() {
            return Err(ArchiveError::NoBlocks);
        }
        if self.levels.is_empty() {
            return Err(ArchiveError::NoLevels);
        }

        for (level, range) in self.levels.iter() {
            if range.end > self.blocks.len() || range.start > range.end {
                return Err(ArchiveError::LevelOutOfRange {
                    level,
                    start: range.start,
                    end: range.end,
                    blocks: self.blocks.len(),
                });
            }
        }

        let pixels = self.camera_width as usize * self.camera_height as usize;
        for (block, row) in self.transport.rows() {
            if self.blocks.get(block).is_none() {
                return Err(ArchiveError::UnknownBlock(block));
            }
            if let Some((&pixel, _)) = row.iter().next_back() {
                if pixel >= pixels {
                    return Err(ArchiveError::PixelOutOfRange {
                        block,
                        pixel,
                        width: self.camera_width,
                        height: self.camera_height,
                    });
                }
            }
        }

        Ok(())
    }

    /// Write the archive into `dir`, creating it if needed
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;

        let path = dir.join(ARCHIVE_FILE);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("Failed to write transport archive to {:?}", path))?;

        info!(
            "Saved transport archive to {:?} ({} blocks, {} entries)",
            path,
            self.blocks.len(),
            self.transport.nnz()
        );
        Ok(())
    }

    /// Read and validate the archive stored in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ARCHIVE_FILE);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open transport archive {:?}", path))?;
        let archive: TransportArchive = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse transport archive {:?}", path))?;

        archive
            .validate()
            .with_context(|| format!("Corrupt transport archive {:?}", path))?;

        info!(
            "Loaded transport archive from {:?} ({} blocks, {} levels, {} entries)",
            path,
            archive.blocks.len(),
            archive.levels.len(),
            archive.transport.nnz()
        );
        Ok(archive)
    }
}

pub fn save_prime(dir: &Path, prime: &RgbImage) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    let path = dir.join(PRIME_FILE);
    prime
        .save(&path)
        .with_context(|| format!("Failed to write prime image {:?}", path))?;
    info!("Saved prime image to {:?}", path);
    Ok(())
}

pub fn load_prime(dir: &Path) -> Result<RgbImage> {
    let path = dir.join(PRIME_FILE);
    let image = image::open(&path)
        .with_context(|| format!("Failed to read prime image {:?}", path))?;
    Ok(image.to_rgb8())
}
