//! Sparse light transport matrix and the per-level accumulator
//!
//! After every level of captures the accumulator walks all camera pixels,
//! attributes each measured response to the single block of its group that
//! can explain it, and decides whether that block is terminal for the pixel
//! (record the value) or carries enough energy to be refined (subdivide and
//! hand the children to the pixel for the next level). A block refined for
//! one pixel can still be terminal for another pixel that saw it dimly.
//!
//! Classification is read-only and runs in parallel over pixels. Subdivision
//! and recording are then applied serially in row-major pixel order, which
//! keeps block indices identical from run to run.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, warn};

use crate::acquisition::GrayFrame;
use crate::block::{BlockId, QuadtreeError, QuadtreeStore};
use crate::influence::{InfluenceMap, InfluenceMapBuilder};
use crate::schedule::ConflictFreeGroup;

/// Linear camera pixel index, `row * camera_width + col`
pub type PixelIndex = usize;

/// Sparse block -> pixel -> intensity mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportMatrix {
    entries: BTreeMap<BlockId, BTreeMap<PixelIndex, f32>>,
}

impl TransportMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measurement, returning the previous value if the pair was already present
    pub fn record(&mut self, block: BlockId, pixel: PixelIndex, value: f32) -> Option<f32> {
        self.entries.entry(block).or_default().insert(pixel, value)
    }

    /// Row of the matrix for one block
    pub fn row(&self, block: BlockId) -> Option<&BTreeMap<PixelIndex, f32>> {
        self.entries.get(&block)
    }

    pub fn contains(&self, block: BlockId, pixel: PixelIndex) -> bool {
        self.entries
            .get(&block)
            .is_some_and(|row| row.contains_key(&pixel))
    }

    /// Blocks with at least one recorded pixel
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.entries.keys().copied()
    }

    pub fn rows(&self) -> impl Iterator<Item = (BlockId, &BTreeMap<PixelIndex, f32>)> {
        self.entries.iter().map(|(b, row)| (*b, row))
    }

    /// Total number of recorded (block, pixel) pairs
    pub fn nnz(&self) -> usize {
        self.entries.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do when a measured pixel matches several blocks of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort the acquisition (the schedule is broken)
    #[default]
    Abort,
    /// Log the pixel and ignore that measurement
    Skip,
}

/// Thresholds and policies of the accumulator
#[derive(Debug, Clone, Copy)]
pub struct AccumulatorParams {
    /// Below this a measurement is treated as no signal
    pub zero_threshold: f32,
    /// At or above this a subdividable block is refined
    pub subdivision_threshold: f32,
    pub conflict_policy: ConflictPolicy,
}

impl Default for AccumulatorParams {
    fn default() -> Self {
        Self {
            zero_threshold: 0.01,
            subdivision_threshold: 0.05,
            conflict_policy: ConflictPolicy::Abort,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("pixel ({row}, {col}) is explained by {blocks:?} within group {group}; groups are not conflict-free")]
    Conflict {
        row: u32,
        col: u32,
        group: usize,
        blocks: Vec<BlockId>,
    },
    #[error("got {frames} frames for {groups} groups")]
    GroupFrameMismatch { groups: usize, frames: usize },
    #[error("frame {index} is {got_width}x{got_height}, expected {width}x{height}")]
    FrameSize {
        index: usize,
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error(transparent)]
    Quadtree(#[from] QuadtreeError),
}

/// Result of processing one level of captures
#[derive(Debug)]
pub struct LevelOutcome {
    /// Influence map for the next level
    pub next: InfluenceMap,
    /// Blocks refined this level, in subdivision order
    pub subdivided: Vec<BlockId>,
    /// Indices of the blocks created this level
    pub created: Range<BlockId>,
    /// Transport entries recorded this level
    pub recorded: usize,
    /// Pixels left with an empty influence set
    pub dormant: usize,
    /// Measurements dropped under [`ConflictPolicy::Skip`]
    pub conflicts_skipped: usize,
}

impl LevelOutcome {
    pub fn subdivided_any(&self) -> bool {
        !self.subdivided.is_empty()
    }
}

/// One attributed measurement at a pixel
#[derive(Debug, Clone, Copy)]
struct Hit {
    block: BlockId,
    value: f32,
    significant: bool,
}

#[derive(Debug, Default)]
struct PixelHits {
    hits: Vec<Hit>,
    skipped: usize,
}

pub struct Accumulator {
    params: AccumulatorParams,
}

impl Accumulator {
    pub fn new(params: AccumulatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AccumulatorParams {
        &self.params
    }

    /// Fold one level of captured frames into the transport matrix and the quadtree.
    ///
    /// With `allow_subdivision == false` (the last permitted round) every
    /// significant measurement is recorded at its current block.
    pub fn process(
        &self,
        map: &InfluenceMap,
        groups: &[ConflictFreeGroup],
        frames: &[GrayFrame],
        store: &mut QuadtreeStore,
        transport: &mut TransportMatrix,
        allow_subdivision: bool,
    ) -> Result<LevelOutcome, TransportError> {
        if groups.len() != frames.len() {
            return Err(TransportError::GroupFrameMismatch {
                groups: groups.len(),
                frames: frames.len(),
            });
        }
        for (index, frame) in frames.iter().enumerate() {
            if frame.width() != map.width() || frame.height() != map.height() {
                return Err(TransportError::FrameSize {
                    index,
                    width: map.width(),
                    height: map.height(),
                    got_width: frame.width(),
                    got_height: frame.height(),
                });
            }
        }

        let classified: Vec<PixelHits> = {
            let tree: &QuadtreeStore = &*store;
            (0..map.pixel_count())
                .into_par_iter()
                .map(|index| self.classify_pixel(map, index, groups, frames, tree, allow_subdivision))
                .collect::<Result<_, _>>()?
        };

        // Refine every block that received significant energy, in first-seen order
        let mut subdivided = Vec::new();
        let mut refined: HashSet<BlockId> = HashSet::new();
        for pixel in &classified {
            for hit in &pixel.hits {
                if hit.significant && refined.insert(hit.block) {
                    subdivided.push(hit.block);
                }
            }
        }

        let first_new = store.len();
        for &block in &subdivided {
            store.subdivide(block)?;
        }
        let created = first_new..store.len();

        let mut builder = InfluenceMapBuilder::new(map.width(), map.height());
        let mut recorded = 0;
        let mut conflicts_skipped = 0;
        for (index, pixel) in classified.iter().enumerate() {
            conflicts_skipped += pixel.skipped;
            let mut next = BTreeSet::new();
            for hit in &pixel.hits {
                if hit.significant {
                    next.extend(store.children(hit.block).iter().copied());
                } else {
                    if let Some(previous) = transport.record(hit.block, index, hit.value) {
                        warn!(
                            "Block {} already recorded {} at pixel {}, overwriting with {}",
                            hit.block, previous, index, hit.value
                        );
                    }
                    recorded += 1;
                }
            }
            builder.push(next);
        }

        let distinct = builder.distinct();
        let next = builder.build();
        let dormant = next.dormant_pixels();

        debug!(
            "Accumulated level: {} blocks subdivided, {} created, {} entries recorded, {} dormant pixels, {} distinct influence sets",
            subdivided.len(),
            created.len(),
            recorded,
            dormant,
            distinct
        );

        Ok(LevelOutcome {
            next,
            subdivided,
            created,
            recorded,
            dormant,
            conflicts_skipped,
        })
    }

    /// Attribute every above-zero measurement at one pixel to its block
    fn classify_pixel(
        &self,
        map: &InfluenceMap,
        index: usize,
        groups: &[ConflictFreeGroup],
        frames: &[GrayFrame],
        store: &QuadtreeStore,
        allow_subdivision: bool,
    ) -> Result<PixelHits, TransportError> {
        let influence = map.at(index);
        let mut pixel = PixelHits::default();
        if influence.is_empty() {
            return Ok(pixel);
        }

        for (group_index, (group, frame)) in groups.iter().zip(frames).enumerate() {
            let value = frame.as_raw()[index];
            if value < self.params.zero_threshold {
                continue;
            }

            let mut matching = influence.iter().filter(|b| group.contains(*b));
            let block = match (matching.next(), matching.next()) {
                // Light from a block outside this pixel's influence set
                (None, _) => continue,
                (Some(&block), None) => block,
                (Some(_), Some(_)) => {
                    let blocks: Vec<BlockId> =
                        influence.iter().filter(|b| group.contains(*b)).copied().collect();
                    let row = (index / map.width() as usize) as u32;
                    let col = (index % map.width() as usize) as u32;
                    match self.params.conflict_policy {
                        ConflictPolicy::Abort => {
                            return Err(TransportError::Conflict {
                                row,
                                col,
                                group: group_index,
                                blocks,
                            });
                        }
                        ConflictPolicy::Skip => {
                            warn!(
                                "Skipping pixel ({}, {}) in group {}: ambiguous blocks {:?}",
                                row, col, group_index, blocks
                            );
                            pixel.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            let can_subdivide = store.get(block).is_some_and(|b| b.can_subdivide());
            pixel.hits.push(Hit {
                block,
                value,
                significant: allow_subdivision
                    && can_subdivide
                    && value >= self.params.subdivision_threshold,
            });
        }

        Ok(pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influence::InfluenceMap;
    use image::{ImageBuffer, Luma};

    fn frame(width: u32, height: u32, values: &[f32]) -> GrayFrame {
        ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(width, height, values.to_vec()).unwrap()
    }

    fn group(ids: &[BlockId]) -> ConflictFreeGroup {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_bright_root_subdivides() {
        let mut store = QuadtreeStore::with_root(4, 4);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(2, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[0])],
                &[frame(2, 1, &[0.5, 0.0])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert_eq!(outcome.subdivided, vec![0]);
        assert_eq!(outcome.created, 1..5);
        assert!(transport.is_empty());
        assert_eq!(outcome.next.at(0).iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(outcome.next.at(1).is_empty());
        assert_eq!(outcome.dormant, 1);
    }

    #[test]
    fn test_dim_pixel_records_without_subdividing() {
        let mut store = QuadtreeStore::with_root(4, 4);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(2, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[0])],
                &[frame(2, 1, &[0.03, 0.005])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert!(!outcome.subdivided_any());
        assert_eq!(outcome.recorded, 1);
        assert_eq!(transport.row(0).unwrap().get(&0), Some(&0.03));
        assert!(!transport.contains(0, 1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dim_hit_on_refined_block_is_kept() {
        // Pixel 0 is bright and refines the root; pixel 1 saw the root dimly
        let mut store = QuadtreeStore::with_root(4, 4);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(2, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[0])],
                &[frame(2, 1, &[0.5, 0.03])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert_eq!(outcome.subdivided, vec![0]);
        assert_eq!(outcome.recorded, 1);
        assert_eq!(transport.row(0).unwrap().get(&1), Some(&0.03));
        assert!(!transport.contains(0, 0));
        assert_eq!(outcome.next.at(0).len(), 4);
        assert!(outcome.next.at(1).is_empty());

        // The children only see the bright pixel again; the dim value survives
        let groups: Vec<ConflictFreeGroup> = (1..5).map(|b| group(&[b])).collect();
        let frames: Vec<GrayFrame> = (0..4).map(|_| frame(2, 1, &[0.5, 0.0075])).collect();
        acc.process(&outcome.next, &groups, &frames, &mut store, &mut transport, true)
            .unwrap();
        assert_eq!(transport.row(0).unwrap().get(&1), Some(&0.03));
        assert!((1..5).all(|b| !transport.contains(b, 1)));
    }

    #[test]
    fn test_light_from_block_outside_influence_is_ignored() {
        let mut store = QuadtreeStore::with_root(4, 4);
        store.subdivide(0).unwrap();
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [1]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[2])],
                &[frame(1, 1, &[0.5])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert!(!outcome.subdivided_any());
        assert_eq!(outcome.recorded, 0);
        assert_eq!(outcome.conflicts_skipped, 0);
        assert!(transport.is_empty());
        assert!(outcome.next.at(0).is_empty());
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_final_round_records_everything() {
        let mut store = QuadtreeStore::with_root(4, 4);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[0])],
                &[frame(1, 1, &[0.9])],
                &mut store,
                &mut transport,
                false,
            )
            .unwrap();

        assert!(!outcome.subdivided_any());
        assert_eq!(transport.row(0).unwrap().get(&0), Some(&0.9));
    }

    #[test]
    fn test_single_pixel_block_is_terminal() {
        let mut store = QuadtreeStore::with_root(1, 1);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(
                &map,
                &[group(&[0])],
                &[frame(1, 1, &[1.0])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert!(!outcome.subdivided_any());
        assert_eq!(transport.nnz(), 1);
    }

    #[test]
    fn test_pixel_attributed_to_lit_group() {
        let mut store = QuadtreeStore::with_root(4, 4);
        store.subdivide(0).unwrap();
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [1, 2, 3, 4]);
        let groups = [group(&[1]), group(&[2]), group(&[3]), group(&[4])];
        let frames = [
            frame(1, 1, &[0.0]),
            frame(1, 1, &[0.02]),
            frame(1, 1, &[0.0]),
            frame(1, 1, &[0.3]),
        ];
        let acc = Accumulator::new(AccumulatorParams::default());

        let outcome = acc
            .process(&map, &groups, &frames, &mut store, &mut transport, true)
            .unwrap();

        assert_eq!(outcome.subdivided, vec![4]);
        assert_eq!(transport.row(2).unwrap().get(&0), Some(&0.02));
        assert_eq!(outcome.next.at(0).iter().copied().collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        assert!(!transport.contains(4, 0));
    }

    #[test]
    fn test_conflicting_group_aborts() {
        let mut store = QuadtreeStore::with_root(4, 4);
        store.subdivide(0).unwrap();
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [1, 2]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let err = acc
            .process(
                &map,
                &[group(&[1, 2])],
                &[frame(1, 1, &[0.5])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap_err();

        assert!(matches!(err, TransportError::Conflict { blocks, .. } if blocks == vec![1, 2]));
    }

    #[test]
    fn test_conflicting_group_skip_policy() {
        let mut store = QuadtreeStore::with_root(4, 4);
        store.subdivide(0).unwrap();
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [1, 2]);
        let acc = Accumulator::new(AccumulatorParams {
            conflict_policy: ConflictPolicy::Skip,
            ..Default::default()
        });

        let outcome = acc
            .process(
                &map,
                &[group(&[1, 2])],
                &[frame(1, 1, &[0.5])],
                &mut store,
                &mut transport,
                true,
            )
            .unwrap();

        assert_eq!(outcome.conflicts_skipped, 1);
        assert!(transport.is_empty());
        assert_eq!(outcome.dormant, 1);
    }

    #[test]
    fn test_frame_count_must_match_groups() {
        let mut store = QuadtreeStore::with_root(4, 4);
        let mut transport = TransportMatrix::new();
        let map = InfluenceMap::uniform(1, 1, [0]);
        let acc = Accumulator::new(AccumulatorParams::default());

        let err = acc
            .process(&map, &[group(&[0])], &[], &mut store, &mut transport, true)
            .unwrap_err();
        assert!(matches!(err, TransportError::GroupFrameMismatch { groups: 1, frames: 0 }));
    }
}
