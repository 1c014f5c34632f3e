//! Per-camera-pixel influence sets
//!
//! For every camera pixel the map holds the set of leaf blocks that may be
//! responsible for light seen at that pixel. Sets are immutable and shared:
//! a whole level's map is rebuilt by the accumulator rather than mutated, and
//! equal sets are interned so that a 960x540 map holding a few thousand
//! distinct sets costs one pointer per pixel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::block::BlockId;

/// Immutable set of candidate block indices for one pixel
pub type InfluenceSet = Arc<BTreeSet<BlockId>>;

/// Row-major grid of influence sets at camera resolution
#[derive(Debug, Clone)]
pub struct InfluenceMap {
    width: u32,
    height: u32,
    cells: Vec<InfluenceSet>,
}

impl InfluenceMap {
    /// Every pixel influenced by the same set (used for the root level)
    pub fn uniform(width: u32, height: u32, blocks: impl IntoIterator<Item = BlockId>) -> Self {
        let set: InfluenceSet = Arc::new(blocks.into_iter().collect());
        Self {
            width,
            height,
            cells: vec![set; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.cells.len()
    }

    /// Linear pixel index used by the transport matrix
    #[inline]
    pub fn index(&self, row: u32, col: u32) -> usize {
        row as usize * self.width as usize + col as usize
    }

    #[inline]
    pub fn get(&self, row: u32, col: u32) -> &InfluenceSet {
        &self.cells[self.index(row, col)]
    }

    /// Influence set by linear pixel index
    #[inline]
    pub fn at(&self, index: usize) -> &InfluenceSet {
        &self.cells[index]
    }

    pub fn cells(&self) -> &[InfluenceSet] {
        &self.cells
    }

    /// Each distinct set exactly once, in first-seen pixel order
    pub fn distinct_sets(&self) -> Vec<&BTreeSet<BlockId>> {
        let mut seen: HashSet<&BTreeSet<BlockId>> = HashSet::new();
        let mut ordered = Vec::new();
        for cell in &self.cells {
            let set: &BTreeSet<BlockId> = cell;
            if seen.insert(set) {
                ordered.push(set);
            }
        }
        ordered
    }

    /// Union of all influence sets
    pub fn distinct_blocks(&self) -> BTreeSet<BlockId> {
        self.distinct_sets()
            .into_iter()
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    /// Pixels whose influence set is empty
    pub fn dormant_pixels(&self) -> usize {
        self.cells.iter().filter(|c| c.is_empty()).count()
    }
}

/// Builds the next level's influence map, interning equal sets
pub struct InfluenceMapBuilder {
    width: u32,
    height: u32,
    cells: Vec<InfluenceSet>,
    interned: HashMap<BTreeSet<BlockId>, InfluenceSet>,
}

impl InfluenceMapBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: Vec::with_capacity(width as usize * height as usize),
            interned: HashMap::new(),
        }
    }

    /// Append the set for the next pixel in row-major order
    pub fn push(&mut self, set: BTreeSet<BlockId>) {
        let shared = match self.interned.get(&set) {
            Some(existing) => existing.clone(),
            None => {
                let shared = Arc::new(set.clone());
                self.interned.insert(set, shared.clone());
                shared
            }
        };
        self.cells.push(shared);
    }

    /// Number of distinct sets seen so far
    pub fn distinct(&self) -> usize {
        self.interned.len()
    }

    pub fn build(self) -> InfluenceMap {
        debug_assert_eq!(
            self.cells.len(),
            self.width as usize * self.height as usize,
            "influence map must cover every camera pixel"
        );
        InfluenceMap {
            width: self.width,
            height: self.height,
            cells: self.cells,
        }
    }
}
