//! Quadtree of projector illumination blocks
//!
//! Every block ever created lives in a single append-only arena and is
//! addressed by its index. Parent and child links are indices into the same
//! arena, so the tree can be shared read-only between the scheduler and the
//! accumulator without any pointer juggling.
//!
//! Axis convention: `x` indexes projector rows, `y` indexes projector columns.
//! The root block of a 1280x720 projector is therefore `(0, 0, 720, 1280)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use thiserror::Error;

/// Index of a block in the quadtree arena
pub type BlockId = usize;

/// Errors raised by quadtree manipulation. All of them indicate a logic bug
/// in the caller and are treated as fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuadtreeError {
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),
    #[error("block {0} has already been subdivided")]
    AlreadySubdivided(BlockId),
    #[error("block {0} is a single projector pixel and cannot be subdivided")]
    NotSubdividable(BlockId),
}

/// A half-open rectangle of the projector pixel grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    /// Parent block index (the root is its own parent)
    pub parent: BlockId,
    /// Contiguous range of child indices, empty until subdivided
    #[serde(default)]
    pub children: Vec<BlockId>,
}

impl Block {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32, parent: BlockId) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            parent,
            children: Vec::new(),
        }
    }

    /// Number of projector rows covered
    pub fn height(&self) -> u32 {
        self.max_x - self.min_x
    }

    /// Number of projector columns covered
    pub fn width(&self) -> u32 {
        self.max_y - self.min_y
    }

    /// True when the block covers no pixels at all
    pub fn is_empty(&self) -> bool {
        self.min_x == self.max_x || self.min_y == self.max_y
    }

    /// True when splitting would produce at least one strictly smaller block
    pub fn can_subdivide(&self) -> bool {
        !self.is_empty() && (self.height() > 1 || self.width() > 1)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the projector pixel `(row, col)` lies inside the block
    pub fn contains(&self, row: u32, col: u32) -> bool {
        self.min_x <= row && row < self.max_x && self.min_y <= col && col < self.max_y
    }

    /// Split at the integer midpoint of both axes.
    /// Empty quadrants (from a one-pixel-wide axis) are dropped.
    fn split(&self, parent: BlockId) -> Vec<Block> {
        let mid_x = (self.min_x + self.max_x) / 2;
        let mid_y = (self.min_y + self.max_y) / 2;

        [
            Block::new(self.min_x, self.min_y, mid_x, mid_y, parent),
            Block::new(self.min_x, mid_y, mid_x, self.max_y, parent),
            Block::new(mid_x, self.min_y, self.max_x, mid_y, parent),
            Block::new(mid_x, mid_y, self.max_x, self.max_y, parent),
        ]
        .into_iter()
        .filter(|b| !b.is_empty())
        .collect()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.min_x == other.min_x
            && self.min_y == other.min_y
            && self.max_x == other.max_x
            && self.max_y == other.max_y
    }
}

impl Eq for Block {}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.min_x, self.min_y, self.max_x, self.max_y).hash(state);
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block(min_x={}, min_y={}, max_x={}, max_y={})",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}

/// Append-only arena holding every block of the acquisition quadtree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuadtreeStore {
    blocks: Vec<Block>,
}

impl QuadtreeStore {
    /// Create the store with its single root block spanning the whole projector
    pub fn with_root(projector_height: u32, projector_width: u32) -> Self {
        Self {
            blocks: vec![Block::new(0, 0, projector_height, projector_width, 0)],
        }
    }

    /// Rebuild a store from a previously persisted block list
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn root(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Split a leaf block into up to four children and return their indices
    pub fn subdivide(&mut self, id: BlockId) -> Result<Range<BlockId>, QuadtreeError> {
        let block = self.blocks.get(id).ok_or(QuadtreeError::UnknownBlock(id))?;
        if !block.is_leaf() {
            return Err(QuadtreeError::AlreadySubdivided(id));
        }
        if !block.can_subdivide() {
            return Err(QuadtreeError::NotSubdividable(id));
        }

        let children = block.split(id);
        let start = self.blocks.len();
        self.blocks.extend(children);
        let end = self.blocks.len();

        self.blocks[id].children = (start..end).collect();
        Ok(start..end)
    }

    /// Children of a block (empty for leaves and unknown ids)
    pub fn children(&self, id: BlockId) -> &[BlockId] {
        self.blocks
            .get(id)
            .map(|b| b.children.as_slice())
            .unwrap_or(&[])
    }

    /// Depth of a block, counted as parent hops to the root
    pub fn depth(&self, mut id: BlockId) -> usize {
        let mut depth = 0;
        while let Some(block) = self.blocks.get(id) {
            if block.parent == id {
                break;
            }
            id = block.parent;
            depth += 1;
        }
        depth
    }
}

/// Block index ranges created at each subdivision depth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LevelMap {
    levels: BTreeMap<usize, Range<BlockId>>,
}

impl Default for LevelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelMap {
    /// Level map containing only the root block at depth 0
    pub fn new() -> Self {
        let mut levels = BTreeMap::new();
        levels.insert(0, 0..1);
        Self { levels }
    }

    pub fn insert(&mut self, level: usize, range: Range<BlockId>) {
        self.levels.insert(level, range);
    }

    pub fn get(&self, level: usize) -> Option<&Range<BlockId>> {
        self.levels.get(&level)
    }

    /// Levels in ascending depth order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Range<BlockId>)> {
        self.levels.iter().map(|(level, range)| (*level, range))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(b: &Block) -> (u32, u32, u32, u32) {
        (b.min_x, b.min_y, b.max_x, b.max_y)
    }

    #[test]
    fn test_root_spans_projector() {
        let store = QuadtreeStore::with_root(720, 1280);
        let root = store.root().unwrap();
        assert_eq!(bounds(root), (0, 0, 720, 1280));
        assert_eq!(root.parent, 0);
        assert!(root.is_leaf());
        assert_eq!(store.depth(0), 0);
    }

    #[test]
    fn test_subdivide_square() {
        let mut store = QuadtreeStore::with_root(4, 4);
        let range = store.subdivide(0).unwrap();
        assert_eq!(range, 1..5);

        let children: Vec<_> = range.clone().map(|i| bounds(store.get(i).unwrap())).collect();
        assert_eq!(
            children,
            vec![(0, 0, 2, 2), (0, 2, 2, 4), (2, 0, 4, 2), (2, 2, 4, 4)]
        );
        for i in range {
            let child = store.get(i).unwrap();
            assert_eq!(child.parent, 0);
            assert!(child.children.is_empty());
            assert_eq!(store.depth(i), 1);
        }
        assert_eq!(store.children(0), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_subdivide_thin_block_drops_empty_children() {
        let mut store = QuadtreeStore::with_root(1, 4);
        let range = store.subdivide(0).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(bounds(store.get(1).unwrap()), (0, 0, 1, 2));
        assert_eq!(bounds(store.get(2).unwrap()), (0, 2, 1, 4));
        assert!(store.blocks().iter().all(|b| !b.is_empty()));
    }

    #[test]
    fn test_subdivide_twice_fails() {
        let mut store = QuadtreeStore::with_root(4, 4);
        store.subdivide(0).unwrap();
        assert_eq!(store.subdivide(0), Err(QuadtreeError::AlreadySubdivided(0)));
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_single_pixel_is_terminal() {
        let mut store = QuadtreeStore::with_root(1, 1);
        assert!(!store.get(0).unwrap().can_subdivide());
        assert_eq!(store.subdivide(0), Err(QuadtreeError::NotSubdividable(0)));
        assert_eq!(store.subdivide(7), Err(QuadtreeError::UnknownBlock(7)));
    }

    #[test]
    fn test_equality_ignores_links() {
        let a = Block::new(0, 0, 2, 2, 0);
        let mut b = Block::new(0, 0, 2, 2, 5);
        b.children = vec![9, 10];
        assert_eq!(a, b);
        assert!(a.contains(1, 1));
        assert!(!a.contains(2, 1));
    }

    #[test]
    fn test_level_map_starts_with_root() {
        let mut levels = LevelMap::new();
        assert_eq!(levels.get(0), Some(&(0..1)));
        levels.insert(1, 1..5);
        let collected: Vec<_> = levels.iter().map(|(l, r)| (l, r.clone())).collect();
        assert_eq!(collected, vec![(0, 0..1), (1, 1..5)]);
    }
}
