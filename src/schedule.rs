//! Conflict-free illumination scheduling
//!
//! Two blocks conflict when some camera pixel may be lit by both, because a
//! single frame could then not tell which of them produced the light. The
//! scheduler builds the conflict graph from the influence map and colours it;
//! every colour class is a group of blocks that can be projected together.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::block::BlockId;
use crate::influence::InfluenceMap;

/// Blocks illuminated together in one frame
pub type ConflictFreeGroup = BTreeSet<BlockId>;

/// Undirected conflict graph, adjacency stored per node
#[derive(Debug, Clone, Default)]
pub struct ConflictGraph {
    adjacency: BTreeMap<BlockId, BTreeSet<BlockId>>,
}

impl ConflictGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from every distinct influence set of the map
    pub fn from_influence(map: &InfluenceMap) -> Self {
        let mut graph = Self::new();
        let sets = map.distinct_sets();
        for set in &sets {
            graph.add_clique(set.iter().copied());
        }
        debug!(
            "Conflict graph: {} nodes, {} edges from {} distinct influence sets",
            graph.node_count(),
            graph.edge_count(),
            sets.len()
        );
        graph
    }

    pub fn add_node(&mut self, node: BlockId) {
        self.adjacency.entry(node).or_default();
    }

    pub fn add_edge(&mut self, a: BlockId, b: BlockId) {
        if a == b {
            self.add_node(a);
            return;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    /// Connect every pair of the given nodes
    pub fn add_clique(&mut self, nodes: impl IntoIterator<Item = BlockId>) {
        let nodes: Vec<BlockId> = nodes.into_iter().collect();
        for (i, &a) in nodes.iter().enumerate() {
            self.add_node(a);
            for &b in &nodes[i + 1..] {
                self.add_edge(a, b);
            }
        }
    }

    /// Nodes in ascending index order
    pub fn nodes(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn neighbors(&self, node: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.adjacency.get(&node)
    }

    pub fn degree(&self, node: BlockId) -> usize {
        self.adjacency.get(&node).map_or(0, |n| n.len())
    }

    pub fn are_adjacent(&self, a: BlockId, b: BlockId) -> bool {
        self.adjacency.get(&a).is_some_and(|n| n.contains(&b))
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|n| n.len()).sum::<usize>() / 2
    }
}

/// Assigns a colour to every node so that adjacent nodes differ
pub trait ColoringStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn color(&self, graph: &ConflictGraph) -> BTreeMap<BlockId, usize>;
}

/// Greedy colouring, nodes visited by descending degree (ties by index)
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirst;

/// Greedy colouring, nodes visited in index order
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl ColoringStrategy for LargestFirst {
    fn name(&self) -> &'static str {
        "largest_first"
    }

    fn color(&self, graph: &ConflictGraph) -> BTreeMap<BlockId, usize> {
        let mut order: Vec<BlockId> = graph.nodes().collect();
        order.sort_by(|a, b| graph.degree(*b).cmp(&graph.degree(*a)).then(a.cmp(b)));
        greedy_color(graph, &order)
    }
}

impl ColoringStrategy for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn color(&self, graph: &ConflictGraph) -> BTreeMap<BlockId, usize> {
        let order: Vec<BlockId> = graph.nodes().collect();
        greedy_color(graph, &order)
    }
}

/// Give each node, in order, the smallest colour unused by its coloured neighbours
fn greedy_color(graph: &ConflictGraph, order: &[BlockId]) -> BTreeMap<BlockId, usize> {
    let mut colors: BTreeMap<BlockId, usize> = BTreeMap::new();
    let mut taken: Vec<bool> = Vec::new();

    for &node in order {
        taken.clear();
        if let Some(neighbors) = graph.neighbors(node) {
            for neighbor in neighbors {
                if let Some(&c) = colors.get(neighbor) {
                    if c >= taken.len() {
                        taken.resize(c + 1, false);
                    }
                    taken[c] = true;
                }
            }
        }
        let color = taken.iter().position(|t| !t).unwrap_or(taken.len());
        colors.insert(node, color);
    }

    colors
}

/// Colour method selectable from the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColoringMethod {
    #[default]
    LargestFirst,
    Sequential,
}

impl ColoringMethod {
    pub fn strategy(&self) -> Box<dyn ColoringStrategy> {
        match self {
            ColoringMethod::LargestFirst => Box::new(LargestFirst),
            ColoringMethod::Sequential => Box::new(Sequential),
        }
    }
}

/// Partition the blocks of the influence map into conflict-free groups,
/// ordered by colour
pub fn schedule_groups(map: &InfluenceMap, strategy: &dyn ColoringStrategy) -> Vec<ConflictFreeGroup> {
    let graph = ConflictGraph::from_influence(map);
    let colors = strategy.color(&graph);

    let mut by_color: BTreeMap<usize, ConflictFreeGroup> = BTreeMap::new();
    for (node, color) in colors {
        by_color.entry(color).or_default().insert(node);
    }

    let groups: Vec<ConflictFreeGroup> = by_color.into_values().collect();
    debug!(
        "{} coloring produced {} groups for {} blocks",
        strategy.name(),
        groups.len(),
        graph.node_count()
    );
    groups
}

/// Problems found by [`verify_groups`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleViolation {
    /// Two blocks of one group share a pixel's influence set
    Conflict { group: usize, blocks: Vec<BlockId> },
    /// A block of the map appears in no group
    Uncovered(BlockId),
    /// A block appears in more than one group
    Duplicated(BlockId),
}

/// Check the conflict-freedom and coverage invariants of a schedule
pub fn verify_groups(map: &InfluenceMap, groups: &[ConflictFreeGroup]) -> Vec<ScheduleViolation> {
    let mut violations = Vec::new();

    for set in map.distinct_sets() {
        for (index, group) in groups.iter().enumerate() {
            let shared: Vec<BlockId> = set.intersection(group).copied().collect();
            if shared.len() > 1 {
                violations.push(ScheduleViolation::Conflict {
                    group: index,
                    blocks: shared,
                });
            }
        }
    }

    let mut seen = BTreeSet::new();
    for group in groups {
        for &block in group {
            if !seen.insert(block) {
                violations.push(ScheduleViolation::Duplicated(block));
            }
        }
    }
    for block in map.distinct_blocks() {
        if !seen.contains(&block) {
            violations.push(ScheduleViolation::Uncovered(block));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influence::InfluenceMapBuilder;

    fn set(ids: &[BlockId]) -> BTreeSet<BlockId> {
        ids.iter().copied().collect()
    }

    fn map_from(sets: &[&[BlockId]], width: u32) -> InfluenceMap {
        let height = sets.len() as u32 / width;
        let mut builder = InfluenceMapBuilder::new(width, height);
        for s in sets {
            builder.push(set(s));
        }
        builder.build()
    }

    #[test]
    fn test_graph_from_influence() {
        let map = map_from(&[&[1, 2], &[2, 3], &[1, 2], &[4]], 2);
        let graph = ConflictGraph::from_influence(&map);
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.are_adjacent(1, 2));
        assert!(graph.are_adjacent(3, 2));
        assert!(!graph.are_adjacent(1, 3));
        assert_eq!(graph.degree(4), 0);
    }

    #[test]
    fn test_single_root_is_one_group() {
        let map = InfluenceMap::uniform(8, 8, [0]);
        let groups = schedule_groups(&map, &LargestFirst);
        assert_eq!(groups, vec![set(&[0])]);
    }

    #[test]
    fn test_siblings_all_conflict() {
        let map = InfluenceMap::uniform(4, 4, [1, 2, 3, 4]);
        let groups = schedule_groups(&map, &LargestFirst);
        assert_eq!(groups.len(), 4);
        assert!(verify_groups(&map, &groups).is_empty());
    }

    #[test]
    fn test_disjoint_sets_share_groups() {
        // Two independent families of four siblings need only four frames
        let map = map_from(&[&[1, 2, 3, 4], &[5, 6, 7, 8]], 2);
        for strategy in [ColoringMethod::LargestFirst, ColoringMethod::Sequential] {
            let groups = schedule_groups(&map, strategy.strategy().as_ref());
            assert_eq!(groups.len(), 4);
            assert!(groups.iter().all(|g| g.len() == 2));
            assert!(verify_groups(&map, &groups).is_empty());
        }
    }

    #[test]
    fn test_chain_of_overlaps_is_conflict_free() {
        let map = map_from(
            &[&[1, 2], &[2, 3], &[3, 4], &[4, 5], &[5, 1], &[], &[6], &[2, 6]],
            4,
        );
        let groups = schedule_groups(&map, &LargestFirst);
        assert!(verify_groups(&map, &groups).is_empty());
        let covered: BTreeSet<BlockId> = groups.iter().flatten().copied().collect();
        assert_eq!(covered, map.distinct_blocks());
    }

    #[test]
    fn test_schedule_is_stable() {
        let map = map_from(&[&[3, 9], &[9, 4], &[4, 3], &[10, 11]], 2);
        let first = schedule_groups(&map, &LargestFirst);
        let second = schedule_groups(&map, &LargestFirst);
        assert_eq!(first, second);
    }

    #[test]
    fn test_verify_reports_violations() {
        let map = map_from(&[&[1, 2], &[3]], 2);
        let bad = vec![set(&[1, 2])];
        let violations = verify_groups(&map, &bad);
        assert!(violations.contains(&ScheduleViolation::Conflict {
            group: 0,
            blocks: vec![1, 2]
        }));
        assert!(violations.contains(&ScheduleViolation::Uncovered(3)));
    }
}
