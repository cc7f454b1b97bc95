//! Capacity-driven tree construction and post-construction compaction.
//!
//! Construction streams the full point set once per refinement pass, counts
//! records per leaf, and splits every over-full leaf before recounting. The
//! pass budget bounds tree depth when the data cannot be balanced below the
//! threshold (heavily duplicated coordinates, for example). Compaction then
//! melts sibling leaf pairs whose combined count stayed below the threshold
//! after refinement elsewhere in the tree.

use crate::error::Result;
use crate::model::Point;
use crate::tree::{Envelope, NodePath, PartitionTree};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

/// Result of the iterative construction pass.
#[derive(Debug)]
pub struct BalanceOutcome {
    pub tree: PartitionTree,
    /// Final per-leaf record counts, keyed by leaf path. Leaves that saw no
    /// records are absent.
    pub leaf_counts: FxHashMap<NodePath, u64>,
    /// Number of split passes performed.
    pub passes: usize,
}

/// Build a tree over `bbox` by iterative splitting until every leaf holds at
/// most `max_per_leaf` records or `max_passes` refinement passes have run.
///
/// `source` must yield a fresh iterator over the full point set on every
/// call; one counting pass streams the whole set.
pub fn build_tree<I, F>(
    bbox: Envelope,
    max_per_leaf: u64,
    max_passes: usize,
    mut source: F,
) -> Result<BalanceOutcome>
where
    F: FnMut() -> Result<I>,
    I: Iterator<Item = Result<Point>>,
{
    let mut tree = PartitionTree::new(bbox);
    let mut passes = 0;

    loop {
        let counts = count_pass(&tree, source()?)?;
        let over_full: Vec<NodePath> = counts
            .iter()
            .filter(|&(_, &count)| count > max_per_leaf)
            .map(|(&path, _)| path)
            .collect();

        if over_full.is_empty() {
            info!(
                "tree construction converged after {} pass(es), {} leaves",
                passes,
                tree.leaves().len()
            );
            return Ok(BalanceOutcome {
                tree,
                leaf_counts: counts,
                passes,
            });
        }

        if passes >= max_passes {
            warn!(
                "refinement pass budget ({max_passes}) exhausted with {} over-full leaves",
                over_full.len()
            );
            return Ok(BalanceOutcome {
                tree,
                leaf_counts: counts,
                passes,
            });
        }

        passes += 1;
        debug!(
            "pass {passes}: splitting {} over-full leaves",
            over_full.len()
        );
        for path in over_full {
            tree.split(path)?;
        }
    }
}

/// Count records per leaf in one stream of the point set.
fn count_pass<I>(tree: &PartitionTree, points: I) -> Result<FxHashMap<NodePath, u64>>
where
    I: Iterator<Item = Result<Point>>,
{
    let mut counts: FxHashMap<NodePath, u64> = FxHashMap::default();
    let mut outside = 0u64;
    for point in points {
        let point = point?;
        match tree.query_point(point.lon, point.lat) {
            Some(leaf) => *counts.entry(leaf.path()).or_insert(0) += 1,
            None => outside += 1,
        }
    }
    if outside > 0 {
        warn!("{outside} points outside the tree bounding box were not counted");
    }
    Ok(counts)
}

/// Melt sibling leaf pairs whose combined count is below the threshold.
///
/// Inner nodes are visited deepest first, so a melt can cascade upward within
/// a single invocation; a second invocation finds nothing left to merge.
/// `leaf_counts` is updated in place to reflect the merged leaves.
pub fn compact(
    tree: &mut PartitionTree,
    leaf_counts: &mut FxHashMap<NodePath, u64>,
    max_per_leaf: u64,
) -> Result<usize> {
    let mut inner_paths: Vec<NodePath> = tree.inner_nodes().iter().map(|n| n.path()).collect();
    inner_paths.sort_by_key(|&p| std::cmp::Reverse(super::path::level(p)));

    let mut melted = 0;
    for parent in inner_paths {
        let Some(node) = tree.node(parent) else {
            continue;
        };
        let (Some(left), Some(right)) = (node.left(), node.right()) else {
            continue;
        };
        if !left.is_leaf() || !right.is_leaf() {
            continue;
        }
        let left_path = left.path();
        let right_path = right.path();
        let combined = leaf_counts.get(&left_path).copied().unwrap_or(0)
            + leaf_counts.get(&right_path).copied().unwrap_or(0);
        if combined < max_per_leaf {
            tree.melt(parent)?;
            leaf_counts.remove(&left_path);
            leaf_counts.remove(&right_path);
            if combined > 0 {
                leaf_counts.insert(parent, combined);
            }
            melted += 1;
        }
    }
    if melted > 0 {
        info!("compaction melted {melted} leaf pairs");
    }
    Ok(melted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;

    fn points(lons: &[f64]) -> Vec<Point> {
        lons.iter()
            .enumerate()
            .map(|(i, &lon)| Point::new(i as u64 + 1, lon, 0.0))
            .collect()
    }

    fn source(data: &[Point]) -> impl FnMut() -> Result<std::vec::IntoIter<Result<Point>>> + '_ {
        move || Ok(data.to_vec().into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }

    #[test]
    fn test_single_pass_bound_gives_two_leaves() {
        // Five points, threshold 2, one refinement pass allowed: one split of
        // the root, leaving leaves of sizes {3, 2}.
        let data = points(&[-170.0, -10.0, -10.0, 10.0, 170.0]);
        let outcome =
            build_tree(Envelope::planet(), 2, 1, source(&data)).unwrap();
        assert_eq!(outcome.passes, 1);
        let leaves = outcome.tree.leaves();
        assert_eq!(leaves.len(), 2);
        let mut sizes: Vec<u64> = leaves
            .iter()
            .map(|l| outcome.leaf_counts.get(&l.path()).copied().unwrap_or(0))
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 3]);

        // 2 + 3 < 2 is false on both sides, so compaction merges nothing.
        let mut tree = outcome.tree;
        let mut counts = outcome.leaf_counts;
        let melted = compact(&mut tree, &mut counts, 2).unwrap();
        assert_eq!(melted, 0);
        assert_eq!(tree.leaves().len(), 2);
    }

    #[test]
    fn test_construction_converges() {
        let data = points(&[-170.0, -10.0, 10.0, 170.0]);
        let outcome =
            build_tree(Envelope::planet(), 1, 16, source(&data)).unwrap();
        // Every leaf holds at most one record.
        for count in outcome.leaf_counts.values() {
            assert!(*count <= 1);
        }
        let total: u64 = outcome.leaf_counts.values().sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_pass_budget_stops_unbalanceable_input() {
        // Identical coordinates can never be split apart.
        let data = points(&[5.0, 5.0, 5.0, 5.0]);
        let outcome =
            build_tree(Envelope::planet(), 1, 4, source(&data)).unwrap();
        assert_eq!(outcome.passes, 4);
        assert!(outcome.leaf_counts.values().any(|&c| c > 1));
    }

    #[test]
    fn test_compaction_melts_underfull_siblings() {
        let data = points(&[-170.0, -10.0, 10.0, 170.0]);
        let mut outcome =
            build_tree(Envelope::planet(), 1, 16, source(&data)).unwrap();
        let before = outcome.tree.leaves().len();

        // With a raised threshold the fine-grained leaves merge back.
        let melted = compact(&mut outcome.tree, &mut outcome.leaf_counts, 10).unwrap();
        assert!(melted > 0);
        assert!(outcome.tree.leaves().len() < before);
        // All four records survive the merges.
        let total: u64 = outcome.leaf_counts.values().sum();
        assert_eq!(total, 4);
        // No merged leaf exceeds the threshold.
        for count in outcome.leaf_counts.values() {
            assert!(*count < 10);
        }
    }

    #[test]
    fn test_compaction_idempotent() {
        let data = points(&[-170.0, -10.0, 10.0, 170.0]);
        let mut outcome =
            build_tree(Envelope::planet(), 1, 16, source(&data)).unwrap();

        compact(&mut outcome.tree, &mut outcome.leaf_counts, 3).unwrap();
        let after_first: Vec<NodePath> =
            outcome.tree.leaves().iter().map(|l| l.path()).collect();

        let melted = compact(&mut outcome.tree, &mut outcome.leaf_counts, 3).unwrap();
        assert_eq!(melted, 0);
        let after_second: Vec<NodePath> =
            outcome.tree.leaves().iter().map(|l| l.path()).collect();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_points_outside_bbox_are_skipped() {
        let data = vec![
            Point::new(1, 10.0, 0.0),
            Point::new(2, 200.0, 0.0),
        ];
        let outcome =
            build_tree(Envelope::planet(), 10, 4, source(&data)).unwrap();
        let total: u64 = outcome.leaf_counts.values().sum();
        assert_eq!(total, 1);
    }
}
