//! Bottom-up tree reconstruction from the on-disk leaf directory set.
//!
//! No structural metadata is stored beyond the leaf directory names and the
//! root bounding box. Leaf paths are bucketed by level and paired with their
//! siblings from the deepest level upward; every pair produces its parent one
//! level up. A missing sibling or a duplicate parent means the directory set
//! cannot have come from a valid tree and is fatal. The surviving "has
//! children" set then drives a top-down re-split from a fresh root, which
//! reproduces the original shape and envelopes exactly because the split
//! rule is deterministic.

use crate::error::{Result, ShardError};
use crate::layout::ShardLayout;
use crate::tree::{Envelope, NodePath, PartitionTree, path};
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;

/// Rebuild a tree from its set of leaf paths. Pure function of the inputs.
pub fn from_leaf_paths<I>(bbox: Envelope, leaf_paths: I) -> Result<PartitionTree>
where
    I: IntoIterator<Item = NodePath>,
{
    let mut by_level: FxHashMap<u32, FxHashSet<NodePath>> = FxHashMap::default();
    let mut max_level = 0;
    let mut total = 0usize;
    for p in leaf_paths {
        let level = path::level(p);
        max_level = max_level.max(level);
        if !by_level.entry(level).or_default().insert(p) {
            return Err(ShardError::StructuralCorruption(format!(
                "duplicate leaf path {:x}",
                p
            )));
        }
        total += 1;
    }

    if total == 0 {
        return Err(ShardError::StructuralCorruption(
            "no leaf directories found".to_string(),
        ));
    }

    let mut has_children: FxHashSet<NodePath> = FxHashSet::default();

    for level in (1..=max_level).rev() {
        let mut bucket = by_level.remove(&level).unwrap_or_default();
        while let Some(&p) = bucket.iter().next() {
            bucket.remove(&p);
            let sibling = path::sibling(p);
            if !bucket.remove(&sibling) {
                return Err(ShardError::StructuralCorruption(format!(
                    "leaf {:x} at level {} has no sibling {:x}",
                    p, level, sibling
                )));
            }
            let parent = path::parent(p);
            if !by_level.entry(level - 1).or_default().insert(parent) {
                return Err(ShardError::StructuralCorruption(format!(
                    "duplicate parent {:x} at level {}",
                    parent,
                    level - 1
                )));
            }
            has_children.insert(parent);
        }
    }

    let root_bucket = by_level.remove(&0).unwrap_or_default();
    if root_bucket.len() != 1 || !root_bucket.contains(&path::ROOT) {
        return Err(ShardError::StructuralCorruption(format!(
            "levels did not reduce to the root (got {} paths at level 0)",
            root_bucket.len()
        )));
    }

    let mut tree = PartitionTree::new(bbox);
    expand(&mut tree, path::ROOT, &has_children)?;
    Ok(tree)
}

fn expand(tree: &mut PartitionTree, p: NodePath, has_children: &FxHashSet<NodePath>) -> Result<()> {
    if has_children.contains(&p) {
        tree.split(p)?;
        expand(tree, path::left_child(p), has_children)?;
        expand(tree, path::right_child(p), has_children)?;
    }
    Ok(())
}

/// Rebuild a tree from a shard base directory: the bounding box comes from
/// the metadata file, the leaf set from the hex-named sub-directories.
/// Unexpected directory names are logged and skipped, not fatal.
pub fn from_directory(base: &Path) -> Result<PartitionTree> {
    let layout = ShardLayout::open(base)?;
    let bbox = layout.read_bbox()?;

    let mut leaf_paths = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        match path::from_hex(&name) {
            Some(p) => leaf_paths.push(p),
            None => warn!("skipping unexpected directory name '{name}' in {base:?}"),
        }
    }

    from_leaf_paths(bbox, leaf_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::PartitionTree;

    fn leaf_paths(tree: &PartitionTree) -> Vec<NodePath> {
        let mut paths: Vec<_> = tree.leaves().iter().map(|l| l.path()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_round_trip_single_leaf() {
        let tree = from_leaf_paths(Envelope::planet(), [1]).unwrap();
        assert!(tree.root().is_leaf());
    }

    #[test]
    fn test_round_trip_reconstruction() {
        let mut original = PartitionTree::new(Envelope::planet());
        original.split(1).unwrap();
        original.split(2).unwrap();
        original.split(5).unwrap();

        let rebuilt =
            from_leaf_paths(Envelope::planet(), leaf_paths(&original)).unwrap();

        assert_eq!(leaf_paths(&rebuilt), leaf_paths(&original));
        for leaf in original.leaves() {
            let twin = rebuilt.node(leaf.path()).unwrap();
            assert_eq!(twin.envelope(), leaf.envelope());
        }
    }

    #[test]
    fn test_missing_sibling_is_fatal() {
        // {6, 7} pairs into 3, whose sibling 2 is absent.
        let err = from_leaf_paths(Envelope::planet(), [6, 7]).unwrap_err();
        assert!(matches!(err, ShardError::StructuralCorruption(_)));

        let err = from_leaf_paths(Envelope::planet(), [2, 6]).unwrap_err();
        assert!(matches!(err, ShardError::StructuralCorruption(_)));
    }

    #[test]
    fn test_duplicate_parent_is_fatal() {
        // 4 and 5 produce parent 2, which is also present as a leaf.
        let err = from_leaf_paths(Envelope::planet(), [2, 3, 4, 5]).unwrap_err();
        assert!(matches!(err, ShardError::StructuralCorruption(_)));
    }

    #[test]
    fn test_empty_set_is_fatal() {
        let err = from_leaf_paths(Envelope::planet(), []).unwrap_err();
        assert!(matches!(err, ShardError::StructuralCorruption(_)));
    }
}
