//! Binary spatial partition tree.
//!
//! The tree is addressed like an implicit binary heap: the root has path 1,
//! a node at path `p` has children `2p` and `2p+1`. A node's envelope is the
//! disjoint union of its children's envelopes (shared boundary excepted), and
//! the root's envelope equals the configured bounding box. Leaves own the
//! data shards; the tree itself is read-only once construction and balancing
//! finish.

pub mod balance;
pub mod reconstruct;

use crate::error::{Result, ShardError};
use geo::{Coord, Intersects, Rect};
use serde::{Deserialize, Serialize};

/// Node address in implicit-binary-heap form. Root is 1.
pub type NodePath = u64;

/// Path arithmetic for heap-addressed nodes.
pub mod path {
    use super::NodePath;

    pub const ROOT: NodePath = 1;

    /// Flips the lowest bit. Undefined for the root.
    pub fn sibling(p: NodePath) -> NodePath {
        p ^ 1
    }

    pub fn parent(p: NodePath) -> NodePath {
        p >> 1
    }

    pub fn left_child(p: NodePath) -> NodePath {
        p << 1
    }

    pub fn right_child(p: NodePath) -> NodePath {
        (p << 1) | 1
    }

    /// Depth of the node; position of the highest set bit. Root is level 0.
    pub fn level(p: NodePath) -> u32 {
        debug_assert!(p >= 1);
        63 - p.leading_zeros()
    }

    /// Directory name on disk: lowercase hexadecimal.
    pub fn to_hex(p: NodePath) -> String {
        format!("{p:x}")
    }

    pub fn from_hex(name: &str) -> Option<NodePath> {
        match NodePath::from_str_radix(name, 16) {
            Ok(p) if p >= 1 => Some(p),
            _ => None,
        }
    }
}

/// Axis a node splits along. Alternates with depth so envelopes stay close
/// to square as the tree deepens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    Longitude,
    Latitude,
}

impl SplitAxis {
    pub fn for_level(level: u32) -> Self {
        if level % 2 == 0 {
            SplitAxis::Longitude
        } else {
            SplitAxis::Latitude
        }
    }
}

/// Axis-aligned bounding rectangle in lon/lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl Envelope {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// The whole-planet envelope.
    pub fn planet() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// Closed containment test, used only at the tree root.
    pub fn contains_closed(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    fn split(&self, axis: SplitAxis) -> (Envelope, Envelope) {
        match axis {
            SplitAxis::Longitude => {
                let mid = (self.min_lon + self.max_lon) / 2.0;
                (
                    Envelope::new(self.min_lon, self.min_lat, mid, self.max_lat),
                    Envelope::new(mid, self.min_lat, self.max_lon, self.max_lat),
                )
            }
            SplitAxis::Latitude => {
                let mid = (self.min_lat + self.max_lat) / 2.0;
                (
                    Envelope::new(self.min_lon, self.min_lat, self.max_lon, mid),
                    Envelope::new(self.min_lon, mid, self.max_lon, self.max_lat),
                )
            }
        }
    }
}

/// One node of the partition tree. Children are both present or both absent.
#[derive(Debug, Clone)]
pub struct PartitionNode {
    path: NodePath,
    envelope: Envelope,
    children: Option<Box<(PartitionNode, PartitionNode)>>,
}

impl PartitionNode {
    fn new_leaf(path: NodePath, envelope: Envelope) -> Self {
        Self {
            path,
            envelope,
            children: None,
        }
    }

    pub fn path(&self) -> NodePath {
        self.path
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn level(&self) -> u32 {
        path::level(self.path)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn left(&self) -> Option<&PartitionNode> {
        self.children.as_ref().map(|c| &c.0)
    }

    pub fn right(&self) -> Option<&PartitionNode> {
        self.children.as_ref().map(|c| &c.1)
    }

    /// Replace this leaf with two children partitioning its envelope along
    /// the axis for this node's level.
    fn split(&mut self) {
        debug_assert!(self.is_leaf());
        let axis = SplitAxis::for_level(self.level());
        let (left_env, right_env) = self.envelope.split(axis);
        let left = PartitionNode::new_leaf(path::left_child(self.path), left_env);
        let right = PartitionNode::new_leaf(path::right_child(self.path), right_env);
        self.children = Some(Box::new((left, right)));
    }

    /// Demote this inner node back to a leaf, discarding its children.
    fn melt(&mut self) {
        self.children = None;
    }

    /// Which child a coordinate descends into. Points on the split boundary
    /// go right; the rule only compares the split axis so coordinates on a
    /// node's outer edges stay on their correct side.
    fn descend(&self, lon: f64, lat: f64) -> &PartitionNode {
        debug_assert!(!self.is_leaf());
        let children = self.children.as_ref().unwrap();
        let boundary_left = &children.0.envelope;
        let go_left = match SplitAxis::for_level(self.level()) {
            SplitAxis::Longitude => lon < boundary_left.max_lon,
            SplitAxis::Latitude => lat < boundary_left.max_lat,
        };
        if go_left { &children.0 } else { &children.1 }
    }
}

/// Owns the root node; created fresh from a bounding box or rebuilt from the
/// on-disk leaf directory set.
#[derive(Debug, Clone)]
pub struct PartitionTree {
    root: PartitionNode,
}

impl PartitionTree {
    /// A single-leaf tree covering the given bounding box.
    pub fn new(bbox: Envelope) -> Self {
        Self {
            root: PartitionNode::new_leaf(path::ROOT, bbox),
        }
    }

    pub fn root(&self) -> &PartitionNode {
        &self.root
    }

    pub fn bbox(&self) -> &Envelope {
        &self.root.envelope
    }

    /// The leaf owning the coordinate, or `None` outside the root envelope.
    ///
    /// The boundary tie-break (split boundary goes right, root edges closed)
    /// is identical at construction counting and at lookup, which downstream
    /// closure correctness depends on.
    pub fn query_point(&self, lon: f64, lat: f64) -> Option<&PartitionNode> {
        if !self.root.envelope.contains_closed(lon, lat) {
            return None;
        }
        let mut node = &self.root;
        while !node.is_leaf() {
            node = node.descend(lon, lat);
        }
        Some(node)
    }

    /// Every leaf whose envelope intersects the geometry.
    pub fn query_geometry(&self, geometry: &geo::Geometry<f64>) -> Vec<&PartitionNode> {
        let mut hits = Vec::new();
        Self::collect_geometry(&self.root, geometry, &mut hits);
        hits
    }

    fn collect_geometry<'a>(
        node: &'a PartitionNode,
        geometry: &geo::Geometry<f64>,
        hits: &mut Vec<&'a PartitionNode>,
    ) {
        if !geometry.intersects(&node.envelope.to_rect()) {
            return;
        }
        match &node.children {
            None => hits.push(node),
            Some(children) => {
                Self::collect_geometry(&children.0, geometry, hits);
                Self::collect_geometry(&children.1, geometry, hits);
            }
        }
    }

    /// All leaves, in path-order of a depth-first traversal.
    pub fn leaves(&self) -> Vec<&PartitionNode> {
        let mut out = Vec::new();
        Self::collect(&self.root, &mut |n| n.is_leaf(), &mut out);
        out
    }

    /// All inner nodes.
    pub fn inner_nodes(&self) -> Vec<&PartitionNode> {
        let mut out = Vec::new();
        Self::collect(&self.root, &mut |n| !n.is_leaf(), &mut out);
        out
    }

    fn collect<'a>(
        node: &'a PartitionNode,
        keep: &mut dyn FnMut(&PartitionNode) -> bool,
        out: &mut Vec<&'a PartitionNode>,
    ) {
        if keep(node) {
            out.push(node);
        }
        if let Some(children) = &node.children {
            Self::collect(&children.0, keep, out);
            Self::collect(&children.1, keep, out);
        }
    }

    /// Look up a node by its path.
    pub fn node(&self, target: NodePath) -> Option<&PartitionNode> {
        let mut node = &self.root;
        let level = path::level(target);
        for depth in (0..level).rev() {
            let children = node.children.as_ref()?;
            let bit = (target >> depth) & 1;
            node = if bit == 0 { &children.0 } else { &children.1 };
        }
        (node.path == target).then_some(node)
    }

    fn node_mut(&mut self, target: NodePath) -> Option<&mut PartitionNode> {
        let mut node = &mut self.root;
        let level = path::level(target);
        for depth in (0..level).rev() {
            let children = node.children.as_mut()?;
            let bit = (target >> depth) & 1;
            node = if bit == 0 { &mut children.0 } else { &mut children.1 };
        }
        (node.path == target).then_some(node)
    }

    /// Split the leaf at `target` into two children.
    pub fn split(&mut self, target: NodePath) -> Result<()> {
        let node = self
            .node_mut(target)
            .ok_or_else(|| ShardError::StructuralCorruption(format!("no node at path {target:x}")))?;
        if !node.is_leaf() {
            return Err(ShardError::StructuralCorruption(format!(
                "split target {target:x} is not a leaf"
            )));
        }
        node.split();
        Ok(())
    }

    /// Melt the inner node at `target` back into a leaf. Both children must
    /// be leaves.
    pub fn melt(&mut self, target: NodePath) -> Result<()> {
        let node = self
            .node_mut(target)
            .ok_or_else(|| ShardError::StructuralCorruption(format!("no node at path {target:x}")))?;
        match &node.children {
            Some(children) if children.0.is_leaf() && children.1.is_leaf() => {
                node.melt();
                Ok(())
            }
            Some(_) => Err(ShardError::StructuralCorruption(format!(
                "melt target {target:x} has non-leaf children"
            ))),
            None => Err(ShardError::StructuralCorruption(format!(
                "melt target {target:x} is a leaf"
            ))),
        }
    }
}
