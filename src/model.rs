//! Entity records flowing through the pipeline.
//!
//! Points, polylines, and relations reference each other by 64-bit
//! identifier. The core only reads identifiers and coordinates; tags are
//! carried opaquely so shards stay lossless.

use serde::{Deserialize, Serialize};

/// Entity identifier. Input streams are assumed ascending per entity kind.
pub type EntityId = u64;

/// Key-value tag list. Kept as a plain vector to preserve input order.
pub type Tags = Vec<(String, String)>;

/// A coordinate point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: EntityId,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
}

impl Point {
    pub fn new(id: EntityId, lon: f64, lat: f64) -> Self {
        Self {
            id,
            lon,
            lat,
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// An ordered sequence of point references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub id: EntityId,
    pub point_ids: Vec<EntityId>,
    pub tags: Tags,
}

impl Polyline {
    pub fn new(id: EntityId, point_ids: Vec<EntityId>) -> Self {
        Self {
            id,
            point_ids,
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// The kind of entity a relation member refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberKind {
    Point,
    Line,
    Relation,
}

/// One typed member reference within a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub kind: MemberKind,
    pub id: EntityId,
    /// Role string, carried opaquely.
    pub role: String,
}

impl Member {
    pub fn new(kind: MemberKind, id: EntityId, role: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            role: role.into(),
        }
    }

    pub fn point(id: EntityId) -> Self {
        Self::new(MemberKind::Point, id, "")
    }

    pub fn line(id: EntityId) -> Self {
        Self::new(MemberKind::Line, id, "")
    }

    pub fn relation(id: EntityId) -> Self {
        Self::new(MemberKind::Relation, id, "")
    }
}

/// A multi-part entity referencing points, lines, and other relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: EntityId,
    pub members: Vec<Member>,
    pub tags: Tags,
}

impl Relation {
    pub fn new(id: EntityId, members: Vec<Member>) -> Self {
        Self {
            id,
            members,
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// True when no member refers to another relation. Simple relations are
    /// assigned to leaves geometrically; complex ones go through grouping.
    pub fn is_simple(&self) -> bool {
        self.members.iter().all(|m| m.kind != MemberKind::Relation)
    }

    pub fn member_ids(&self, kind: MemberKind) -> impl Iterator<Item = EntityId> + '_ {
        self.members
            .iter()
            .filter(move |m| m.kind == kind)
            .map(|m| m.id)
    }
}
