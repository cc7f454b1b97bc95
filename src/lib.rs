//! Disk-resident spatial partitioning for planet-scale geodata.
//!
//! Points, polylines and relations stream through a capacity-balanced
//! binary partition tree and land in per-leaf shard directories; a closure
//! repair pass then makes every shard referentially self-contained, so a
//! consumer can process one directory without ever touching another.
//!
//! ```rust,no_run
//! use geoshard::{Config, Pipeline, Result};
//! # use geoshard::{Point, Polyline, Relation};
//!
//! # fn points() -> Result<std::vec::IntoIter<Result<Point>>> { Ok(vec![].into_iter()) }
//! # fn lines() -> Result<std::vec::IntoIter<Result<Polyline>>> { Ok(vec![].into_iter()) }
//! # fn relations() -> Result<std::vec::IntoIter<Result<Relation>>> { Ok(vec![].into_iter()) }
//! let pipeline = Pipeline::new("/data/shards")
//!     .with_config(Config::default().with_max_records_per_leaf(500_000));
//! let stats = pipeline.run(points, lines, relations)?;
//! println!("{} points distributed", stats.points_distributed);
//! # Ok::<(), geoshard::ShardError>(())
//! ```

pub mod closure;
pub mod codec;
pub mod error;
pub mod layout;
pub mod mapper;
pub mod model;
pub mod pipeline;
pub mod relations;
pub mod tree;
pub mod types;

pub use error::{Result, ShardError};

pub use pipeline::Pipeline;
pub use types::{Config, PipelineStats};

pub use model::{EntityId, Member, MemberKind, Point, Polyline, Relation, Tags};

pub use tree::{Envelope, NodePath, PartitionTree, SplitAxis};

pub use layout::{FileRole, FileTable, ShardLayout};

pub use closure::{ClosureReport, ClosureResolver, ScanPlan, ShardHandle};

pub use mapper::{InMemoryLocator, PointLocator, SortedStreamLocator};

pub use relations::{ConnectivityGroup, GroupBatch};

pub use codec::{BinaryReader, BinaryWriter, Record, RecordSink, RecordSource};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Config, Pipeline, PipelineStats, Result, ShardError};

    pub use crate::{EntityId, Member, MemberKind, Point, Polyline, Relation};

    pub use crate::{Envelope, PartitionTree};

    pub use crate::{FileRole, ShardLayout};

    pub use crate::{ClosureResolver, ScanPlan};
}
