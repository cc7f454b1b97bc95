//! Pipeline configuration and run statistics.
//!
//! The configuration is designed to be easily serializable and loadable
//! from JSON while keeping complexity minimal.

use serde::{Deserialize, Serialize};

/// Pipeline configuration.
///
/// # Example
///
/// ```rust
/// use geoshard::Config;
///
/// let config = Config::default();
///
/// let json = r#"{
///     "max_records_per_leaf": 500000,
///     "closure_workers": 4
/// }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum number of point records a leaf shard may hold.
    #[serde(default = "Config::default_max_records_per_leaf")]
    pub max_records_per_leaf: u64,

    /// Maximum number of split-and-recount passes during tree construction.
    #[serde(default = "Config::default_max_refinement_passes")]
    pub max_refinement_passes: usize,

    /// Capacity of the bounded write-request queue between the classifying
    /// producer and the shard writers.
    #[serde(default = "Config::default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Number of shard-writer threads. Leaves are routed to writers by path,
    /// so each leaf file is only ever appended to by one thread.
    #[serde(default = "Config::default_writer_threads")]
    pub writer_threads: usize,

    /// Worker pool size for the per-leaf closure passes. Each worker
    /// materializes one leaf's line shard, so this bounds peak memory.
    #[serde(default = "Config::default_closure_workers")]
    pub closure_workers: usize,

    /// Maximum total member count per relation batch.
    #[serde(default = "Config::default_max_batch_members")]
    pub max_batch_members: u64,

    /// Number of polylines resolved per pass when using the sorted-stream
    /// point lookup strategy.
    #[serde(default = "Config::default_locator_batch_size")]
    pub locator_batch_size: usize,

    /// Keep per-leaf missing-identifier files after extraction instead of
    /// deleting them.
    #[serde(default)]
    pub retain_missing_lists: bool,
}

impl Config {
    const fn default_max_records_per_leaf() -> u64 {
        1_000_000
    }

    const fn default_max_refinement_passes() -> usize {
        32
    }

    const fn default_write_queue_capacity() -> usize {
        2048
    }

    const fn default_writer_threads() -> usize {
        1
    }

    const fn default_closure_workers() -> usize {
        3
    }

    const fn default_max_batch_members() -> u64 {
        1_000_000
    }

    const fn default_locator_batch_size() -> usize {
        100_000
    }

    pub fn with_max_records_per_leaf(mut self, max: u64) -> Self {
        self.max_records_per_leaf = max;
        self
    }

    pub fn with_max_refinement_passes(mut self, passes: usize) -> Self {
        self.max_refinement_passes = passes;
        self
    }

    pub fn with_closure_workers(mut self, workers: usize) -> Self {
        self.closure_workers = workers;
        self
    }

    pub fn with_writer_threads(mut self, writers: usize) -> Self {
        self.writer_threads = writers;
        self
    }

    pub fn with_max_batch_members(mut self, max: u64) -> Self {
        self.max_batch_members = max;
        self
    }

    pub fn with_retain_missing_lists(mut self, retain: bool) -> Self {
        self.retain_missing_lists = retain;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_records_per_leaf == 0 {
            return Err("max_records_per_leaf must be greater than zero".to_string());
        }
        if self.max_refinement_passes == 0 {
            return Err("max_refinement_passes must be greater than zero".to_string());
        }
        if self.write_queue_capacity == 0 {
            return Err("write_queue_capacity must be greater than zero".to_string());
        }
        if self.writer_threads == 0 {
            return Err("writer_threads must be greater than zero".to_string());
        }
        if self.closure_workers == 0 {
            return Err("closure_workers must be greater than zero".to_string());
        }
        if self.max_batch_members == 0 {
            return Err("max_batch_members must be greater than zero".to_string());
        }
        if self.locator_batch_size == 0 {
            return Err("locator_batch_size must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Config = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(serde::de::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_records_per_leaf: Self::default_max_records_per_leaf(),
            max_refinement_passes: Self::default_max_refinement_passes(),
            write_queue_capacity: Self::default_write_queue_capacity(),
            writer_threads: Self::default_writer_threads(),
            closure_workers: Self::default_closure_workers(),
            max_batch_members: Self::default_max_batch_members(),
            locator_batch_size: Self::default_locator_batch_size(),
            retain_missing_lists: false,
        }
    }
}

/// Aggregated counters for one pipeline run.
///
/// Per-reference outcomes are counted, never silently dropped; the
/// found/missing ratio is the operator-facing data-quality signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Points assigned to leaf shards during distribution.
    pub points_distributed: u64,
    /// Polylines written to leaf shards (counted once per leaf copy).
    pub lines_written: u64,
    /// Polylines with zero resolvable points, routed to the overflow file.
    pub lines_unmatched: u64,
    /// Referenced identifiers recovered into a leaf during closure repair.
    pub ids_recovered: u64,
    /// Referenced identifiers absent from the global dataset.
    pub ids_unresolved: u64,
    /// Relations assigned geometrically (no relation members).
    pub relations_simple: u64,
    /// Simple relations with zero resolvable points, routed to overflow.
    pub relations_unmatched: u64,
    /// Relations routed through connectivity grouping.
    pub relations_complex: u64,
    /// Relation batches produced by the packing stage.
    pub relation_batches: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of referenced identifiers that resolved somewhere in the
    /// global dataset. `None` when no repair was needed.
    pub fn resolution_ratio(&self) -> Option<f64> {
        let total = self.ids_recovered + self.ids_unresolved;
        if total == 0 {
            None
        } else {
            Some(self.ids_recovered as f64 / total as f64)
        }
    }

    /// Merge counters from one leaf's pipeline run.
    pub fn absorb(&mut self, other: &PipelineStats) {
        self.points_distributed += other.points_distributed;
        self.lines_written += other.lines_written;
        self.lines_unmatched += other.lines_unmatched;
        self.ids_recovered += other.ids_recovered;
        self.ids_unresolved += other.ids_unresolved;
        self.relations_simple += other.relations_simple;
        self.relations_unmatched += other.relations_unmatched;
        self.relations_complex += other.relations_complex;
        self.relation_batches += other.relation_batches;
    }
}
