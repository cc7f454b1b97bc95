//! End-to-end sharding pipeline.
//!
//! Stages run in a fixed order: tree construction from the point stream,
//! compaction, point distribution, polyline mapping, per-leaf closure
//! repair, then relation handling (geometric mapping for relations without
//! relation members, connectivity grouping and batched repair for the
//! rest). Every stage reads the global entity streams through factory
//! closures so the same pipeline works against files, network sources or
//! in-memory fixtures, as long as each stream is id-ascending.

use crate::closure::{ClosureResolver, ScanPlan, ShardHandle};
use crate::error::{Result, ShardError};
use crate::layout::ShardLayout;
use crate::mapper::{SortedStreamLocator, distribute_points, map_lines, map_simple_relations};
use crate::model::{Point, Polyline, Relation};
use crate::relations::{distribute_batches, group_relations, pack_batches};
use crate::tree::balance::{build_tree, compact};
use crate::tree::{Envelope, PartitionTree, path};
use crate::types::{Config, PipelineStats};
use log::{debug, info};
use std::path::PathBuf;

/// One configured sharding run writing into a single output directory.
pub struct Pipeline {
    output: PathBuf,
    bbox: Envelope,
    config: Config,
}

impl Pipeline {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            bbox: Envelope::planet(),
            config: Config::default(),
        }
    }

    pub fn with_bbox(mut self, bbox: Envelope) -> Self {
        self.bbox = bbox;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Run the whole pipeline. Each source must yield a fresh id-ascending
    /// iterator over its global entity stream on every call; the point
    /// stream is re-scanned several times (counting, distribution, lookup,
    /// closure), which is the memory-for-I/O tradeoff this design makes.
    pub fn run<PF, PI, LF, LI, RF, RI>(
        &self,
        mut points: PF,
        mut lines: LF,
        mut relations: RF,
    ) -> Result<PipelineStats>
    where
        PF: FnMut() -> Result<PI>,
        PI: Iterator<Item = Result<Point>>,
        LF: FnMut() -> Result<LI>,
        LI: Iterator<Item = Result<Polyline>>,
        RF: FnMut() -> Result<RI>,
        RI: Iterator<Item = Result<Relation>>,
    {
        self.config.validate().map_err(ShardError::InvalidConfig)?;
        let cfg = &self.config;
        let layout = ShardLayout::create(&self.output)?;
        let mut stats = PipelineStats::new();

        // Stage 1: capacity-balanced tree over the point stream.
        let mut outcome = build_tree(
            self.bbox,
            cfg.max_records_per_leaf,
            cfg.max_refinement_passes,
            &mut points,
        )?;
        let melted = compact(&mut outcome.tree, &mut outcome.leaf_counts, cfg.max_records_per_leaf)?;
        let tree = outcome.tree;
        info!(
            "tree built in {} passes: {} leaves ({} melted back)",
            outcome.passes,
            tree.leaves().len(),
            melted
        );
        layout.write_bbox(tree.bbox())?;
        // Every leaf gets a directory up front, even ones that stay empty.
        // Reconstruction pairs sibling directories, so a missing empty leaf
        // would read as corruption later.
        for leaf in tree.leaves() {
            layout.ensure_leaf_dir(leaf.path())?;
        }

        // Stage 2: distribute points to their owning leaves.
        stats.points_distributed = distribute_points(
            &tree,
            &layout,
            points()?,
            cfg.writer_threads,
            cfg.write_queue_capacity,
        )?;
        info!("distributed {} points", stats.points_distributed);

        // Stage 3: map polylines to every leaf they touch.
        let line_outcome = {
            let mut locator = SortedStreamLocator::new(&mut points);
            map_lines(
                &tree,
                &layout,
                &mut locator,
                lines()?,
                cfg.locator_batch_size,
                cfg.writer_threads,
                cfg.write_queue_capacity,
            )?
        };
        stats.lines_written = line_outcome.written;
        stats.lines_unmatched = line_outcome.unmatched;
        info!(
            "mapped {} line copies ({} unmatched)",
            stats.lines_written, stats.lines_unmatched
        );

        // Stage 4: relations without relation members map geometrically,
        // exactly like polylines.
        let simple_outcome = {
            let mut locator = SortedStreamLocator::new(&mut points);
            map_simple_relations(
                &tree,
                &layout,
                &mut locator,
                relations()?.filter(only_simple),
                cfg.locator_batch_size,
                cfg.writer_threads,
                cfg.write_queue_capacity,
            )?
        };
        stats.relations_simple = simple_outcome.written;
        stats.relations_unmatched = simple_outcome.unmatched;

        // Stage 5: closure repair on every leaf shard, so each one is
        // self-contained.
        let shards = self.leaf_shards(&layout)?;
        let resolver = ClosureResolver::new(layout.file_table(), cfg.closure_workers)
            .with_retain_missing(cfg.retain_missing_lists);
        let report = resolver.repair(&shards, ScanPlan::leaves(), &mut points, &mut lines)?;
        stats.ids_recovered += report.points_recovered + report.lines_recovered;
        stats.ids_unresolved +=
            report.points_unresolved + report.lines_unresolved + report.relations_unresolved;

        // Stage 6: nested relations travel as whole connectivity groups,
        // packed into batch shards and repaired the same way.
        let groups = group_relations(relations()?.filter(only_complex))?;
        if !groups.is_empty() {
            stats.relations_complex = groups.iter().map(|g| g.members.len() as u64).sum();
            let batches = pack_batches(groups, cfg.max_batch_members);
            stats.relation_batches = batches.len() as u64;
            let batch_shards = distribute_batches(
                layout.base(),
                layout.file_table(),
                &batches,
                relations()?.filter(only_complex),
            )?;
            let report =
                resolver.repair(&batch_shards, ScanPlan::batches(), &mut points, &mut lines)?;
            stats.ids_recovered += report.points_recovered + report.lines_recovered;
            stats.ids_unresolved +=
                report.points_unresolved + report.lines_unresolved + report.relations_unresolved;
        }

        match stats.resolution_ratio() {
            Some(ratio) => info!(
                "pipeline done: {} ids recovered, {} unresolved ({:.2}% resolved)",
                stats.ids_recovered,
                stats.ids_unresolved,
                ratio * 100.0
            ),
            None => info!("pipeline done: no closure repair was needed"),
        }
        Ok(stats)
    }

    /// Reconstruct the tree an earlier run left on disk.
    pub fn reopen(&self) -> Result<PartitionTree> {
        crate::tree::reconstruct::from_directory(&self.output)
    }

    fn leaf_shards(&self, layout: &ShardLayout) -> Result<Vec<ShardHandle>> {
        let mut shards = Vec::new();
        for leaf in layout.leaf_dirs()? {
            shards.push(ShardHandle::new(path::to_hex(leaf), layout.leaf_dir(leaf)));
        }
        debug!("{} leaf shards under {:?}", shards.len(), layout.base());
        Ok(shards)
    }
}

fn only_simple(relation: &Result<Relation>) -> bool {
    match relation {
        Ok(rel) => rel.is_simple(),
        Err(_) => true,
    }
}

fn only_complex(relation: &Result<Relation>) -> bool {
    match relation {
        Ok(rel) => !rel.is_simple(),
        Err(_) => true,
    }
}
