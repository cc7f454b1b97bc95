//! Referential-closure repair for shard directories.
//!
//! After geometric assignment a leaf's line shard may reference points that
//! landed in other leaves. The resolver runs a per-shard state machine
//! (scan points, scan references, difference, extract, merge) and two global
//! fan-out extraction passes: one sequential scan of the id-ordered line
//! stream and one of the point stream serve every shard's sorted
//! missing-identifier list at once. Identifiers absent from the global
//! dataset are counted and logged, never dropped silently.
//!
//! The per-shard scan and merge steps are embarrassingly parallel and run on
//! a small fixed worker pool; when the task queue is full the submitting
//! thread runs the task itself, so progress never depends on queue space.

use crate::codec::{
    BinaryReader, BinaryWriter, IdListReader, RecordSink, RecordSource, write_id_list,
};
use crate::error::Result;
use crate::layout::{FileRole, FileTable};
use crate::model::{EntityId, MemberKind, Point, Polyline, Relation};
use crossbeam_channel::{TrySendError, bounded};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

/// Per-shard repair phases, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosurePhase {
    ScanningPoints,
    ScanningLines,
    Differencing,
    Extracting,
    Merging,
    Done,
}

/// One shard directory under repair: a tree leaf or a relation batch.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    pub label: String,
    pub dir: PathBuf,
}

impl ShardHandle {
    pub fn new(label: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            dir: dir.into(),
        }
    }

    fn file(&self, files: &FileTable, role: FileRole) -> PathBuf {
        self.dir.join(files.file_name(role))
    }
}

/// Which reference-carrying files the finder scans in each shard.
#[derive(Debug, Clone, Copy)]
pub struct ScanPlan {
    pub lines: bool,
    pub simple_relations: bool,
    pub complex_relations: bool,
}

impl ScanPlan {
    /// Scan set for tree leaves: lines plus geometrically mapped relations.
    pub fn leaves() -> Self {
        Self {
            lines: true,
            simple_relations: true,
            complex_relations: false,
        }
    }

    /// Scan set for relation batch shards.
    pub fn batches() -> Self {
        Self {
            lines: false,
            simple_relations: false,
            complex_relations: true,
        }
    }
}

/// Aggregated outcome of one repair run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosureReport {
    pub points_recovered: u64,
    pub points_unresolved: u64,
    pub lines_recovered: u64,
    pub lines_unresolved: u64,
    /// Relation members referencing relations absent from the whole dataset.
    pub relations_unresolved: u64,
}

/// Repairs a set of shard directories against global entity streams.
pub struct ClosureResolver<'a> {
    files: &'a FileTable,
    workers: usize,
    retain_missing: bool,
}

/// What one finder pass learned about a shard.
struct MissingSet {
    shard: usize,
    points: Vec<EntityId>,
    lines: Vec<EntityId>,
    relations_unresolved: u64,
}

impl<'a> ClosureResolver<'a> {
    pub fn new(files: &'a FileTable, workers: usize) -> Self {
        Self {
            files,
            workers,
            retain_missing: false,
        }
    }

    pub fn with_retain_missing(mut self, retain: bool) -> Self {
        self.retain_missing = retain;
        self
    }

    /// Repair every shard so that all referenced points (and, where lines
    /// are referenced by relations, all referenced lines and their points)
    /// are present locally or counted as globally unresolved.
    ///
    /// `point_source` and `line_source` must yield fresh id-ascending
    /// iterators over the global streams on each call.
    pub fn repair<PF, PI, LF, LI>(
        &self,
        shards: &[ShardHandle],
        plan: ScanPlan,
        mut point_source: PF,
        mut line_source: LF,
    ) -> Result<ClosureReport>
    where
        PF: FnMut() -> Result<PI>,
        PI: Iterator<Item = Result<Point>>,
        LF: FnMut() -> Result<LI>,
        LI: Iterator<Item = Result<Polyline>>,
    {
        let mut report = ClosureReport::default();
        if shards.is_empty() {
            return Ok(report);
        }

        // Scan and difference, in parallel across shards.
        let missing = self.run_parallel(
            (0..shards.len()).collect(),
            |shard_idx| self.find_missing(shard_idx, &shards[shard_idx], plan),
        )?;
        report.relations_unresolved = missing.iter().map(|m| m.relations_unresolved).sum();

        // Recover missing lines first; their points join the point pass.
        let mut line_lists: Vec<(usize, Vec<EntityId>)> = missing
            .iter()
            .filter(|m| !m.lines.is_empty())
            .map(|m| (m.shard, m.lines.clone()))
            .collect();
        if !line_lists.is_empty() {
            let (recovered, unresolved, extra_refs) =
                self.extract_lines(shards, &mut line_lists, line_source()?)?;
            report.lines_recovered = recovered;
            report.lines_unresolved = unresolved;

            // Fold the recovered lines' point references into the missing
            // lists, minus what the shard already owns.
            let extras = Mutex::new(extra_refs);
            let merged = self.run_parallel(
                missing,
                |mut m: MissingSet| {
                    let extra = extras.lock().remove(&m.shard);
                    if let Some(extra) = extra {
                        let owned = read_owned_ids(&shards[m.shard].file(self.files, FileRole::Points))?;
                        for id in extra {
                            if !owned.contains(&id) {
                                m.points.push(id);
                            }
                        }
                        m.points.sort_unstable();
                        m.points.dedup();
                        write_id_list(
                            shards[m.shard].file(self.files, FileRole::Missing),
                            &m.points,
                        )?;
                    }
                    Ok(m)
                },
            )?;
            return self.extract_and_merge(shards, merged, point_source()?, report);
        }

        self.extract_and_merge(shards, missing, point_source()?, report)
    }

    fn extract_and_merge<PI>(
        &self,
        shards: &[ShardHandle],
        missing: Vec<MissingSet>,
        points: PI,
        mut report: ClosureReport,
    ) -> Result<ClosureReport>
    where
        PI: Iterator<Item = Result<Point>>,
    {
        let mut point_lists: Vec<(usize, Vec<EntityId>)> = missing
            .into_iter()
            .filter(|m| !m.points.is_empty())
            .map(|m| (m.shard, m.points))
            .collect();

        if !point_lists.is_empty() {
            let (recovered, unresolved) = self.extract_points(shards, &mut point_lists, points)?;
            report.points_recovered = recovered;
            report.points_unresolved = unresolved;

            // Merge owned and recovered point files, in parallel.
            let merged: Vec<u64> = self.run_parallel(
                point_lists.iter().map(|(idx, _)| *idx).collect(),
                |shard_idx| self.merge_shard_points(&shards[shard_idx]),
            )?;
            debug!("merged recovered points into {} shards", merged.len());
        }

        if !self.retain_missing {
            for shard in shards {
                let path = shard.file(self.files, FileRole::Missing);
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
        }

        if report.points_unresolved + report.lines_unresolved + report.relations_unresolved > 0 {
            warn!(
                "closure left dangling references: {} points, {} lines, {} relations",
                report.points_unresolved, report.lines_unresolved, report.relations_unresolved
            );
        }
        info!(
            "closure repair recovered {} points and {} lines across {} shards",
            report.points_recovered,
            report.lines_recovered,
            shards.len()
        );
        Ok(report)
    }

    /// Scan one shard and write its sorted missing-point list.
    fn find_missing(
        &self,
        shard_idx: usize,
        shard: &ShardHandle,
        plan: ScanPlan,
    ) -> Result<MissingSet> {
        let mut phase = ClosurePhase::ScanningPoints;
        debug!("shard {}: {phase:?}", shard.label);
        let owned_points = read_owned_ids(&shard.file(self.files, FileRole::Points))?;

        phase = ClosurePhase::ScanningLines;
        debug!("shard {}: {phase:?}", shard.label);
        let mut referenced_points: FxHashSet<EntityId> = FxHashSet::default();
        let mut referenced_lines: FxHashSet<EntityId> = FxHashSet::default();
        let mut owned_lines: FxHashSet<EntityId> = FxHashSet::default();
        let mut owned_relations: FxHashSet<EntityId> = FxHashSet::default();
        let mut referenced_relations: FxHashSet<EntityId> = FxHashSet::default();

        if plan.lines {
            let path = shard.file(self.files, FileRole::Lines);
            if path.exists() {
                let mut reader = BinaryReader::<Polyline>::open(&path)?;
                while let Some(line) = reader.next_record()? {
                    owned_lines.insert(line.id);
                    referenced_points.extend(line.point_ids.iter().copied());
                }
            }
        }
        for (enabled, role) in [
            (plan.simple_relations, FileRole::RelationsSimple),
            (plan.complex_relations, FileRole::RelationsComplex),
        ] {
            if !enabled {
                continue;
            }
            let path = shard.file(self.files, role);
            if !path.exists() {
                continue;
            }
            let mut reader = BinaryReader::<Relation>::open(&path)?;
            while let Some(relation) = reader.next_record()? {
                owned_relations.insert(relation.id);
                for member in &relation.members {
                    match member.kind {
                        MemberKind::Point => {
                            referenced_points.insert(member.id);
                        }
                        MemberKind::Line => {
                            referenced_lines.insert(member.id);
                        }
                        MemberKind::Relation => {
                            referenced_relations.insert(member.id);
                        }
                    }
                }
            }
        }

        phase = ClosurePhase::Differencing;
        debug!("shard {}: {phase:?}", shard.label);
        let mut points: Vec<EntityId> = referenced_points
            .difference(&owned_points)
            .copied()
            .collect();
        points.sort_unstable();
        let mut lines: Vec<EntityId> = referenced_lines
            .difference(&owned_lines)
            .copied()
            .collect();
        lines.sort_unstable();

        // Relation members referencing relations outside the shard: grouping
        // already co-located everything reachable, so these are globally
        // absent and only counted.
        let relations_unresolved = referenced_relations
            .difference(&owned_relations)
            .count() as u64;

        write_id_list(shard.file(self.files, FileRole::Missing), &points)?;
        debug!(
            "shard {}: {} missing points, {} missing lines",
            shard.label,
            points.len(),
            lines.len()
        );
        Ok(MissingSet {
            shard: shard_idx,
            points,
            lines,
            relations_unresolved,
        })
    }

    /// One sequential pass over the global point stream serving every
    /// shard's sorted missing list. Emits per-shard recovered files.
    fn extract_points<PI>(
        &self,
        shards: &[ShardHandle],
        lists: &mut [(usize, Vec<EntityId>)],
        points: PI,
    ) -> Result<(u64, u64)>
    where
        PI: Iterator<Item = Result<Point>>,
    {
        struct Cursor<'s> {
            shard: &'s ShardHandle,
            ids: Vec<EntityId>,
            next: usize,
            writer: Option<BinaryWriter<Point>>,
        }

        // The missing list is re-read from disk: the finder's file is the
        // contract between the two passes.
        let mut cursors: Vec<Cursor> = Vec::with_capacity(lists.len());
        let mut heap: BinaryHeap<Reverse<(EntityId, usize)>> = BinaryHeap::new();
        for (slot, (shard_idx, _)) in lists.iter().enumerate() {
            let shard = &shards[*shard_idx];
            let ids = IdListReader::open(shard.file(self.files, FileRole::Missing))?.read_all()?;
            if let Some(&first) = ids.first() {
                heap.push(Reverse((first, slot)));
            }
            cursors.push(Cursor {
                shard,
                ids,
                next: 0,
                writer: None,
            });
        }

        let mut recovered = 0u64;
        let mut unresolved = 0u64;
        for point in points {
            let point = point?;
            loop {
                let Some(&Reverse((id, slot))) = heap.peek() else {
                    break;
                };
                if id > point.id {
                    break;
                }
                heap.pop();
                let cursor = &mut cursors[slot];
                if id == point.id {
                    let writer = match cursor.writer {
                        Some(ref mut w) => w,
                        None => {
                            let path = cursor.shard.file(self.files, FileRole::Recovered);
                            cursor.writer = Some(BinaryWriter::create(path)?);
                            cursor.writer.as_mut().unwrap()
                        }
                    };
                    writer.write(&point)?;
                    recovered += 1;
                } else {
                    // The stream moved past this id: nothing in the global
                    // set carries it.
                    unresolved += 1;
                    debug!("shard {}: point {} unresolved", cursor.shard.label, id);
                }
                cursor.next += 1;
                if let Some(&next_id) = cursor.ids.get(cursor.next) {
                    heap.push(Reverse((next_id, slot)));
                }
            }
            if heap.is_empty() {
                break;
            }
        }

        // Whatever requests remain after the stream ended are unresolved.
        while let Some(Reverse((_, slot))) = heap.pop() {
            let cursor = &mut cursors[slot];
            unresolved += 1;
            cursor.next += 1;
            if let Some(&next_id) = cursor.ids.get(cursor.next) {
                heap.push(Reverse((next_id, slot)));
            }
        }

        for cursor in &mut cursors {
            if let Some(writer) = &mut cursor.writer {
                writer.complete()?;
            }
        }
        Ok((recovered, unresolved))
    }

    /// Fan-out extraction of missing lines, appended straight onto each
    /// shard's line file. Returns the recovered lines' point references per
    /// shard for the follow-up point pass.
    #[allow(clippy::type_complexity)]
    fn extract_lines<LI>(
        &self,
        shards: &[ShardHandle],
        lists: &mut [(usize, Vec<EntityId>)],
        lines: LI,
    ) -> Result<(u64, u64, rustc_hash::FxHashMap<usize, Vec<EntityId>>)>
    where
        LI: Iterator<Item = Result<Polyline>>,
    {
        struct Cursor {
            shard: usize,
            ids: Vec<EntityId>,
            next: usize,
            writer: Option<BinaryWriter<Polyline>>,
            extra_refs: Vec<EntityId>,
        }

        let mut cursors: Vec<Cursor> = Vec::with_capacity(lists.len());
        let mut heap: BinaryHeap<Reverse<(EntityId, usize)>> = BinaryHeap::new();
        for (slot, (shard_idx, ids)) in lists.iter().enumerate() {
            if let Some(&first) = ids.first() {
                heap.push(Reverse((first, slot)));
            }
            cursors.push(Cursor {
                shard: *shard_idx,
                ids: ids.clone(),
                next: 0,
                writer: None,
                extra_refs: Vec::new(),
            });
        }

        let mut recovered = 0u64;
        let mut unresolved = 0u64;
        for line in lines {
            let line = line?;
            loop {
                let Some(&Reverse((id, slot))) = heap.peek() else {
                    break;
                };
                if id > line.id {
                    break;
                }
                heap.pop();
                let cursor = &mut cursors[slot];
                if id == line.id {
                    let writer = match cursor.writer {
                        Some(ref mut w) => w,
                        None => {
                            let path =
                                shards[cursor.shard].file(self.files, FileRole::Lines);
                            cursor.writer = Some(BinaryWriter::append(path)?);
                            cursor.writer.as_mut().unwrap()
                        }
                    };
                    writer.write(&line)?;
                    cursor.extra_refs.extend(line.point_ids.iter().copied());
                    recovered += 1;
                } else {
                    unresolved += 1;
                    debug!(
                        "shard {}: line {} unresolved",
                        shards[cursor.shard].label, id
                    );
                }
                cursor.next += 1;
                if let Some(&next_id) = cursor.ids.get(cursor.next) {
                    heap.push(Reverse((next_id, slot)));
                }
            }
            if heap.is_empty() {
                break;
            }
        }

        while let Some(Reverse((_, slot))) = heap.pop() {
            let cursor = &mut cursors[slot];
            unresolved += 1;
            cursor.next += 1;
            if let Some(&next_id) = cursor.ids.get(cursor.next) {
                heap.push(Reverse((next_id, slot)));
            }
        }

        let mut extra = rustc_hash::FxHashMap::default();
        for cursor in &mut cursors {
            if let Some(writer) = &mut cursor.writer {
                writer.complete()?;
            }
            if !cursor.extra_refs.is_empty() {
                extra.insert(cursor.shard, std::mem::take(&mut cursor.extra_refs));
            }
        }
        Ok((recovered, unresolved, extra))
    }

    /// Sorted merge of a shard's owned and recovered point files into its
    /// final point shard. Duplicate identifiers collapse to one record.
    fn merge_shard_points(&self, shard: &ShardHandle) -> Result<u64> {
        let phase = ClosurePhase::Merging;
        debug!("shard {}: {phase:?}", shard.label);

        let recovered_path = shard.file(self.files, FileRole::Recovered);
        if !recovered_path.exists() {
            return Ok(0);
        }
        let owned_path = shard.file(self.files, FileRole::Points);
        let merged_path = owned_path.with_extension("merged");

        let mut merged = 0u64;
        {
            let mut out = BinaryWriter::<Point>::create(&merged_path)?;
            let mut owned = if owned_path.exists() {
                Some(BinaryReader::<Point>::open(&owned_path)?)
            } else {
                None
            };
            let mut recovered = BinaryReader::<Point>::open(&recovered_path)?;

            let mut a = match owned.as_mut() {
                Some(reader) => reader.next_record()?,
                None => None,
            };
            let mut b = recovered.next_record()?;
            let mut last_id: Option<EntityId> = None;
            loop {
                let take_owned = match (&a, &b) {
                    (Some(x), Some(y)) => x.id <= y.id,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                let record = if take_owned {
                    let r = a.take().unwrap();
                    a = match owned.as_mut() {
                        Some(reader) => reader.next_record()?,
                        None => None,
                    };
                    r
                } else {
                    let r = b.take().unwrap();
                    b = recovered.next_record()?;
                    r
                };
                if last_id != Some(record.id) {
                    out.write(&record)?;
                    last_id = Some(record.id);
                    merged += 1;
                }
            }
            out.complete()?;
        }

        std::fs::rename(&merged_path, &owned_path)?;
        std::fs::remove_file(&recovered_path)?;
        debug!("shard {}: {:?}, {} points", shard.label, ClosurePhase::Done, merged);
        Ok(merged)
    }

    /// Run `task` over `items` on a fixed pool. When the queue is full the
    /// submitting thread runs the task itself instead of blocking.
    fn run_parallel<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Sync,
    {
        if self.workers <= 1 || items.len() <= 1 {
            return items.into_iter().map(&task).collect();
        }

        let results: Mutex<Vec<Result<R>>> = Mutex::new(Vec::with_capacity(items.len()));
        let (tx, rx) = bounded::<T>(self.workers);
        let task = &task;
        let results_ref = &results;

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let rx = rx.clone();
                scope.spawn(move || {
                    for item in rx.iter() {
                        let outcome = task(item);
                        results_ref.lock().push(outcome);
                    }
                });
            }
            drop(rx);

            for item in items {
                match tx.try_send(item) {
                    Ok(()) => {}
                    Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                        // Caller-runs backpressure.
                        let outcome = task(item);
                        results_ref.lock().push(outcome);
                    }
                }
            }
            drop(tx);
        });

        let collected = results.into_inner();
        let mut out = Vec::with_capacity(collected.len());
        for result in collected {
            out.push(result?);
        }
        Ok(out)
    }
}

fn read_owned_ids(path: &Path) -> Result<FxHashSet<EntityId>> {
    let mut owned = FxHashSet::default();
    if path.exists() {
        let mut reader = BinaryReader::<Point>::open(path)?;
        while let Some(point) = reader.next_record()? {
            owned.insert(point.id);
        }
    }
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordSink;
    use crate::model::Member;
    use tempfile::TempDir;

    fn files() -> FileTable {
        FileTable::default()
    }

    fn shard(dir: &Path, name: &str) -> ShardHandle {
        let path = dir.join(name);
        std::fs::create_dir_all(&path).unwrap();
        ShardHandle::new(name, path)
    }

    fn write_points(path: &Path, points: &[Point]) {
        let mut writer = BinaryWriter::create(path).unwrap();
        for p in points {
            writer.write(p).unwrap();
        }
        writer.complete().unwrap();
    }

    fn write_lines(path: &Path, lines: &[Polyline]) {
        let mut writer = BinaryWriter::create(path).unwrap();
        for l in lines {
            writer.write(l).unwrap();
        }
        writer.complete().unwrap();
    }

    fn read_point_ids(path: &Path) -> Vec<EntityId> {
        BinaryReader::<Point>::open(path)
            .unwrap()
            .read_all()
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect()
    }

    fn ok_iter<T: Clone>(items: &[T]) -> impl Iterator<Item = Result<T>> {
        items.to_vec().into_iter().map(Ok)
    }

    #[test]
    fn test_cross_shard_line_recovers_both_sides() {
        let dir = TempDir::new().unwrap();
        let files = files();
        let west = shard(dir.path(), "2");
        let east = shard(dir.path(), "3");

        let a = Point::new(1, -10.0, 0.0);
        let b = Point::new(2, 10.0, 0.0);
        let line = Polyline::new(100, vec![1, 2]);

        write_points(&west.file(&files, FileRole::Points), &[a.clone()]);
        write_points(&east.file(&files, FileRole::Points), &[b.clone()]);
        // The boundary-crossing line sits in both shards by design.
        write_lines(&west.file(&files, FileRole::Lines), std::slice::from_ref(&line));
        write_lines(&east.file(&files, FileRole::Lines), std::slice::from_ref(&line));

        let globals = vec![a, b];
        let resolver = ClosureResolver::new(&files, 1);
        let report = resolver
            .repair(
                &[west.clone(), east.clone()],
                ScanPlan::leaves(),
                || Ok(ok_iter(&globals)),
                || Ok(ok_iter::<Polyline>(&[])),
            )
            .unwrap();

        assert_eq!(report.points_recovered, 2);
        assert_eq!(report.points_unresolved, 0);
        assert_eq!(read_point_ids(&west.file(&files, FileRole::Points)), vec![1, 2]);
        assert_eq!(read_point_ids(&east.file(&files, FileRole::Points)), vec![1, 2]);
        // Transient files are gone.
        assert!(!west.file(&files, FileRole::Recovered).exists());
        assert!(!west.file(&files, FileRole::Missing).exists());
    }

    #[test]
    fn test_globally_absent_point_is_counted_not_dropped() {
        let dir = TempDir::new().unwrap();
        let files = files();
        let leaf = shard(dir.path(), "2");

        let a = Point::new(1, -10.0, 0.0);
        write_points(&leaf.file(&files, FileRole::Points), &[a.clone()]);
        write_lines(
            &leaf.file(&files, FileRole::Lines),
            &[Polyline::new(100, vec![1, 999])],
        );

        let globals = vec![a];
        let resolver = ClosureResolver::new(&files, 1);
        let report = resolver
            .repair(
                std::slice::from_ref(&leaf),
                ScanPlan::leaves(),
                || Ok(ok_iter(&globals)),
                || Ok(ok_iter::<Polyline>(&[])),
            )
            .unwrap();

        assert_eq!(report.points_recovered, 0);
        assert_eq!(report.points_unresolved, 1);
        assert_eq!(read_point_ids(&leaf.file(&files, FileRole::Points)), vec![1]);
    }

    #[test]
    fn test_merge_deduplicates_owned_and_recovered() {
        let dir = TempDir::new().unwrap();
        let files = files();
        let leaf = shard(dir.path(), "2");

        // Point 2 is owned but also referenced by a line alongside point 3.
        let p1 = Point::new(1, -10.0, 0.0);
        let p2 = Point::new(2, -11.0, 0.0);
        let p3 = Point::new(3, 11.0, 0.0);
        write_points(
            &leaf.file(&files, FileRole::Points),
            &[p1.clone(), p2.clone()],
        );
        write_lines(
            &leaf.file(&files, FileRole::Lines),
            &[Polyline::new(100, vec![2, 3])],
        );

        let globals = vec![p1, p2, p3];
        let resolver = ClosureResolver::new(&files, 1);
        let report = resolver
            .repair(
                std::slice::from_ref(&leaf),
                ScanPlan::leaves(),
                || Ok(ok_iter(&globals)),
                || Ok(ok_iter::<Polyline>(&[])),
            )
            .unwrap();

        assert_eq!(report.points_recovered, 1);
        // Each id appears exactly once after the merge.
        assert_eq!(read_point_ids(&leaf.file(&files, FileRole::Points)), vec![1, 2, 3]);
    }

    #[test]
    fn test_relation_line_member_pulls_line_and_its_points() {
        let dir = TempDir::new().unwrap();
        let files = files();
        let leaf = shard(dir.path(), "2");

        let p1 = Point::new(1, -10.0, 0.0);
        let p2 = Point::new(2, 10.0, 0.0);
        let line = Polyline::new(50, vec![1, 2]);
        write_points(&leaf.file(&files, FileRole::Points), &[p1.clone()]);

        let relation = Relation::new(7, vec![Member::point(1), Member::line(50)]);
        let mut writer =
            BinaryWriter::create(leaf.file(&files, FileRole::RelationsSimple)).unwrap();
        writer.write(&relation).unwrap();
        writer.complete().unwrap();

        let global_points = vec![p1, p2];
        let global_lines = vec![line];
        let resolver = ClosureResolver::new(&files, 1);
        let report = resolver
            .repair(
                std::slice::from_ref(&leaf),
                ScanPlan::leaves(),
                || Ok(ok_iter(&global_points)),
                || Ok(ok_iter(&global_lines)),
            )
            .unwrap();

        assert_eq!(report.lines_recovered, 1);
        // The recovered line's second endpoint came along too.
        assert_eq!(report.points_recovered, 1);
        assert_eq!(read_point_ids(&leaf.file(&files, FileRole::Points)), vec![1, 2]);

        let lines = BinaryReader::<Polyline>::open(leaf.file(&files, FileRole::Lines))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, 50);
    }

    #[test]
    fn test_retain_missing_lists() {
        let dir = TempDir::new().unwrap();
        let files = files();
        let leaf = shard(dir.path(), "2");

        write_points(&leaf.file(&files, FileRole::Points), &[Point::new(1, -10.0, 0.0)]);
        write_lines(
            &leaf.file(&files, FileRole::Lines),
            &[Polyline::new(100, vec![1, 2])],
        );

        let globals = vec![Point::new(1, -10.0, 0.0), Point::new(2, 10.0, 0.0)];
        let resolver = ClosureResolver::new(&files, 1).with_retain_missing(true);
        resolver
            .repair(
                std::slice::from_ref(&leaf),
                ScanPlan::leaves(),
                || Ok(ok_iter(&globals)),
                || Ok(ok_iter::<Polyline>(&[])),
            )
            .unwrap();

        let retained = IdListReader::open(leaf.file(&files, FileRole::Missing))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(retained, vec![2]);
    }

    #[test]
    fn test_parallel_repair_matches_serial() {
        let dir = TempDir::new().unwrap();
        let files = files();

        let mut shards = Vec::new();
        let mut globals = Vec::new();
        for i in 0..6u64 {
            let handle = shard(dir.path(), &format!("{:x}", i + 2));
            let own = Point::new(i * 10 + 1, -10.0, 0.0);
            let other = Point::new(i * 10 + 2, 10.0, 0.0);
            write_points(&handle.file(&files, FileRole::Points), &[own.clone()]);
            write_lines(
                &handle.file(&files, FileRole::Lines),
                &[Polyline::new(i * 10 + 5, vec![own.id, other.id])],
            );
            globals.push(own);
            globals.push(other);
            shards.push(handle);
        }
        globals.sort_by_key(|p| p.id);

        let resolver = ClosureResolver::new(&files, 3);
        let report = resolver
            .repair(
                &shards,
                ScanPlan::leaves(),
                || Ok(ok_iter(&globals)),
                || Ok(ok_iter::<Polyline>(&[])),
            )
            .unwrap();

        assert_eq!(report.points_recovered, 6);
        assert_eq!(report.points_unresolved, 0);
        for (i, handle) in shards.iter().enumerate() {
            let ids = read_point_ids(&handle.file(&files, FileRole::Points));
            let i = i as u64;
            assert_eq!(ids, vec![i * 10 + 1, i * 10 + 2]);
        }
    }
}
