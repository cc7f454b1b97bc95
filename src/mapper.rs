//! Assignment of entities to tree leaves, and the bounded write pipeline
//! that appends them to per-leaf shard files.
//!
//! A single producer classifies entities against the tree and pushes write
//! requests into bounded per-writer channels; writer threads drain them and
//! append to the shard files. The blocking send on a full channel is the
//! backpressure: the producer stalls instead of growing memory. Each leaf is
//! routed to exactly one writer so no shard file ever has two appenders.

use crate::codec::{BinaryWriter, Record, RecordSink};
use crate::error::{Result, ShardError};
use crate::layout::{FileRole, ShardLayout};
use crate::model::{EntityId, MemberKind, Point, Polyline, Relation};
use crate::tree::{NodePath, PartitionTree};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Destination of one write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Leaf(NodePath),
    /// The run-global overflow file for entities with no resolvable points.
    Unmatched,
}

/// One unit of work for a shard writer.
#[derive(Debug)]
pub struct WriteRequest<T> {
    pub target: WriteTarget,
    pub record: T,
}

/// Run `produce` against a pool of shard writers appending files of `role`.
///
/// The closure receives a blocking submit function; submission fails with
/// [`ShardError::PoolShutdown`] if a writer died. Every sink is finalized
/// before this returns on the success path, and flushed best-effort on drop
/// otherwise.
pub fn with_shard_writers<T, P>(
    layout: &ShardLayout,
    role: FileRole,
    threads: usize,
    queue_capacity: usize,
    produce: P,
) -> Result<()>
where
    T: Record + Send,
    P: FnOnce(&mut dyn FnMut(WriteRequest<T>) -> Result<()>) -> Result<()>,
{
    let mut senders: Vec<Sender<WriteRequest<T>>> = Vec::with_capacity(threads);
    let mut receivers: Vec<Receiver<WriteRequest<T>>> = Vec::with_capacity(threads);
    for _ in 0..threads {
        let (tx, rx) = bounded(queue_capacity);
        senders.push(tx);
        receivers.push(rx);
    }

    std::thread::scope(|scope| {
        let mut workers = Vec::with_capacity(threads);
        for rx in receivers {
            workers.push(scope.spawn(move || writer_loop::<T>(layout, role, rx)));
        }

        let mut submit = {
            let senders = senders;
            move |req: WriteRequest<T>| -> Result<()> {
                let slot = match req.target {
                    // The overflow file lives at the base directory; writer 0
                    // owns it.
                    WriteTarget::Unmatched => 0,
                    WriteTarget::Leaf(p) => (p as usize) % senders.len(),
                };
                senders[slot].send(req).map_err(|_| ShardError::PoolShutdown)
            }
        };

        let produced = produce(&mut submit);
        // Disconnects the channels so the writers drain and exit.
        drop(submit);

        let mut worker_err = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => worker_err = worker_err.or(Some(e)),
                Err(_) => worker_err = worker_err.or(Some(ShardError::PoolShutdown)),
            }
        }
        // A dead writer disconnects the channel and the producer only sees
        // `PoolShutdown`; the writer's own error is the root cause.
        match (produced, worker_err) {
            (Err(ShardError::PoolShutdown), Some(e)) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(()), Some(e)) => Err(e),
            (Ok(()), None) => Ok(()),
        }
    })
}

fn writer_loop<T: Record>(
    layout: &ShardLayout,
    role: FileRole,
    rx: Receiver<WriteRequest<T>>,
) -> Result<()> {
    let mut sinks: FxHashMap<NodePath, BinaryWriter<T>> = FxHashMap::default();
    let mut unmatched: Option<BinaryWriter<T>> = None;

    for req in rx.iter() {
        let sink = match req.target {
            WriteTarget::Leaf(leaf) => match sinks.entry(leaf) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    layout.ensure_leaf_dir(leaf)?;
                    e.insert(BinaryWriter::append(layout.leaf_file(leaf, role))?)
                }
            },
            WriteTarget::Unmatched => match unmatched {
                Some(ref mut sink) => sink,
                None => {
                    unmatched = Some(BinaryWriter::append(layout.overflow_file(role))?);
                    unmatched.as_mut().unwrap()
                }
            },
        };
        sink.write(&req.record)?;
    }

    for sink in sinks.values_mut() {
        sink.complete()?;
    }
    if let Some(sink) = &mut unmatched {
        sink.complete()?;
    }
    Ok(())
}

/// Coordinate lookup for referenced point identifiers.
///
/// Two strategies trade memory for I/O: the in-memory locator materializes
/// the whole point set once; the sorted-stream locator re-scans the
/// id-ordered point stream once per request batch.
pub trait PointLocator {
    /// Resolve a sorted, deduplicated identifier batch to coordinates.
    /// Absent identifiers are simply missing from the result map.
    fn resolve(&mut self, ids: &[EntityId]) -> Result<FxHashMap<EntityId, (f64, f64)>>;
}

/// Random-access strategy: the full point set keyed by identifier.
pub struct InMemoryLocator {
    coords: FxHashMap<EntityId, (f64, f64)>,
}

impl InMemoryLocator {
    pub fn load<I>(points: I) -> Result<Self>
    where
        I: Iterator<Item = Result<Point>>,
    {
        let mut coords = FxHashMap::default();
        for point in points {
            let point = point?;
            coords.insert(point.id, (point.lon, point.lat));
        }
        debug!("in-memory locator holds {} coordinates", coords.len());
        Ok(Self { coords })
    }
}

impl PointLocator for InMemoryLocator {
    fn resolve(&mut self, ids: &[EntityId]) -> Result<FxHashMap<EntityId, (f64, f64)>> {
        let mut out = FxHashMap::default();
        for &id in ids {
            if let Some(&coord) = self.coords.get(&id) {
                out.insert(id, coord);
            }
        }
        Ok(out)
    }
}

/// Streaming strategy: linear merge of the sorted request batch against a
/// fresh scan of the id-ordered global point stream.
pub struct SortedStreamLocator<F> {
    open: F,
}

impl<F, I> SortedStreamLocator<F>
where
    F: FnMut() -> Result<I>,
    I: Iterator<Item = Result<Point>>,
{
    /// `open` must yield a fresh id-ascending iterator over the global
    /// point set on each call.
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

impl<F, I> PointLocator for SortedStreamLocator<F>
where
    F: FnMut() -> Result<I>,
    I: Iterator<Item = Result<Point>>,
{
    fn resolve(&mut self, ids: &[EntityId]) -> Result<FxHashMap<EntityId, (f64, f64)>> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let mut out = FxHashMap::default();
        if ids.is_empty() {
            return Ok(out);
        }
        let mut cursor = 0usize;
        for point in (self.open)()? {
            let point = point?;
            while cursor < ids.len() && ids[cursor] < point.id {
                cursor += 1;
            }
            if cursor == ids.len() {
                break;
            }
            if ids[cursor] == point.id {
                out.insert(point.id, (point.lon, point.lat));
                cursor += 1;
                if cursor == ids.len() {
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// Counters from one mapping stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapOutcome {
    /// Records written, counted once per leaf copy.
    pub written: u64,
    /// Records with zero resolvable points, routed to the overflow file.
    pub unmatched: u64,
}

/// Assign each polyline to every leaf containing at least one of its
/// referenced points and append it to those leaves' line shards.
///
/// A polyline crossing shard boundaries lands in several leaves by design;
/// per-shard closure makes each copy self-contained later.
pub fn map_lines<I, L>(
    tree: &PartitionTree,
    layout: &ShardLayout,
    locator: &mut L,
    lines: I,
    batch_size: usize,
    writer_threads: usize,
    queue_capacity: usize,
) -> Result<MapOutcome>
where
    I: Iterator<Item = Result<Polyline>>,
    L: PointLocator,
{
    map_batched(
        tree,
        layout,
        FileRole::Lines,
        locator,
        lines,
        batch_size,
        writer_threads,
        queue_capacity,
        |line: &Polyline| -> Box<dyn Iterator<Item = EntityId> + '_> {
            Box::new(line.point_ids.iter().copied())
        },
    )
}

/// Assign relations without relation members to leaves by their point
/// members, analogously to polylines.
pub fn map_simple_relations<I, L>(
    tree: &PartitionTree,
    layout: &ShardLayout,
    locator: &mut L,
    relations: I,
    batch_size: usize,
    writer_threads: usize,
    queue_capacity: usize,
) -> Result<MapOutcome>
where
    I: Iterator<Item = Result<Relation>>,
    L: PointLocator,
{
    map_batched(
        tree,
        layout,
        FileRole::RelationsSimple,
        locator,
        relations,
        batch_size,
        writer_threads,
        queue_capacity,
        |rel: &Relation| -> Box<dyn Iterator<Item = EntityId> + '_> {
            Box::new(rel.member_ids(MemberKind::Point))
        },
    )
}

#[allow(clippy::too_many_arguments)]
fn map_batched<T, I, L, R>(
    tree: &PartitionTree,
    layout: &ShardLayout,
    role: FileRole,
    locator: &mut L,
    entities: I,
    batch_size: usize,
    writer_threads: usize,
    queue_capacity: usize,
    referenced_ids: R,
) -> Result<MapOutcome>
where
    T: Record + Clone + Send,
    I: Iterator<Item = Result<T>>,
    L: PointLocator,
    R: for<'a> Fn(&'a T) -> Box<dyn Iterator<Item = EntityId> + 'a>,
{
    let mut outcome = MapOutcome::default();
    let outcome_ref = &mut outcome;

    with_shard_writers(
        layout,
        role,
        writer_threads,
        queue_capacity,
        move |submit| {
            let mut entities = entities;
            loop {
                let mut batch: Vec<T> = Vec::with_capacity(batch_size);
                for entity in entities.by_ref() {
                    batch.push(entity?);
                    if batch.len() == batch_size {
                        break;
                    }
                }
                if batch.is_empty() {
                    return Ok(());
                }

                let mut wanted: Vec<EntityId> = batch.iter().flat_map(&referenced_ids).collect();
                wanted.sort_unstable();
                wanted.dedup();
                let coords = locator.resolve(&wanted)?;

                for entity in batch {
                    let mut leaves: SmallVec<[NodePath; 4]> = SmallVec::new();
                    for id in referenced_ids(&entity) {
                        let Some(&(lon, lat)) = coords.get(&id) else {
                            continue;
                        };
                        if let Some(leaf) = tree.query_point(lon, lat)
                            && !leaves.contains(&leaf.path())
                        {
                            leaves.push(leaf.path());
                        }
                    }

                    if leaves.is_empty() {
                        outcome_ref.unmatched += 1;
                        submit(WriteRequest {
                            target: WriteTarget::Unmatched,
                            record: entity,
                        })?;
                        continue;
                    }

                    for &leaf in &leaves {
                        outcome_ref.written += 1;
                        submit(WriteRequest {
                            target: WriteTarget::Leaf(leaf),
                            record: entity.clone(),
                        })?;
                    }
                }
            }
        },
    )?;

    if outcome.unmatched > 0 {
        warn!(
            "{} entities had no resolvable points and went to the overflow file",
            outcome.unmatched
        );
    }
    Ok(outcome)
}

/// Distribute points to their owning leaf shards. Input order is preserved
/// per leaf, so id-ascending input yields id-ascending leaf shards.
pub fn distribute_points<I>(
    tree: &PartitionTree,
    layout: &ShardLayout,
    points: I,
    writer_threads: usize,
    queue_capacity: usize,
) -> Result<u64>
where
    I: Iterator<Item = Result<Point>>,
{
    let mut written = 0u64;
    let written_ref = &mut written;
    let mut outside = 0u64;
    let outside_ref = &mut outside;

    with_shard_writers(
        layout,
        FileRole::Points,
        writer_threads,
        queue_capacity,
        move |submit| {
            for point in points {
                let point = point?;
                match tree.query_point(point.lon, point.lat) {
                    Some(leaf) => {
                        *written_ref += 1;
                        submit(WriteRequest {
                            target: WriteTarget::Leaf(leaf.path()),
                            record: point,
                        })?;
                    }
                    None => *outside_ref += 1,
                }
            }
            Ok(())
        },
    )?;

    if outside > 0 {
        warn!("{outside} points outside the tree bounding box were dropped");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryReader;
    use crate::tree::Envelope;
    use tempfile::TempDir;

    fn two_leaf_tree() -> PartitionTree {
        let mut tree = PartitionTree::new(Envelope::planet());
        tree.split(1).unwrap();
        tree
    }

    fn ok_iter<T: Clone>(items: &[T]) -> impl Iterator<Item = Result<T>> {
        items.to_vec().into_iter().map(Ok)
    }

    #[test]
    fn test_distribute_points_by_leaf() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let tree = two_leaf_tree();

        let points = vec![
            Point::new(1, -10.0, 0.0),
            Point::new(2, 10.0, 0.0),
            Point::new(3, -20.0, 5.0),
        ];
        let written = distribute_points(&tree, &layout, ok_iter(&points), 1, 16).unwrap();
        assert_eq!(written, 3);

        let west = BinaryReader::<Point>::open(layout.leaf_file(2, FileRole::Points))
            .unwrap()
            .read_all()
            .unwrap();
        let ids: Vec<_> = west.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);

        let east = BinaryReader::<Point>::open(layout.leaf_file(3, FileRole::Points))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(east.len(), 1);
        assert_eq!(east[0].id, 2);
    }

    #[test]
    fn test_line_lands_in_every_touched_leaf() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let tree = two_leaf_tree();

        let points = vec![Point::new(1, -10.0, 0.0), Point::new(2, 10.0, 0.0)];
        let mut locator = InMemoryLocator::load(ok_iter(&points)).unwrap();

        let lines = vec![
            Polyline::new(100, vec![1, 2]),
            Polyline::new(101, vec![1]),
        ];
        let outcome =
            map_lines(&tree, &layout, &mut locator, ok_iter(&lines), 64, 1, 16).unwrap();
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.unmatched, 0);

        let west = BinaryReader::<Polyline>::open(layout.leaf_file(2, FileRole::Lines))
            .unwrap()
            .read_all()
            .unwrap();
        let ids: Vec<_> = west.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![100, 101]);

        let east = BinaryReader::<Polyline>::open(layout.leaf_file(3, FileRole::Lines))
            .unwrap()
            .read_all()
            .unwrap();
        let ids: Vec<_> = east.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![100]);
    }

    #[test]
    fn test_unresolvable_line_goes_to_overflow() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let tree = two_leaf_tree();

        let mut locator = InMemoryLocator::load(ok_iter::<Point>(&[])).unwrap();
        let lines = vec![Polyline::new(100, vec![42, 43])];
        let outcome =
            map_lines(&tree, &layout, &mut locator, ok_iter(&lines), 64, 1, 16).unwrap();
        assert_eq!(outcome.written, 0);
        assert_eq!(outcome.unmatched, 1);

        let overflow = BinaryReader::<Polyline>::open(layout.unmatched_file())
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].id, 100);
    }

    #[test]
    fn test_sorted_stream_locator_matches_in_memory() {
        let points = vec![
            Point::new(1, -10.0, 0.0),
            Point::new(5, 10.0, 0.0),
            Point::new(9, 20.0, 20.0),
        ];
        let mut streaming = SortedStreamLocator::new(|| Ok(ok_iter(&points)));
        let mut memory = InMemoryLocator::load(ok_iter(&points)).unwrap();

        let wanted = [1u64, 2, 5, 9, 100];
        let a = streaming.resolve(&wanted).unwrap();
        let b = memory.resolve(&wanted).unwrap();
        assert_eq!(a.len(), 3);
        for (id, coord) in &a {
            assert_eq!(b.get(id), Some(coord));
        }
    }

    #[test]
    fn test_writer_failure_surfaces_root_cause() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let tree = two_leaf_tree();

        // Occupying the shard file path with a directory makes the writer's
        // open fail with a real I/O error. The producer keeps submitting
        // until it sees the disconnect, so the writer's error has to win
        // over the producer's `PoolShutdown`.
        std::fs::create_dir_all(layout.leaf_dir(2).join("points")).unwrap();

        let points: Vec<Point> = (1..=200).map(|i| Point::new(i, -10.0, 0.0)).collect();
        let err = distribute_points(&tree, &layout, ok_iter(&points), 1, 2).unwrap_err();
        assert!(matches!(err, ShardError::Io(_)));
    }

    #[test]
    fn test_multiple_writer_threads_keep_leaf_order() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let tree = two_leaf_tree();

        let points: Vec<Point> = (1..=100)
            .map(|i| Point::new(i, if i % 2 == 0 { 10.0 } else { -10.0 }, 0.0))
            .collect();
        let written = distribute_points(&tree, &layout, ok_iter(&points), 2, 8).unwrap();
        assert_eq!(written, 100);

        let west = BinaryReader::<Point>::open(layout.leaf_file(2, FileRole::Points))
            .unwrap()
            .read_all()
            .unwrap();
        let ids: Vec<_> = west.iter().map(|p| p.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 50);
    }
}
