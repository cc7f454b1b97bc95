//! Connectivity grouping and batch packing for nested relations.
//!
//! Relations that reference other relations must end up in the same shard,
//! or their closure could never be repaired locally. One streaming pass
//! builds the membership graph; breadth-first traversal yields connectivity
//! groups, which are packed whole into size-bounded batches. Each batch
//! becomes one temporary shard that then runs through the ordinary closure
//! repair with a relation-aware scan plan.

use crate::codec::{BinaryWriter, RecordSink, sort_file_by_id};
use crate::closure::ShardHandle;
use crate::error::Result;
use crate::layout::{FileRole, FileTable};
use crate::model::{EntityId, MemberKind, Relation};
use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::Path;

/// Directory under the shard base holding relation batch shards. Not a hex
/// path, so reconstruction skips it with a warning.
pub const BATCH_DIR: &str = "batches";

/// A maximal set of relations mutually reachable via membership references.
#[derive(Debug, Clone)]
pub struct ConnectivityGroup {
    /// Smallest member identifier, used for stable ordering and logging.
    pub representative: EntityId,
    /// Relations in the group that actually exist in the dataset.
    pub members: Vec<EntityId>,
    /// Total member count across the group's relations.
    pub total_members: u64,
}

/// Accumulator of whole groups bounded by a maximum total member count.
#[derive(Debug, Clone, Default)]
pub struct GroupBatch {
    pub groups: Vec<ConnectivityGroup>,
    pub total_members: u64,
}

impl GroupBatch {
    fn fits(&self, group: &ConnectivityGroup, max_members: u64) -> bool {
        self.total_members + group.total_members <= max_members
    }

    fn push(&mut self, group: ConnectivityGroup) {
        self.total_members += group.total_members;
        self.groups.push(group);
    }

    pub fn relation_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.groups.iter().flat_map(|g| g.members.iter().copied())
    }
}

/// Coalesce complex relations into connectivity groups in one streaming
/// pass plus a breadth-first traversal of the membership graph.
///
/// Referenced relation identifiers absent from the stream still act as
/// graph nodes (two relations sharing a missing child belong together) but
/// are not listed as group members.
pub fn group_relations<I>(relations: I) -> Result<Vec<ConnectivityGroup>>
where
    I: Iterator<Item = Result<Relation>>,
{
    let mut member_counts: FxHashMap<EntityId, u64> = FxHashMap::default();
    let mut adjacency: FxHashMap<EntityId, Vec<EntityId>> = FxHashMap::default();

    for relation in relations {
        let relation = relation?;
        member_counts.insert(relation.id, relation.members.len() as u64);
        adjacency.entry(relation.id).or_default();
        for child in relation.member_ids(MemberKind::Relation) {
            adjacency.entry(relation.id).or_default().push(child);
            adjacency.entry(child).or_default().push(relation.id);
        }
    }

    let mut visited: FxHashSet<EntityId> = FxHashSet::default();
    let mut groups = Vec::new();
    let mut starts: Vec<EntityId> = member_counts.keys().copied().collect();
    starts.sort_unstable();

    for start in starts {
        if visited.contains(&start) {
            continue;
        }
        let mut members = Vec::new();
        let mut total = 0u64;
        let mut queue = VecDeque::from([start]);
        visited.insert(start);
        while let Some(id) = queue.pop_front() {
            if let Some(&count) = member_counts.get(&id) {
                members.push(id);
                total += count;
            }
            if let Some(neighbors) = adjacency.get(&id) {
                for &next in neighbors {
                    if visited.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        members.sort_unstable();
        let representative = members[0];
        groups.push(ConnectivityGroup {
            representative,
            members,
            total_members: total,
        });
    }

    debug!("{} connectivity groups from the membership graph", groups.len());
    Ok(groups)
}

/// Greedy first-fit packing of whole groups into size-bounded batches.
///
/// Groups are taken largest first; the current batch absorbs the first
/// remaining group that still fits, and flushes when none does. A group
/// larger than the bound gets a batch of its own rather than being split.
pub fn pack_batches(mut groups: Vec<ConnectivityGroup>, max_members: u64) -> Vec<GroupBatch> {
    groups.sort_by(|a, b| {
        b.total_members
            .cmp(&a.total_members)
            .then(a.representative.cmp(&b.representative))
    });

    let mut remaining: Vec<Option<ConnectivityGroup>> = groups.into_iter().map(Some).collect();
    let mut batches = Vec::new();
    let mut packed = 0usize;

    while packed < remaining.len() {
        let mut batch = GroupBatch::default();
        loop {
            let mut advanced = false;
            for slot in remaining.iter_mut() {
                let Some(group) = slot else { continue };
                if batch.groups.is_empty() && group.total_members > max_members {
                    warn!(
                        "connectivity group {} ({} members) exceeds the batch bound {}",
                        group.representative, group.total_members, max_members
                    );
                    batch.push(slot.take().unwrap());
                    packed += 1;
                    advanced = true;
                    break;
                }
                if batch.fits(group, max_members) {
                    batch.push(slot.take().unwrap());
                    packed += 1;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }
        if batch.groups.is_empty() {
            break;
        }
        batches.push(batch);
    }

    info!("packed {} groups into {} batches", packed, batches.len());
    batches
}

/// Write each batch's relations into its own temporary shard directory and
/// sort every shard by identifier. Returns handles ready for closure repair.
pub fn distribute_batches<I>(
    base: &Path,
    files: &FileTable,
    batches: &[GroupBatch],
    relations: I,
) -> Result<Vec<ShardHandle>>
where
    I: Iterator<Item = Result<Relation>>,
{
    let mut batch_of: FxHashMap<EntityId, usize> = FxHashMap::default();
    for (index, batch) in batches.iter().enumerate() {
        for id in batch.relation_ids() {
            batch_of.insert(id, index);
        }
    }

    let mut handles = Vec::with_capacity(batches.len());
    let mut writers: Vec<Option<BinaryWriter<Relation>>> = Vec::with_capacity(batches.len());
    for index in 0..batches.len() {
        let dir = base.join(BATCH_DIR).join(index.to_string());
        std::fs::create_dir_all(&dir)?;
        handles.push(ShardHandle::new(format!("batch-{index}"), dir));
        writers.push(None);
    }

    for relation in relations {
        let relation = relation?;
        let Some(&index) = batch_of.get(&relation.id) else {
            warn!("relation {} not assigned to any batch", relation.id);
            continue;
        };
        let writer = match writers[index] {
            Some(ref mut w) => w,
            None => {
                let path = handles[index].dir.join(files.file_name(FileRole::RelationsComplex));
                writers[index] = Some(BinaryWriter::create(path)?);
                writers[index].as_mut().unwrap()
            }
        };
        writer.write(&relation)?;
    }
    for writer in writers.iter_mut().flatten() {
        writer.complete()?;
    }

    // Batch shards must be independently id-sorted before repair.
    for handle in &handles {
        let path = handle.dir.join(files.file_name(FileRole::RelationsComplex));
        if path.exists() {
            sort_file_by_id::<Relation>(&path)?;
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryReader;
    use crate::model::Member;
    use tempfile::TempDir;

    fn ok_iter<T: Clone>(items: &[T]) -> impl Iterator<Item = Result<T>> {
        items.to_vec().into_iter().map(Ok)
    }

    #[test]
    fn test_grouping_is_transitive() {
        // 1 -> 2 -> 3 plus isolated 10.
        let relations = vec![
            Relation::new(1, vec![Member::relation(2), Member::point(100)]),
            Relation::new(2, vec![Member::relation(3)]),
            Relation::new(3, vec![Member::point(101)]),
            Relation::new(10, vec![Member::point(102), Member::line(7)]),
        ];
        let mut groups = group_relations(ok_iter(&relations)).unwrap();
        groups.sort_by_key(|g| g.representative);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![1, 2, 3]);
        assert_eq!(groups[0].total_members, 4);
        assert_eq!(groups[1].members, vec![10]);
        assert_eq!(groups[1].total_members, 2);
    }

    #[test]
    fn test_shared_missing_child_connects_parents() {
        // Both reference relation 99, which is absent from the dataset.
        let relations = vec![
            Relation::new(1, vec![Member::relation(99)]),
            Relation::new(2, vec![Member::relation(99)]),
        ];
        let groups = group_relations(ok_iter(&relations)).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec![1, 2]);
    }

    #[test]
    fn test_pack_batches_first_fit() {
        let group = |rep: EntityId, size: u64| ConnectivityGroup {
            representative: rep,
            members: vec![rep],
            total_members: size,
        };
        // Sizes desc: 6, 4, 3, 2 with bound 7. The 6 fills the first
        // batch alone, 4 and 3 share the second, 2 ends up on its own.
        let batches = pack_batches(
            vec![group(1, 4), group(2, 6), group(3, 3), group(4, 2)],
            7,
        );
        let sizes: Vec<u64> = batches.iter().map(|b| b.total_members).collect();
        assert_eq!(sizes, vec![6, 7, 2]);
        assert!(batches.iter().all(|b| b.total_members <= 7));
    }

    #[test]
    fn test_oversized_group_gets_own_batch() {
        let big = ConnectivityGroup {
            representative: 1,
            members: vec![1, 2, 3],
            total_members: 100,
        };
        let small = ConnectivityGroup {
            representative: 9,
            members: vec![9],
            total_members: 2,
        };
        let batches = pack_batches(vec![big, small], 10);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].total_members, 100);
        assert_eq!(batches[0].groups.len(), 1);
        assert_eq!(batches[1].total_members, 2);
    }

    #[test]
    fn test_groups_are_never_split() {
        let group = |rep: EntityId, members: Vec<EntityId>, size: u64| ConnectivityGroup {
            representative: rep,
            members,
            total_members: size,
        };
        let batches = pack_batches(
            vec![group(1, vec![1, 2], 5), group(3, vec![3, 4], 5)],
            6,
        );
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.groups.len(), 1);
            assert_eq!(batch.groups[0].members.len(), 2);
        }
    }

    #[test]
    fn test_distribute_batches_writes_sorted_shards() {
        let dir = TempDir::new().unwrap();
        let files = FileTable::default();

        let relations = vec![
            Relation::new(1, vec![Member::relation(2)]),
            Relation::new(2, vec![Member::point(100)]),
            Relation::new(10, vec![Member::point(101)]),
        ];
        let groups = group_relations(ok_iter(&relations)).unwrap();
        let batches = pack_batches(groups, 2);
        assert_eq!(batches.len(), 2);

        let handles =
            distribute_batches(dir.path(), &files, &batches, ok_iter(&relations)).unwrap();
        assert_eq!(handles.len(), 2);

        let mut seen: Vec<Vec<EntityId>> = Vec::new();
        for handle in &handles {
            let path = handle.dir.join(files.file_name(FileRole::RelationsComplex));
            let ids: Vec<EntityId> = BinaryReader::<Relation>::open(&path)
                .unwrap()
                .read_all()
                .unwrap()
                .iter()
                .map(|r| r.id)
                .collect();
            let mut sorted = ids.clone();
            sorted.sort();
            assert_eq!(ids, sorted);
            seen.push(ids);
        }
        seen.sort();
        assert_eq!(seen, vec![vec![1, 2], vec![10]]);
    }
}
