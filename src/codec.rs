//! Entity stream codec boundary and the binary shard codec.
//!
//! The core depends only on the abstract [`RecordSource`] / [`RecordSink`]
//! pair; the binary codec here is the concrete implementation used for shard
//! files. Records are hand-encoded big-endian with length-prefixed variable
//! fields, written through a reusable scratch buffer and read back with
//! `read_exact`-style framing. End of stream is only clean at a record
//! boundary; truncation inside a record is an error.

use crate::error::{Result, ShardError};
use crate::model::{EntityId, Member, MemberKind, Point, Polyline, Relation, Tags};
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::Path;

const SCRATCH_INITIAL_CAPACITY: usize = 8 * 1024;
const SCRATCH_SHRINK_THRESHOLD: usize = 1 << 20;

/// Abstract ordered input stream of typed records.
pub trait RecordSource<T> {
    /// Next record, or `None` at a clean end of stream.
    fn next_record(&mut self) -> Result<Option<T>>;
}

/// Abstract output sink for typed records.
pub trait RecordSink<T> {
    fn write(&mut self, record: &T) -> Result<()>;

    /// Finalize the sink. Must be called on every exit path before the
    /// enclosing stage is considered finished.
    fn complete(&mut self) -> Result<()>;
}

/// Entities with a 64-bit identifier.
pub trait HasId {
    fn id(&self) -> EntityId;
}

impl HasId for Point {
    fn id(&self) -> EntityId {
        self.id
    }
}

impl HasId for Polyline {
    fn id(&self) -> EntityId {
        self.id
    }
}

impl HasId for Relation {
    fn id(&self) -> EntityId {
        self.id
    }
}

/// Wire-format encoding for one record kind.
pub trait Record: Sized {
    fn encode(&self, buf: &mut BytesMut);

    /// Decode one record, or `None` at a clean stream end.
    fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>>;
}

/// Fill `buf` completely. `Ok(false)` when the stream ended before the first
/// byte; truncation mid-buffer is `UnexpectedEof`.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ShardError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(true)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    if !fill(reader, &mut buf)? {
        return Err(ShardError::UnexpectedEof);
    }
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    if !fill(reader, &mut buf)? {
        return Err(ShardError::UnexpectedEof);
    }
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    if !fill(reader, &mut buf)? {
        return Err(ShardError::UnexpectedEof);
    }
    Ok(u64::from_be_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    Ok(f64::from_bits(read_u64(reader)?))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put(s.as_bytes());
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)? as usize;
    let mut bytes = vec![0u8; len];
    if len > 0 && !fill(reader, &mut bytes)? {
        return Err(ShardError::UnexpectedEof);
    }
    String::from_utf8(bytes).map_err(|_| ShardError::InvalidFormat)
}

fn put_tags(buf: &mut BytesMut, tags: &Tags) {
    buf.put_u32(tags.len() as u32);
    for (key, value) in tags {
        put_string(buf, key);
        put_string(buf, value);
    }
}

fn read_tags<R: Read>(reader: &mut R) -> Result<Tags> {
    let count = read_u32(reader)? as usize;
    let mut tags = Tags::with_capacity(count);
    for _ in 0..count {
        let key = read_string(reader)?;
        let value = read_string(reader)?;
        tags.push((key, value));
    }
    Ok(tags)
}

impl Record for Point {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_f64(self.lon);
        buf.put_f64(self.lat);
        put_tags(buf, &self.tags);
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut id_buf = [0u8; 8];
        if !fill(reader, &mut id_buf)? {
            return Ok(None);
        }
        let id = u64::from_be_bytes(id_buf);
        let lon = read_f64(reader)?;
        let lat = read_f64(reader)?;
        let tags = read_tags(reader)?;
        Ok(Some(Point {
            id,
            lon,
            lat,
            tags,
        }))
    }
}

impl Record for Polyline {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u32(self.point_ids.len() as u32);
        for &p in &self.point_ids {
            buf.put_u64(p);
        }
        put_tags(buf, &self.tags);
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut id_buf = [0u8; 8];
        if !fill(reader, &mut id_buf)? {
            return Ok(None);
        }
        let id = u64::from_be_bytes(id_buf);
        let count = read_u32(reader)? as usize;
        let mut point_ids = Vec::with_capacity(count);
        for _ in 0..count {
            point_ids.push(read_u64(reader)?);
        }
        let tags = read_tags(reader)?;
        Ok(Some(Polyline {
            id,
            point_ids,
            tags,
        }))
    }
}

impl MemberKind {
    fn to_wire(self) -> u8 {
        match self {
            MemberKind::Point => 0,
            MemberKind::Line => 1,
            MemberKind::Relation => 2,
        }
    }

    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(MemberKind::Point),
            1 => Ok(MemberKind::Line),
            2 => Ok(MemberKind::Relation),
            _ => Err(ShardError::InvalidFormat),
        }
    }
}

impl Record for Relation {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.id);
        buf.put_u32(self.members.len() as u32);
        for member in &self.members {
            buf.put_u8(member.kind.to_wire());
            buf.put_u64(member.id);
            put_string(buf, &member.role);
        }
        put_tags(buf, &self.tags);
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut id_buf = [0u8; 8];
        if !fill(reader, &mut id_buf)? {
            return Ok(None);
        }
        let id = u64::from_be_bytes(id_buf);
        let count = read_u32(reader)? as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = MemberKind::from_wire(read_u8(reader)?)?;
            let member_id = read_u64(reader)?;
            let role = read_string(reader)?;
            members.push(Member {
                kind,
                id: member_id,
                role,
            });
        }
        let tags = read_tags(reader)?;
        Ok(Some(Relation { id, members, tags }))
    }
}

/// Buffered binary writer for one record kind.
pub struct BinaryWriter<T> {
    writer: BufWriter<File>,
    scratch: BytesMut,
    records: u64,
    _marker: PhantomData<T>,
}

impl<T: Record> BinaryWriter<T> {
    /// Create or truncate the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_file(file))
    }

    /// Open the file at `path` for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            scratch: BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY),
            records: 0,
            _marker: PhantomData,
        }
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }
}

impl<T: Record> RecordSink<T> for BinaryWriter<T> {
    fn write(&mut self, record: &T) -> Result<()> {
        self.scratch.clear();
        record.encode(&mut self.scratch);
        self.writer.write_all(&self.scratch)?;
        self.records += 1;

        if self.scratch.capacity() > SCRATCH_SHRINK_THRESHOLD {
            self.scratch = BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY);
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl<T> Drop for BinaryWriter<T> {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors.
        let _ = self.writer.flush();
    }
}

/// Buffered binary reader for one record kind.
pub struct BinaryReader<T> {
    reader: BufReader<File>,
    _marker: PhantomData<T>,
}

impl<T: Record> BinaryReader<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            _marker: PhantomData,
        })
    }

    /// Drain the remaining records into a vector.
    pub fn read_all(mut self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl<T: Record> RecordSource<T> for BinaryReader<T> {
    fn next_record(&mut self) -> Result<Option<T>> {
        T::decode(&mut self.reader)
    }
}

impl<T: Record> Iterator for BinaryReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Read all records, sort them by identifier, and rewrite the file in place.
/// Used on relation batch shards, which are small by construction.
pub fn sort_file_by_id<T: Record + HasId>(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut records = BinaryReader::<T>::open(path)?.read_all()?;
    records.sort_by_key(|r| r.id());
    let mut writer = BinaryWriter::create(path)?;
    for record in &records {
        writer.write(record)?;
    }
    writer.complete()
}

/// Writer for sorted missing-identifier lists: fixed-width big-endian u64s.
pub struct IdListWriter {
    writer: BufWriter<File>,
}

impl IdListWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn write_id(&mut self, id: EntityId) -> Result<()> {
        self.writer.write_all(&id.to_be_bytes())?;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reader for missing-identifier lists.
pub struct IdListReader {
    reader: BufReader<File>,
}

impl IdListReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    pub fn next_id(&mut self) -> Result<Option<EntityId>> {
        let mut buf = [0u8; 8];
        if !fill(&mut self.reader, &mut buf)? {
            return Ok(None);
        }
        Ok(Some(u64::from_be_bytes(buf)))
    }

    pub fn read_all(mut self) -> Result<Vec<EntityId>> {
        let mut ids = Vec::new();
        while let Some(id) = self.next_id()? {
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Write a sorted, deduplicated identifier list to `path`.
pub fn write_id_list(path: impl AsRef<Path>, ids: &[EntityId]) -> Result<()> {
    debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let mut writer = IdListWriter::create(path)?;
    for &id in ids {
        writer.write_id(id)?;
    }
    writer.complete()
}
