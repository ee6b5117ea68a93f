//! Block file store: named byte streams over fixed-size blocks
//!
//! Files live in two keyspaces of one container:
//!
//! ```text
//! records: u16 BE name length | UTF-8 name
//!          -> flags (u32 BE) | length (u32 BE) | modified millis (u64 BE) | file id (16)
//! blocks : file id (16) | reserved (i32 BE, 0) | block index (i32 BE) -> block bytes
//! ```
//!
//! Offsets map to blocks as `(offset >> shift, offset & mask)`. A file's
//! length and modification time change only when a write stream is closed.

use crate::keyspace::Keyspace;
use crate::stream::{InputStream, OutputStream};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cairn_core::{Container, Error, FileId, Result, WriteBatch};
use chrono::{DateTime, TimeZone, Utc};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Default block shift: 16 KiB blocks
pub const DEFAULT_BLOCK_SHIFT: u8 = 14;

/// Block shift used for full-text index files: 32 KiB blocks
pub const INDEX_BLOCK_SHIFT: u8 = 15;

const MIN_BLOCK_SHIFT: u8 = 9;
const MAX_BLOCK_SHIFT: u8 = 24;
const RECORD_LEN: usize = 32;

/// Master record of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    /// Reserved flag bits
    pub flags: u32,
    /// Length in bytes as of the last close
    pub length: u32,
    /// Modification time in milliseconds since the epoch
    pub modified_ms: u64,
    /// Identity of the block set holding the contents
    pub id: FileId,
}

impl FileRecord {
    fn fresh() -> Self {
        Self {
            flags: 0,
            length: 0,
            modified_ms: now_ms(),
            id: FileId::new(),
        }
    }

    /// Modification time
    pub fn modified(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.modified_ms as i64)
            .single()
            .unwrap_or_default()
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(RECORD_LEN);
        out.write_u32::<BigEndian>(self.flags)?;
        out.write_u32::<BigEndian>(self.length)?;
        out.write_u64::<BigEndian>(self.modified_ms)?;
        out.extend_from_slice(self.id.as_bytes());
        Ok(out)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(Error::corruption(format!(
                "file record has {} bytes, expected {}",
                bytes.len(),
                RECORD_LEN
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let flags = cursor.read_u32::<BigEndian>()?;
        let length = cursor.read_u32::<BigEndian>()?;
        let modified_ms = cursor.read_u64::<BigEndian>()?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[16..RECORD_LEN]);
        Ok(Self {
            flags,
            length,
            modified_ms,
            id: FileId::from_bytes(id),
        })
    }
}

pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn name_key(name: &str) -> Result<Vec<u8>> {
    let len = u16::try_from(name.len())
        .map_err(|_| Error::invalid_state(format!("file name too long: {} bytes", name.len())))?;
    let mut key = Vec::with_capacity(2 + name.len());
    key.write_u16::<BigEndian>(len)?;
    key.extend_from_slice(name.as_bytes());
    Ok(key)
}

fn decode_name(key: &[u8]) -> Result<String> {
    if key.len() < 2 {
        return Err(Error::corruption("file name key too short"));
    }
    String::from_utf8(key[2..].to_vec())
        .map_err(|_| Error::corruption("file name is not valid UTF-8"))
}

pub(crate) fn block_key(id: FileId, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&0i32.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Named files stored as fixed-size blocks in a container
///
/// Cheap to clone; clones share the container.
#[derive(Debug, Clone)]
pub struct BlockFileStore {
    records: Keyspace,
    blocks: Keyspace,
    shift: u8,
}

impl BlockFileStore {
    /// File store `name` inside `container` with `2^shift`-byte blocks
    ///
    /// # Errors
    ///
    /// `Error::Config` if `shift` is outside 9..=24.
    pub fn new(container: Arc<dyn Container>, name: &str, shift: u8) -> Result<Self> {
        if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&shift) {
            return Err(Error::Config(format!(
                "block shift {} outside {}..={}",
                shift, MIN_BLOCK_SHIFT, MAX_BLOCK_SHIFT
            )));
        }
        Ok(Self {
            records: Keyspace::new(Arc::clone(&container), &format!("{}.files", name)),
            blocks: Keyspace::new(container, &format!("{}.blocks", name)),
            shift,
        })
    }

    /// Block shift
    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        1usize << self.shift
    }

    // ===== Streams =====

    /// Create (or truncate) `name` and return a stream positioned at 0
    pub fn create_file(&self, name: &str) -> Result<OutputStream> {
        let mut batch = WriteBatch::new();
        if let Some(old) = self.record(name)? {
            self.queue_block_deletes(&mut batch, old.id)?;
        }
        let record = FileRecord::fresh();
        self.records
            .put_in(&mut batch, &name_key(name)?, record.encode()?);
        self.records.container().apply_batch(&batch)?;
        debug!(file = name, id = %record.id, "Created file");
        Ok(OutputStream::new(self.clone(), name.to_string(), record, 0))
    }

    /// Open `name` for writing at its current end, creating it if missing
    pub fn append_file(&self, name: &str) -> Result<OutputStream> {
        match self.record(name)? {
            Some(record) => {
                let end = u64::from(record.length);
                Ok(OutputStream::new(self.clone(), name.to_string(), record, end))
            }
            None => self.create_file(name),
        }
    }

    /// Open `name` for reading
    pub fn open_file(&self, name: &str) -> Result<InputStream> {
        let record = self.require(name)?;
        Ok(InputStream::new(self.clone(), name.to_string(), record))
    }

    // ===== Metadata =====

    /// True if `name` exists
    pub fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.record(name)?.is_some())
    }

    /// Length of `name` as of its last close
    pub fn file_length(&self, name: &str) -> Result<u64> {
        Ok(u64::from(self.require(name)?.length))
    }

    /// Modification time of `name`
    pub fn file_modified(&self, name: &str) -> Result<DateTime<Utc>> {
        Ok(self.require(name)?.modified())
    }

    /// Set the modification time of `name` to now
    pub fn touch_file(&self, name: &str) -> Result<()> {
        let mut record = self.require(name)?;
        record.modified_ms = now_ms();
        self.put_record(name, &record)
    }

    /// Delete `name` and all of its blocks
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let record = self.require(name)?;
        let mut batch = WriteBatch::new();
        self.queue_block_deletes(&mut batch, record.id)?;
        self.records.delete_in(&mut batch, &name_key(name)?);
        self.records.container().apply_batch(&batch)?;
        debug!(file = name, "Deleted file");
        Ok(())
    }

    /// Rename `from` to `to`, replacing any existing `to`
    pub fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let record = self.require(from)?;
        if from == to {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        if let Some(existing) = self.record(to)? {
            self.queue_block_deletes(&mut batch, existing.id)?;
        }
        self.records.delete_in(&mut batch, &name_key(from)?);
        self.records
            .put_in(&mut batch, &name_key(to)?, record.encode()?);
        self.records.container().apply_batch(&batch)?;
        debug!(from, to, "Renamed file");
        Ok(())
    }

    /// Names of all files, ordered by encoded key
    pub fn list(&self) -> Result<Vec<String>> {
        self.records
            .scan(b"")?
            .into_iter()
            .map(|(k, _)| decode_name(&k))
            .collect()
    }

    // ===== Whole-file helpers =====

    /// Replace the contents of `name` with `bytes`
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut out = self.create_file(name)?;
        out.write_bytes(bytes)?;
        out.close()
    }

    /// Read the whole of `name`
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.open_file(name)?.read_to_vec()
    }

    // ===== Internals shared with the streams =====

    pub(crate) fn record(&self, name: &str) -> Result<Option<FileRecord>> {
        match self.records.get(&name_key(name)?)? {
            Some(bytes) => Ok(Some(FileRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require(&self, name: &str) -> Result<FileRecord> {
        self.record(name)?
            .ok_or_else(|| Error::FileNotFound(name.to_string()))
    }

    pub(crate) fn put_record(&self, name: &str, record: &FileRecord) -> Result<()> {
        self.records.put(&name_key(name)?, &record.encode()?)
    }

    pub(crate) fn read_block(&self, id: FileId, index: u32) -> Result<Option<Vec<u8>>> {
        self.blocks.get(&block_key(id, index))
    }

    pub(crate) fn write_block(&self, id: FileId, index: u32, data: &[u8]) -> Result<()> {
        self.blocks.put(&block_key(id, index), data)
    }

    fn queue_block_deletes(&self, batch: &mut WriteBatch, id: FileId) -> Result<()> {
        for (suffix, _) in self.blocks.scan(id.as_bytes())? {
            self.blocks.delete_in(batch, &suffix);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self, name: &str) -> Result<usize> {
        let record = self.require(name)?;
        Ok(self.blocks.scan(record.id.as_bytes())?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::KvContainer;

    fn store(shift: u8) -> BlockFileStore {
        BlockFileStore::new(Arc::new(KvContainer::in_memory()), "test", shift).unwrap()
    }

    #[test]
    fn test_record_roundtrip() {
        let record = FileRecord {
            flags: 7,
            length: 1234,
            modified_ms: 1_700_000_000_000,
            id: FileId::new(),
        };
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(FileRecord::decode(&bytes).unwrap(), record);
        assert!(FileRecord::decode(&bytes[..10]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_block_key_layout() {
        let id = FileId::new();
        let key = block_key(id, 3);
        assert_eq!(&key[..16], id.as_bytes());
        assert_eq!(&key[16..20], &[0, 0, 0, 0]);
        assert_eq!(&key[20..], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_invalid_shift_rejected() {
        let container: Arc<dyn Container> = Arc::new(KvContainer::in_memory());
        assert!(matches!(
            BlockFileStore::new(container, "x", 40),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_errors() {
        let s = store(DEFAULT_BLOCK_SHIFT);
        assert!(matches!(s.open_file("nope"), Err(Error::FileNotFound(_))));
        assert!(matches!(s.delete_file("nope"), Err(Error::FileNotFound(_))));
        assert!(matches!(s.file_length("nope"), Err(Error::FileNotFound(_))));
        assert!(matches!(s.touch_file("nope"), Err(Error::FileNotFound(_))));
        assert!(!s.file_exists("nope").unwrap());
    }

    #[test]
    fn test_create_truncates_previous_blocks() {
        let s = store(9);
        s.write_file("f", &vec![1u8; 2000]).unwrap();
        assert_eq!(s.block_count("f").unwrap(), 4);

        s.write_file("f", b"short").unwrap();
        assert_eq!(s.block_count("f").unwrap(), 1);
        assert_eq!(s.read_file("f").unwrap(), b"short");
    }

    #[test]
    fn test_rename_overwrites_target() {
        let s = store(DEFAULT_BLOCK_SHIFT);
        s.write_file("a", b"alpha").unwrap();
        s.write_file("b", b"beta").unwrap();
        s.rename_file("a", "b").unwrap();

        assert!(!s.file_exists("a").unwrap());
        assert_eq!(s.read_file("b").unwrap(), b"alpha");
        assert_eq!(s.list().unwrap(), vec!["b".to_string()]);
        assert!(matches!(s.rename_file("a", "c"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_delete_removes_blocks() {
        let container: Arc<dyn Container> = Arc::new(KvContainer::in_memory());
        let s = BlockFileStore::new(Arc::clone(&container), "t", 9).unwrap();
        s.write_file("f", &vec![9u8; 1500]).unwrap();
        s.delete_file("f").unwrap();
        assert!(!s.file_exists("f").unwrap());
        assert!(container.scan_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn test_touch_updates_modified() {
        let s = store(DEFAULT_BLOCK_SHIFT);
        s.write_file("f", b"x").unwrap();
        let mut record = s.record("f").unwrap().unwrap();
        record.modified_ms = 1000;
        s.put_record("f", &record).unwrap();

        s.touch_file("f").unwrap();
        assert!(s.file_modified("f").unwrap().timestamp_millis() > 1000);
        assert_eq!(s.file_length("f").unwrap(), 1);
    }

    #[test]
    fn test_list_orders_by_encoded_name() {
        let s = store(DEFAULT_BLOCK_SHIFT);
        for name in ["bb", "a", "ccc"] {
            s.write_file(name, b"").unwrap();
        }
        // Shorter names sort first because the length prefix leads the key
        assert_eq!(s.list().unwrap(), vec!["a", "bb", "ccc"]);
    }

    #[test]
    fn test_append_positions_at_end() {
        let s = store(9);
        s.write_file("log", b"hello ").unwrap();
        let mut out = s.append_file("log").unwrap();
        assert_eq!(out.position(), 6);
        out.write_bytes(b"world").unwrap();
        out.close().unwrap();
        assert_eq!(s.read_file("log").unwrap(), b"hello world");

        let mut fresh = s.append_file("new").unwrap();
        fresh.write_bytes(b"x").unwrap();
        fresh.close().unwrap();
        assert_eq!(s.file_length("new").unwrap(), 1);
    }
}
