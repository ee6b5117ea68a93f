//! KvContainer: ordered key-value container, in-memory or durable
//!
//! This module implements the `Container` trait using:
//! - `BTreeMap<Vec<u8>, Vec<u8>>` for ordered key storage
//! - `parking_lot::RwLock` with bounded acquisition; a lock that cannot be
//!   taken within the configured timeout surfaces as `Error::Deadlock`
//! - an optional append-only batch log for durability
//!
//! # Log format
//!
//! ```text
//! header : "CAIR" | format version (u32 BE)
//! record : payload length (u32 BE) | crc32 of payload (u32 BE) | payload
//! payload: op count (u32 BE) | ops...
//! op     : tag (u8: 1 = put, 2 = delete) | key len (u32 BE) | key
//!          | [value len (u32 BE) | value]   (puts only)
//! ```
//!
//! One record holds one whole batch, so a batch is either replayed entirely
//! or not at all. A torn final record (crash mid-append) is discarded on
//! open; a checksum failure anywhere else is corruption.
//!
//! A failed append is truncated back to the last acknowledged record before
//! the error is returned. If that truncation fails too, the log is poisoned
//! and every later batch is refused.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cairn_core::{BatchOp, Container, Error, Result, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LOG_MAGIC: [u8; 4] = *b"CAIR";
const LOG_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 8;
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Default time to wait for the container lock before reporting a deadlock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Records appended before the log is rewritten as a single snapshot record
const COMPACT_THRESHOLD: u64 = 4096;

struct BatchLog {
    path: PathBuf,
    file: File,
    records: u64,
    /// Bytes covered by acknowledged records
    len: u64,
    compact_threshold: u64,
    poisoned: bool,
    #[cfg(test)]
    short_write: Option<usize>,
}

impl BatchLog {
    fn new(path: PathBuf, file: File, records: u64, len: u64) -> Self {
        Self {
            path,
            file,
            records,
            len,
            compact_threshold: COMPACT_THRESHOLD,
            poisoned: false,
            #[cfg(test)]
            short_write: None,
        }
    }

    fn append(&mut self, batch: &WriteBatch) -> Result<()> {
        if self.poisoned {
            return Err(Error::invalid_state(format!(
                "container log {} is unusable after a failed rollback",
                self.path.display()
            )));
        }
        let payload = encode_batch(batch.iter())?;
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
        record.extend_from_slice(&payload);

        if let Err(e) = self.write_synced(&record) {
            self.rollback();
            return Err(e);
        }
        self.len += record.len() as u64;
        self.records += 1;
        Ok(())
    }

    fn write_synced(&mut self, record: &[u8]) -> Result<()> {
        // Nothing past the last acknowledged record may precede a new one
        if self.file.metadata()?.len() != self.len {
            self.file.set_len(self.len)?;
        }
        #[cfg(test)]
        if let Some(n) = self.short_write.take() {
            self.file.write_all(&record[..n.min(record.len())])?;
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "short write").into());
        }
        self.file.write_all(record)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.len)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = restored {
            error!(
                path = %self.path.display(),
                error = %e,
                "Failed to roll back container log; refusing further batches"
            );
            self.poisoned = true;
        }
    }
}

/// Ordered key-value container
///
/// Thread-safe; readers share the lock, batches take it exclusively. Batch
/// application is atomic both in memory and in the log.
pub struct KvContainer {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Option<Mutex<BatchLog>>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for KvContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvContainer")
            .field("path", &self.path())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl KvContainer {
    /// Create an empty, non-durable container
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            log: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Open (or create) a durable container backed by the log at `path`
    ///
    /// # Errors
    ///
    /// `Error::Corruption` if the header is invalid or a record other than
    /// the last fails its checksum; `Error::Io` for filesystem failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = BTreeMap::new();
        let mut records = 0;
        let mut len = HEADER_LEN as u64;

        if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let (valid_len, count) = replay(&bytes, &mut data)?;
            records = count;
            len = valid_len as u64;
            if valid_len < bytes.len() {
                warn!(
                    path = %path.display(),
                    discarded = bytes.len() - valid_len,
                    "Discarding torn tail of container log"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
        } else {
            let mut file = File::create(&path)?;
            file.write_all(&LOG_MAGIC)?;
            file.write_u32::<BigEndian>(LOG_FORMAT_VERSION)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        info!(path = %path.display(), keys = data.len(), records, "Opened container");
        Ok(Self {
            data: RwLock::new(data),
            log: Some(Mutex::new(BatchLog::new(path, file, records, len))),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Set how long to wait for the lock before reporting a deadlock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Rewrite the log once it holds more than `records` records
    pub fn with_compact_threshold(mut self, records: u64) -> Self {
        if let Some(log) = self.log.as_mut() {
            log.get_mut().compact_threshold = records;
        }
        self
    }

    /// Path of the backing log, if durable
    pub fn path(&self) -> Option<PathBuf> {
        self.log.as_ref().map(|log| log.lock().path.clone())
    }

    /// True if writes survive a reopen
    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if no keys are stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Rewrite the log as a single snapshot record (write-fsync-rename)
    pub fn compact(&self) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let data = self.data.read();
        let mut log = log.lock();
        compact_into(&mut log, &data)
    }

    fn deadlock(&self, context: &str) -> Error {
        Error::Deadlock {
            context: context.to_string(),
            attempts: 1,
        }
    }
}

impl Container for KvContainer {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.deadlock("get"))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self
            .data
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.deadlock("scan"))?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut data = self
            .data
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.deadlock("apply_batch"))?;

        // Log first: a batch that fails to reach the log is never applied
        if let Some(log) = &self.log {
            let mut log = log.lock();
            log.append(batch)?;
            apply_ops(&mut data, batch.iter());
            // The batch is durable; a failed rewrite is retried by a later batch
            if log.records > log.compact_threshold {
                if let Err(e) = compact_into(&mut log, &data) {
                    warn!(
                        path = %log.path.display(),
                        records = log.records,
                        error = %e,
                        "Container log compaction failed"
                    );
                }
            }
            return Ok(());
        }
        apply_ops(&mut data, batch.iter());
        Ok(())
    }
}

fn apply_ops<'a>(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: impl Iterator<Item = &'a BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            BatchOp::Delete { key } => {
                data.remove(key);
            }
        }
    }
}

fn compact_into(log: &mut BatchLog, data: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    let snapshot: Vec<BatchOp> = data
        .iter()
        .map(|(k, v)| BatchOp::Put {
            key: k.clone(),
            value: v.clone(),
        })
        .collect();
    let payload = encode_batch(snapshot.iter())?;

    let temp_path = log.path.with_extension("tmp");
    let written = write_snapshot(&temp_path, &payload)
        .and_then(|_| std::fs::rename(&temp_path, &log.path).map_err(Error::from));
    if let Err(e) = written {
        // The old log is untouched and stays the live one
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    // From here on the old file is unlinked; appending to it would lose data
    match OpenOptions::new().append(true).open(&log.path) {
        Ok(file) => log.file = file,
        Err(e) => {
            log.poisoned = true;
            return Err(e.into());
        }
    }
    if let Some(parent) = log.path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!(path = %log.path.display(), error = %e, "Failed to sync log directory");
        }
    }
    debug!(path = %log.path.display(), previous_records = log.records, "Compacted container log");
    log.len = (HEADER_LEN + RECORD_HEADER_LEN + payload.len()) as u64;
    log.records = 1;
    log.poisoned = false;
    Ok(())
}

fn write_snapshot(path: &Path, payload: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&LOG_MAGIC)?;
    file.write_u32::<BigEndian>(LOG_FORMAT_VERSION)?;
    file.write_u32::<BigEndian>(payload.len() as u32)?;
    file.write_u32::<BigEndian>(crc32fast::hash(payload))?;
    file.write_all(payload)?;
    file.sync_all()?;
    Ok(())
}

fn encode_batch<'a>(ops: impl Iterator<Item = &'a BatchOp>) -> Result<Vec<u8>> {
    let ops: Vec<&BatchOp> = ops.collect();
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(ops.len() as u32)?;
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                out.write_u8(OP_PUT)?;
                out.write_u32::<BigEndian>(key.len() as u32)?;
                out.extend_from_slice(key);
                out.write_u32::<BigEndian>(value.len() as u32)?;
                out.extend_from_slice(value);
            }
            BatchOp::Delete { key } => {
                out.write_u8(OP_DELETE)?;
                out.write_u32::<BigEndian>(key.len() as u32)?;
                out.extend_from_slice(key);
            }
        }
    }
    Ok(out)
}

fn decode_batch(payload: &[u8]) -> Result<Vec<BatchOp>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let key = read_chunk(&mut cursor)?;
        match tag {
            OP_PUT => {
                let value = read_chunk(&mut cursor)?;
                ops.push(BatchOp::Put { key, value });
            }
            OP_DELETE => ops.push(BatchOp::Delete { key }),
            other => return Err(Error::corruption(format!("unknown log op tag {}", other))),
        }
    }
    Ok(ops)
}

fn read_chunk(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Replay every intact record into `data`; returns (valid length, records)
fn replay(bytes: &[u8], data: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(usize, u64)> {
    if bytes.len() < HEADER_LEN || bytes[0..4] != LOG_MAGIC {
        return Err(Error::corruption("container log has an invalid header"));
    }
    let mut cursor = Cursor::new(&bytes[4..HEADER_LEN]);
    let version = cursor.read_u32::<BigEndian>()?;
    if version != LOG_FORMAT_VERSION {
        return Err(Error::corruption(format!(
            "unsupported container log version {}",
            version
        )));
    }

    let mut offset = HEADER_LEN;
    let mut records = 0;
    while offset < bytes.len() {
        if bytes.len() - offset < RECORD_HEADER_LEN {
            break;
        }
        let mut header = Cursor::new(&bytes[offset..offset + RECORD_HEADER_LEN]);
        let len = header.read_u32::<BigEndian>()? as usize;
        let crc = header.read_u32::<BigEndian>()?;
        let start = offset + RECORD_HEADER_LEN;
        if bytes.len() - start < len {
            break;
        }
        let payload = &bytes[start..start + len];
        if crc32fast::hash(payload) != crc {
            if start + len == bytes.len() {
                break;
            }
            return Err(Error::corruption(format!(
                "container log checksum mismatch at offset {}",
                offset
            )));
        }
        let ops = decode_batch(payload)
            .map_err(|e| Error::corruption(format!("undecodable log record: {}", e)))?;
        apply_ops(data, ops.iter());
        offset = start + len;
        records += 1;
    }
    Ok((offset, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn batch(puts: &[(&str, &str)]) -> WriteBatch {
        let mut b = WriteBatch::new();
        for (k, v) in puts {
            b.put(k.as_bytes().to_vec(), v.as_bytes().to_vec());
        }
        b
    }

    mod in_memory {
        use super::*;

        #[test]
        fn test_put_get_delete() {
            let c = KvContainer::in_memory();
            c.put(b"a", b"1").unwrap();
            assert_eq!(c.get(b"a").unwrap(), Some(b"1".to_vec()));
            c.delete(b"a").unwrap();
            assert_eq!(c.get(b"a").unwrap(), None);
            assert!(c.is_empty());
        }

        #[test]
        fn test_scan_prefix_is_ordered_and_bounded() {
            let c = KvContainer::in_memory();
            c.apply_batch(&batch(&[("ab2", "x"), ("ab1", "y"), ("ac", "z"), ("a", "w")]))
                .unwrap();
            let keys: Vec<Vec<u8>> = c
                .scan_prefix(b"ab")
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            assert_eq!(keys, vec![b"ab1".to_vec(), b"ab2".to_vec()]);
        }

        #[test]
        fn test_batch_applies_in_order() {
            let c = KvContainer::in_memory();
            let mut b = WriteBatch::new();
            b.put(b"k".to_vec(), b"1".to_vec());
            b.delete(b"k".to_vec());
            b.put(b"k".to_vec(), b"2".to_vec());
            c.apply_batch(&b).unwrap();
            assert_eq!(c.get(b"k").unwrap(), Some(b"2".to_vec()));
        }

        #[test]
        fn test_lock_timeout_reports_deadlock() {
            let c = KvContainer::in_memory().with_lock_timeout(Duration::from_millis(10));
            let _guard = c.data.write();
            let err = c.get(b"k").unwrap_err();
            assert!(err.is_transient());
        }

        #[test]
        fn test_concurrent_writers() {
            let c = Arc::new(KvContainer::in_memory());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let c = Arc::clone(&c);
                    std::thread::spawn(move || {
                        for i in 0..100 {
                            let key = format!("{}-{}", t, i);
                            c.put(key.as_bytes(), b"v").unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(c.len(), 400);
        }
    }

    mod durable {
        use super::*;

        #[test]
        fn test_reopen_replays_batches() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                c.apply_batch(&batch(&[("a", "1"), ("b", "2")])).unwrap();
                c.delete(b"a").unwrap();
            }
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.get(b"a").unwrap(), None);
            assert_eq!(c.get(b"b").unwrap(), Some(b"2".to_vec()));
            assert!(c.is_durable());
        }

        #[test]
        fn test_torn_tail_is_discarded() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                c.put(b"kept", b"1").unwrap();
                c.put(b"torn", b"2").unwrap();
            }
            let len = std::fs::metadata(&path).unwrap().len();
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(len - 3).unwrap();
            drop(file);

            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.get(b"kept").unwrap(), Some(b"1".to_vec()));
            assert_eq!(c.get(b"torn").unwrap(), None);

            // The log is usable after truncation
            c.put(b"after", b"3").unwrap();
            drop(c);
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.get(b"after").unwrap(), Some(b"3".to_vec()));
        }

        #[test]
        fn test_mid_log_corruption_is_fatal() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                c.put(b"first", b"1").unwrap();
                c.put(b"second", b"2").unwrap();
            }
            let mut bytes = std::fs::read(&path).unwrap();
            // Flip a byte inside the first record's payload
            bytes[HEADER_LEN + RECORD_HEADER_LEN + 6] ^= 0xff;
            std::fs::write(&path, bytes).unwrap();

            let err = KvContainer::open(&path).unwrap_err();
            assert!(err.is_fatal());
        }

        #[test]
        fn test_bad_header_is_fatal() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            std::fs::write(&path, b"NOPE0000").unwrap();
            assert!(KvContainer::open(&path).unwrap_err().is_fatal());
        }

        #[test]
        fn test_compact_preserves_contents() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                for i in 0..50 {
                    c.put(format!("k{}", i).as_bytes(), b"old").unwrap();
                    c.put(format!("k{}", i).as_bytes(), b"new").unwrap();
                }
                let before = std::fs::metadata(&path).unwrap().len();
                c.compact().unwrap();
                let after = std::fs::metadata(&path).unwrap().len();
                assert!(after < before);
                c.put(b"post", b"compact").unwrap();
            }
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.len(), 51);
            assert_eq!(c.get(b"k7").unwrap(), Some(b"new".to_vec()));
            assert_eq!(c.get(b"post").unwrap(), Some(b"compact".to_vec()));
        }

        #[test]
        fn test_failed_append_is_rolled_back() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                c.put(b"a", b"1").unwrap();
                let before = std::fs::metadata(&path).unwrap().len();

                c.log.as_ref().unwrap().lock().short_write = Some(9);
                assert!(c.put(b"b", b"2").is_err());
                assert_eq!(c.get(b"b").unwrap(), None);
                assert_eq!(std::fs::metadata(&path).unwrap().len(), before);

                c.put(b"c", b"3").unwrap();
            }
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.get(b"a").unwrap(), Some(b"1".to_vec()));
            assert_eq!(c.get(b"b").unwrap(), None);
            assert_eq!(c.get(b"c").unwrap(), Some(b"3".to_vec()));
        }

        #[test]
        fn test_stray_tail_does_not_hide_later_batches() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            {
                let c = KvContainer::open(&path).unwrap();
                c.put(b"a", b"1").unwrap();
                let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
                raw.write_all(&[0, 0, 0, 40, 1, 2, 3, 4, 5]).unwrap();
                drop(raw);
                c.put(b"b", b"2").unwrap();
            }
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.get(b"a").unwrap(), Some(b"1".to_vec()));
            assert_eq!(c.get(b"b").unwrap(), Some(b"2".to_vec()));
        }

        #[test]
        fn test_poisoned_log_refuses_batches() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            let c = KvContainer::open(&path).unwrap();
            c.put(b"a", b"1").unwrap();
            c.log.as_ref().unwrap().lock().poisoned = true;

            assert!(c.put(b"b", b"2").is_err());
            assert_eq!(c.get(b"b").unwrap(), None);

            // A full rewrite starts a clean log
            c.compact().unwrap();
            c.put(b"b", b"2").unwrap();
            drop(c);
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.len(), 2);
        }

        #[test]
        fn test_failed_compaction_keeps_batches() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("data.log");
            // A directory in the way makes the snapshot file unwritable
            let blocker = path.with_extension("tmp");
            std::fs::create_dir(&blocker).unwrap();
            {
                let c = KvContainer::open(&path).unwrap().with_compact_threshold(2);
                for i in 0..5 {
                    c.put(format!("k{}", i).as_bytes(), b"v").unwrap();
                }
                assert_eq!(c.log.as_ref().unwrap().lock().records, 5);
            }
            let c = KvContainer::open(&path).unwrap().with_compact_threshold(2);
            assert_eq!(c.len(), 5);

            std::fs::remove_dir(&blocker).unwrap();
            c.put(b"k5", b"v").unwrap();
            assert_eq!(c.log.as_ref().unwrap().lock().records, 1);
            drop(c);
            let c = KvContainer::open(&path).unwrap();
            assert_eq!(c.len(), 6);
        }
    }
}
