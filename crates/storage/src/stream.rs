//! Read and write streams over block files
//!
//! - `OutputStream` keeps one block in memory, flushing it when a write
//!   crosses into another block and on close
//! - `InputStream` is cheap to clone; each clone has its own position
//!
//! Both implement the `std::io` traits so they plug into readers and
//! writers expecting files.

use crate::file::{now_ms, BlockFileStore, FileRecord};
use cairn_core::{Error, Result};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{trace, warn};

fn to_io(e: Error) -> io::Error {
    match e {
        Error::Io(inner) => inner,
        Error::InvalidSeek { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
        Error::FileNotFound(_) => io::Error::new(io::ErrorKind::NotFound, e),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

#[derive(Debug, Clone)]
struct Block {
    index: u32,
    data: Vec<u8>,
    dirty: bool,
}

fn block_index(position: u64, shift: u8) -> Result<u32> {
    u32::try_from(position >> shift)
        .map_err(|_| Error::invalid_state(format!("offset {} beyond addressable blocks", position)))
}

// ===== OutputStream =====

/// Write stream over one file
///
/// Writes may target any offset; unwritten gaps read back as zeros. The
/// file's length and modification time are persisted by [`close`](Self::close),
/// which `Drop` calls if the caller did not.
#[derive(Debug)]
pub struct OutputStream {
    store: BlockFileStore,
    name: String,
    record: FileRecord,
    length: u64,
    position: u64,
    block: Option<Block>,
    closed: bool,
}

impl OutputStream {
    pub(crate) fn new(
        store: BlockFileStore,
        name: String,
        record: FileRecord,
        position: u64,
    ) -> Self {
        let length = u64::from(record.length);
        Self {
            store,
            name,
            record,
            length,
            position,
            block: None,
            closed: false,
        }
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current write position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length including unflushed writes
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Move the write position; positions past the end are allowed
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.ensure_open()?;
        self.position = position;
        Ok(())
    }

    /// Write all of `buf` at the current position
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let shift = self.store.shift();
        let block_size = self.store.block_size();
        let mask = (block_size - 1) as u64;

        let end = self.position.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > u64::from(u32::MAX)) {
            return Err(Error::invalid_state(format!(
                "file {} would exceed {} bytes",
                self.name,
                u32::MAX
            )));
        }

        let mut written = 0;
        while written < buf.len() {
            let index = block_index(self.position, shift)?;
            let offset = (self.position & mask) as usize;
            let n = (block_size - offset).min(buf.len() - written);

            let block = self.load_block(index)?;
            if block.data.len() < offset + n {
                block.data.resize(offset + n, 0);
            }
            block.data[offset..offset + n].copy_from_slice(&buf[written..written + n]);
            block.dirty = true;

            written += n;
            self.position += n as u64;
            self.length = self.length.max(self.position);
        }
        Ok(())
    }

    /// Write the buffered block back to the container if it is dirty
    pub fn flush_block(&mut self) -> Result<()> {
        if let Some(block) = self.block.as_mut() {
            if block.dirty {
                self.store
                    .write_block(self.record.id, block.index, &block.data)?;
                block.dirty = false;
                trace!(file = %self.name, block = block.index, "Flushed block");
            }
        }
        Ok(())
    }

    /// Flush and persist the file's length and modification time
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_block()?;
        self.record.length = self.length as u32;
        self.record.modified_ms = now_ms();
        self.store.put_record(&self.name, &self.record)?;
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(format!(
                "write stream for {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn load_block(&mut self, index: u32) -> Result<&mut Block> {
        let current = self.block.as_ref().map(|b| b.index);
        if current != Some(index) {
            self.flush_block()?;
            let data = self
                .store
                .read_block(self.record.id, index)?
                .unwrap_or_default();
            self.block = Some(Block {
                index,
                data,
                dirty: false,
            });
        }
        self.block
            .as_mut()
            .ok_or_else(|| Error::invalid_state("block buffer missing"))
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(file = %self.name, error = %e, "Failed to close write stream");
        }
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block().map_err(to_io)
    }
}

impl Seek for OutputStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.position, self.length)?;
        self.seek_to(target).map_err(to_io)?;
        Ok(target)
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, length: u64) -> io::Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(p) => return Ok(p),
        SeekFrom::End(d) => (length, d),
        SeekFrom::Current(d) => (current, d),
    };
    base.checked_add_signed(delta).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
    })
}

// ===== InputStream =====

/// Read stream over one file, bounded by the length recorded at open
#[derive(Debug, Clone)]
pub struct InputStream {
    store: BlockFileStore,
    name: String,
    record: FileRecord,
    position: u64,
    block: Option<(u32, Vec<u8>)>,
}

impl InputStream {
    pub(crate) fn new(store: BlockFileStore, name: String, record: FileRecord) -> Self {
        Self {
            store,
            name,
            record,
            position: 0,
            block: None,
        }
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recorded length
    pub fn length(&self) -> u64 {
        u64::from(self.record.length)
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position
    ///
    /// # Errors
    ///
    /// `Error::InvalidSeek` if `position` is past the recorded length.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        if position > self.length() {
            return Err(Error::InvalidSeek {
                position,
                length: self.length(),
            });
        }
        self.position = position;
        Ok(())
    }

    /// Read up to `buf.len()` bytes; returns 0 at end of file
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.length().saturating_sub(self.position);
        let wanted = (buf.len() as u64).min(remaining) as usize;
        let shift = self.store.shift();
        let block_size = self.store.block_size();
        let mask = (block_size - 1) as u64;

        let mut read = 0;
        while read < wanted {
            let index = block_index(self.position, shift)?;
            let offset = (self.position & mask) as usize;
            let n = (block_size - offset).min(wanted - read);

            let data = self.load_block(index)?;
            let dst = &mut buf[read..read + n];
            // Bytes past the stored block were never written
            let available = data.len().saturating_sub(offset).min(n);
            dst[..available].copy_from_slice(&data[offset..offset + available]);
            dst[available..].fill(0);

            read += n;
            self.position += n as u64;
        }
        Ok(read)
    }

    /// Read from the current position to the end
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.length().saturating_sub(self.position) as usize;
        let mut out = vec![0u8; len];
        let n = self.read_bytes(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    fn load_block(&mut self, index: u32) -> Result<&[u8]> {
        if self.block.as_ref().map(|(i, _)| *i) != Some(index) {
            let data = self
                .store
                .read_block(self.record.id, index)?
                .unwrap_or_default();
            self.block = Some((index, data));
        }
        Ok(self.block.as_ref().map(|(_, d)| d.as_slice()).unwrap_or(&[]))
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(to_io)
    }
}

impl Seek for InputStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.position, self.length())?;
        self.seek_to(target).map_err(to_io)?;
        Ok(target)
    }
}
