//! Segment and manifest files
//!
//! Both live in the block file store and share one framing:
//!
//! ```text
//! magic (4) | format version (u32 BE) | crc32 of payload (u32 BE) | payload (MessagePack)
//! ```
//!
//! A segment is immutable once written. The manifest lists the live
//! segments and deleted document ids; it is replaced atomically by writing
//! a temporary file and renaming it over the old one.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cairn_core::{Error, ItemId, Result, Version};
use cairn_storage::BlockFileStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

const SEGMENT_MAGIC: &[u8; 4] = b"CSEG";
const MANIFEST_MAGIC: &[u8; 4] = b"CSIX";
const FORMAT_VERSION: u32 = 1;
const FRAME_HEADER: usize = 12;

pub(crate) const MANIFEST_FILE: &str = "index.manifest";
const MANIFEST_TMP: &str = "index.manifest.tmp";
pub(crate) const SEGMENT_PREFIX: &str = "seg-";

pub(crate) fn segment_file(id: u64) -> String {
    format!("{}{:08}", SEGMENT_PREFIX, id)
}

/// An indexed document: one value of one attribute at one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocEntry {
    /// Item holding the value
    pub item: ItemId,
    /// Attribute holding the value
    pub attribute: String,
    /// Version that committed the value
    pub version: Version,
    /// Token count
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Posting {
    pub doc: u32,
    pub tf: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SegmentData {
    pub id: u64,
    pub docs: Vec<(u32, DocEntry)>,
    pub postings: BTreeMap<String, Vec<Posting>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ManifestData {
    pub index_version: Version,
    pub next_doc: u32,
    pub next_segment: u64,
    pub segments: Vec<u64>,
    pub deleted: BTreeSet<u32>,
}

fn frame(magic: &[u8; 4], payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(FRAME_HEADER + payload.len());
    buf.extend_from_slice(magic);
    buf.write_u32::<BigEndian>(FORMAT_VERSION)?;
    buf.write_u32::<BigEndian>(crc32fast::hash(payload))?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn unframe<'a>(magic: &[u8; 4], bytes: &'a [u8], what: &str) -> Result<&'a [u8]> {
    if bytes.len() < FRAME_HEADER || &bytes[0..4] != magic {
        return Err(Error::corruption(format!("{} has a bad header", what)));
    }
    let mut cursor = Cursor::new(&bytes[4..FRAME_HEADER]);
    let version = cursor.read_u32::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::corruption(format!(
            "{} has unsupported format version {}",
            what, version
        )));
    }
    let crc = cursor.read_u32::<BigEndian>()?;
    let payload = &bytes[FRAME_HEADER..];
    if crc32fast::hash(payload) != crc {
        return Err(Error::corruption(format!("{} failed its checksum", what)));
    }
    Ok(payload)
}

pub(crate) fn write_segment(store: &BlockFileStore, segment: &SegmentData) -> Result<()> {
    let bytes = frame(SEGMENT_MAGIC, &rmp_serde::to_vec(segment)?)?;
    store.write_file(&segment_file(segment.id), &bytes)
}

pub(crate) fn read_segment(store: &BlockFileStore, id: u64) -> Result<SegmentData> {
    let name = segment_file(id);
    let bytes = store.read_file(&name)?;
    Ok(rmp_serde::from_slice(unframe(SEGMENT_MAGIC, &bytes, &name)?)?)
}

pub(crate) fn write_manifest(store: &BlockFileStore, manifest: &ManifestData) -> Result<()> {
    let bytes = frame(MANIFEST_MAGIC, &rmp_serde::to_vec(manifest)?)?;
    store.write_file(MANIFEST_TMP, &bytes)?;
    store.rename_file(MANIFEST_TMP, MANIFEST_FILE)
}

pub(crate) fn read_manifest(store: &BlockFileStore) -> Result<Option<ManifestData>> {
    if !store.file_exists(MANIFEST_FILE)? {
        return Ok(None);
    }
    let bytes = store.read_file(MANIFEST_FILE)?;
    Ok(Some(rmp_serde::from_slice(unframe(
        MANIFEST_MAGIC,
        &bytes,
        MANIFEST_FILE,
    )?)?))
}
