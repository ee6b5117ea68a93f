//! Full-text index stored in a block file store
//!
//! This module provides:
//! - IndexWriter buffering documents for one commit
//! - FullTextIndex: segments on disk, postings in memory
//! - BM25 ranking with `+required` and `-excluded` query terms
//! - Version watermark (`index_version`) persisted in the manifest
//!
//! Documents are tagged with the item, attribute and version of the value
//! they were built from. Search results are filtered to versions visible
//! at the requested version, and the caller's filter drops hits whose value
//! has since been superseded.

use crate::segment::{
    read_manifest, read_segment, segment_file, write_manifest, write_segment, DocEntry,
    ManifestData, Posting, SegmentData, SEGMENT_PREFIX,
};
use crate::tokenizer::{term_frequencies, tokenize};
use cairn_core::{ItemId, Result, Version};
use cairn_storage::BlockFileStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// BM25 term saturation
const BM25_K1: f32 = 1.2;
/// BM25 length normalization
const BM25_B: f32 = 0.75;

// ============================================================================
// IndexWriter
// ============================================================================

#[derive(Debug, Clone)]
struct PendingDoc {
    entry: DocEntry,
    terms: BTreeMap<String, u32>,
}

/// Documents buffered for one commit
///
/// Nothing is visible to searches until the writer is passed to
/// [`FullTextIndex::commit_writer`].
#[derive(Debug, Default)]
pub struct IndexWriter {
    docs: Vec<PendingDoc>,
}

impl IndexWriter {
    /// Index `text` as the value of `attribute` on `item` at `version`
    pub fn index_value(&mut self, item: ItemId, attribute: &str, text: &str, version: Version) {
        let (terms, len) = term_frequencies(text);
        self.docs.push(PendingDoc {
            entry: DocEntry {
                item,
                attribute: attribute.to_string(),
                version,
                len,
            },
            terms,
        });
    }

    /// Index everything `reader` yields
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn index_reader<R: Read>(
        &mut self,
        item: ItemId,
        attribute: &str,
        mut reader: R,
        version: Version,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.index_value(item, attribute, &String::from_utf8_lossy(&bytes), version);
        Ok(())
    }

    /// Number of buffered documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

// ============================================================================
// Query
// ============================================================================

/// Parsed free-text query
///
/// Words prefixed with `+` must match, words prefixed with `-` must not,
/// other words are optional and only affect ranking and recall.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Terms every hit must contain
    pub required: Vec<String>,
    /// Terms a hit may contain
    pub optional: Vec<String>,
    /// Terms no hit may contain
    pub excluded: Vec<String>,
}

impl Query {
    /// Parse query text
    ///
    /// # Example
    ///
    /// ```
    /// use cairn_search::Query;
    ///
    /// let q = Query::parse("+budget review -draft");
    /// assert_eq!(q.required, vec!["budget"]);
    /// assert_eq!(q.optional, vec!["review"]);
    /// assert_eq!(q.excluded, vec!["draft"]);
    /// ```
    pub fn parse(text: &str) -> Self {
        let mut query = Query::default();
        for word in text.split_whitespace() {
            let (bucket, rest) = if let Some(rest) = word.strip_prefix('+') {
                (&mut query.required, rest)
            } else if let Some(rest) = word.strip_prefix('-') {
                (&mut query.excluded, rest)
            } else {
                (&mut query.optional, word)
            };
            for term in tokenize(rest) {
                if !bucket.contains(&term) {
                    bucket.push(term);
                }
            }
        }
        query
    }

    /// Query matching every document
    pub fn all() -> Self {
        Self::default()
    }

    fn scores_terms(&self) -> bool {
        !self.required.is_empty() || !self.optional.is_empty()
    }
}

// ============================================================================
// Hits
// ============================================================================

/// One search result
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Item holding the matching value
    pub item: ItemId,
    /// Attribute holding the matching value
    pub attribute: String,
    /// Version of the indexed value
    pub version: Version,
    /// BM25 score (0 for match-all queries)
    pub score: f32,
}

/// Lazy, restartable search results
///
/// Every call to [`iter`](Self::iter) runs the query again against the
/// current index contents; the filter runs as hits are pulled.
pub struct SearchResults<F> {
    index: FullTextIndex,
    query: Query,
    attribute: Option<String>,
    version: Version,
    filter: F,
}

impl<F: Fn(&Hit) -> bool> SearchResults<F> {
    /// Iterate hits, best first
    pub fn iter(&self) -> impl Iterator<Item = Hit> + '_ {
        let ranked = self
            .index
            .ranked(&self.query, self.attribute.as_deref(), self.version);
        ranked
            .into_iter()
            .filter_map(move |(doc, score)| self.index.hit(doc, score))
            .filter(move |hit| (self.filter)(hit))
    }

    /// Parsed query
    pub fn query(&self) -> &Query {
        &self.query
    }
}

// ============================================================================
// FullTextIndex
// ============================================================================

struct Inner {
    store: BlockFileStore,
    postings: DashMap<String, Vec<Posting>>,
    docs: DashMap<u32, DocEntry>,
    total_len: AtomicU64,
    manifest: Mutex<ManifestData>,
}

/// Full-text index over a block file store
///
/// Cheap to clone; clones share state. Postings for deleted documents stay
/// in memory and on disk until [`optimize`](Self::optimize).
#[derive(Clone)]
pub struct FullTextIndex {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FullTextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullTextIndex")
            .field("docs", &self.doc_count())
            .field("index_version", &self.index_version())
            .finish()
    }
}

impl FullTextIndex {
    /// Open the index kept in `store`, creating an empty one if needed
    ///
    /// Segment files not listed in the manifest are left over from an
    /// interrupted commit and are deleted.
    pub fn open(store: BlockFileStore) -> Result<Self> {
        let manifest = read_manifest(&store)?.unwrap_or_default();
        let inner = Inner {
            store,
            postings: DashMap::new(),
            docs: DashMap::new(),
            total_len: AtomicU64::new(0),
            manifest: Mutex::new(ManifestData::default()),
        };
        let index = Self {
            inner: Arc::new(inner),
        };

        for id in &manifest.segments {
            let segment = read_segment(&index.inner.store, *id)?;
            index.load_segment(segment, &manifest.deleted);
        }

        let listed: HashSet<String> = manifest.segments.iter().map(|id| segment_file(*id)).collect();
        for name in index.inner.store.list()? {
            if name.starts_with(SEGMENT_PREFIX) && !listed.contains(&name) {
                warn!(file = %name, "Deleting orphaned index segment");
                index.inner.store.delete_file(&name)?;
            }
        }

        info!(
            segments = manifest.segments.len(),
            docs = index.inner.docs.len(),
            index_version = manifest.index_version,
            "Opened full-text index"
        );
        *index.inner.manifest.lock() = manifest;
        Ok(index)
    }

    /// Start buffering documents for a commit
    pub fn writer(&self) -> IndexWriter {
        IndexWriter::default()
    }

    /// Persist `writer` as a new segment and raise the watermark
    ///
    /// Returns the number of documents added. Either the segment and the
    /// manifest are both written or the index is unchanged.
    pub fn commit_writer(&self, writer: IndexWriter, index_version: Version) -> Result<usize> {
        let mut manifest = self.inner.manifest.lock();
        let mut updated = manifest.clone();
        updated.index_version = updated.index_version.max(index_version);

        if writer.is_empty() {
            if updated != *manifest {
                write_manifest(&self.inner.store, &updated)?;
                *manifest = updated;
            }
            return Ok(0);
        }

        let mut segment = SegmentData {
            id: updated.next_segment,
            docs: Vec::with_capacity(writer.docs.len()),
            postings: BTreeMap::new(),
        };
        let mut next_doc = updated.next_doc;
        for pending in writer.docs {
            let doc = next_doc;
            next_doc += 1;
            for (term, tf) in pending.terms {
                segment
                    .postings
                    .entry(term)
                    .or_default()
                    .push(Posting { doc, tf });
            }
            segment.docs.push((doc, pending.entry));
        }
        let count = segment.docs.len();

        write_segment(&self.inner.store, &segment)?;
        updated.next_doc = next_doc;
        updated.next_segment = segment.id + 1;
        updated.segments.push(segment.id);
        if let Err(e) = write_manifest(&self.inner.store, &updated) {
            if let Err(cleanup) = self.inner.store.delete_file(&segment_file(segment.id)) {
                warn!(error = %cleanup, "Failed to remove unreferenced segment");
            }
            return Err(e);
        }

        debug!(segment = segment.id, docs = count, index_version, "Committed index writer");
        self.load_segment(segment, &updated.deleted);
        *manifest = updated;
        Ok(count)
    }

    /// Discard a writer without touching the index
    pub fn abort_writer(&self, writer: IndexWriter) {
        debug!(docs = writer.len(), "Aborted index writer");
    }

    /// Search for `query` among documents visible at `version`
    ///
    /// `query` of `None` matches every document. `attribute` restricts hits
    /// to one attribute. `filter` is applied lazily to each hit.
    pub fn search_documents<F>(
        &self,
        version: Version,
        query: Option<&str>,
        attribute: Option<&str>,
        filter: F,
    ) -> SearchResults<F>
    where
        F: Fn(&Hit) -> bool,
    {
        SearchResults {
            index: self.clone(),
            query: query.map(Query::parse).unwrap_or_default(),
            attribute: attribute.map(str::to_string),
            version,
            filter,
        }
    }

    /// Delete documents of `item`
    ///
    /// With `to_version` of `None` every document of the item goes.
    /// Otherwise documents at or below `to_version` go unless `keep`
    /// returns true for them. Returns the number deleted.
    pub fn purge_documents<K>(&self, item: ItemId, to_version: Option<Version>, keep: K) -> Result<usize>
    where
        K: Fn(&DocEntry) -> bool,
    {
        let doomed: Vec<u32> = self
            .inner
            .docs
            .iter()
            .filter(|e| e.value().item == item)
            .filter(|e| match to_version {
                None => true,
                Some(v) => e.value().version <= v && !keep(e.value()),
            })
            .map(|e| *e.key())
            .collect();
        self.delete_docs(doomed)
    }

    /// Delete documents of `item` indexed at exactly `version`
    pub fn undo_documents(&self, item: ItemId, version: Version) -> Result<usize> {
        let doomed: Vec<u32> = self
            .inner
            .docs
            .iter()
            .filter(|e| e.value().item == item && e.value().version == version)
            .map(|e| *e.key())
            .collect();
        self.delete_docs(doomed)
    }

    /// Merge all segments into one, dropping deleted documents
    pub fn optimize(&self) -> Result<()> {
        let mut manifest = self.inner.manifest.lock();
        if manifest.segments.len() <= 1 && manifest.deleted.is_empty() {
            return Ok(());
        }

        let mut docs: Vec<(u32, DocEntry)> = self
            .inner
            .docs
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        docs.sort_by_key(|(id, _)| *id);

        let mut postings = BTreeMap::new();
        for entry in self.inner.postings.iter() {
            let live: Vec<Posting> = entry
                .value()
                .iter()
                .filter(|p| self.inner.docs.contains_key(&p.doc))
                .copied()
                .collect();
            if !live.is_empty() {
                postings.insert(entry.key().clone(), live);
            }
        }

        let segment = SegmentData {
            id: manifest.next_segment,
            docs,
            postings,
        };
        write_segment(&self.inner.store, &segment)?;

        let mut updated = manifest.clone();
        let old = std::mem::replace(&mut updated.segments, vec![segment.id]);
        updated.next_segment = segment.id + 1;
        updated.deleted.clear();
        write_manifest(&self.inner.store, &updated)?;

        for id in &old {
            if let Err(e) = self.inner.store.delete_file(&segment_file(*id)) {
                warn!(segment = id, error = %e, "Failed to delete merged segment");
            }
        }

        self.inner.postings.clear();
        for (term, list) in &segment.postings {
            self.inner.postings.insert(term.clone(), list.clone());
        }
        info!(merged = old.len(), docs = segment.docs.len(), "Optimized full-text index");
        *manifest = updated;
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Highest repository version whose documents are committed
    pub fn index_version(&self) -> Version {
        self.inner.manifest.lock().index_version
    }

    /// Number of live documents
    pub fn doc_count(&self) -> usize {
        self.inner.docs.len()
    }

    /// Number of segment files
    pub fn segment_count(&self) -> usize {
        self.inner.manifest.lock().segments.len()
    }

    /// Live documents containing `term`
    pub fn doc_freq(&self, term: &str) -> usize {
        self.inner
            .postings
            .get(term)
            .map(|list| {
                list.iter()
                    .filter(|p| self.inner.docs.contains_key(&p.doc))
                    .count()
            })
            .unwrap_or(0)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn load_segment(&self, segment: SegmentData, deleted: &std::collections::BTreeSet<u32>) {
        for (id, entry) in segment.docs {
            if deleted.contains(&id) {
                continue;
            }
            self.inner
                .total_len
                .fetch_add(u64::from(entry.len), Ordering::Relaxed);
            self.inner.docs.insert(id, entry);
        }
        for (term, list) in segment.postings {
            self.inner.postings.entry(term).or_default().extend(list);
        }
    }

    fn delete_docs(&self, doomed: Vec<u32>) -> Result<usize> {
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut manifest = self.inner.manifest.lock();
        let mut updated = manifest.clone();
        updated.deleted.extend(doomed.iter().copied());
        write_manifest(&self.inner.store, &updated)?;
        *manifest = updated;

        let mut count = 0;
        for id in doomed {
            if let Some((_, entry)) = self.inner.docs.remove(&id) {
                self.inner
                    .total_len
                    .fetch_sub(u64::from(entry.len), Ordering::Relaxed);
                count += 1;
            }
        }
        debug!(docs = count, "Deleted indexed documents");
        Ok(count)
    }

    fn visible(&self, doc: u32, attribute: Option<&str>, version: Version) -> bool {
        self.inner
            .docs
            .get(&doc)
            .map(|e| e.version <= version && attribute.map_or(true, |a| e.attribute == a))
            .unwrap_or(false)
    }

    fn term_docs(&self, term: &str) -> HashSet<u32> {
        self.inner
            .postings
            .get(term)
            .map(|list| list.iter().map(|p| p.doc).collect())
            .unwrap_or_default()
    }

    /// Matching document ids with scores, best first
    fn ranked(&self, query: &Query, attribute: Option<&str>, version: Version) -> Vec<(u32, f32)> {
        let mut scores: HashMap<u32, f32> = HashMap::new();

        if query.scores_terms() {
            let n = self.inner.docs.len() as f32;
            let avg_len = if n > 0.0 {
                self.inner.total_len.load(Ordering::Relaxed) as f32 / n
            } else {
                0.0
            };
            let mut required_hits: HashMap<u32, usize> = HashMap::new();

            let optional = query.optional.iter().filter(|t| !query.required.contains(t));
            for term in query.required.iter().chain(optional) {
                let Some(list) = self.inner.postings.get(term) else {
                    continue;
                };
                let live: Vec<(Posting, u32)> = list
                    .iter()
                    .filter_map(|p| self.inner.docs.get(&p.doc).map(|e| (*p, e.len)))
                    .collect();
                let df = live.len() as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let is_required = query.required.contains(term);

                for (posting, len) in live {
                    let tf = posting.tf as f32;
                    let norm = if avg_len > 0.0 { len as f32 / avg_len } else { 1.0 };
                    let tf_comp = (tf * (BM25_K1 + 1.0))
                        / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * norm));
                    *scores.entry(posting.doc).or_insert(0.0) += idf * tf_comp;
                    if is_required {
                        *required_hits.entry(posting.doc).or_insert(0) += 1;
                    }
                }
            }

            if !query.required.is_empty() {
                let needed = query.required.len();
                scores.retain(|doc, _| required_hits.get(doc) == Some(&needed));
            }
        } else {
            for entry in self.inner.docs.iter() {
                scores.insert(*entry.key(), 0.0);
            }
        }

        let excluded: HashSet<u32> = query
            .excluded
            .iter()
            .flat_map(|t| self.term_docs(t))
            .collect();

        let mut ranked: Vec<(u32, f32)> = scores
            .into_iter()
            .filter(|(doc, _)| !excluded.contains(doc))
            .filter(|(doc, _)| self.visible(*doc, attribute, version))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }

    fn hit(&self, doc: u32, score: f32) -> Option<Hit> {
        self.inner.docs.get(&doc).map(|e| Hit {
            item: e.item,
            attribute: e.attribute.clone(),
            version: e.version,
            score,
        })
    }
}
