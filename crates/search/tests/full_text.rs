//! Full-text index over a durable container
//!
//! Covers persistence across reopen and query semantics checked against a
//! brute-force scan of the same documents.

use cairn_core::ItemId;
use cairn_search::{tokenize, FullTextIndex, Query};
use cairn_storage::{BlockFileStore, KvContainer, INDEX_BLOCK_SHIFT};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn open_store(path: &std::path::Path) -> BlockFileStore {
    let container = Arc::new(KvContainer::open(path).unwrap());
    BlockFileStore::new(container, "fts", INDEX_BLOCK_SHIFT).unwrap()
}

mod persistence {
    use super::*;

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.log");
        let memo = ItemId::new();
        let letter = ItemId::new();

        {
            let index = FullTextIndex::open(open_store(&path)).unwrap();
            let mut writer = index.writer();
            writer.index_value(memo, "body", "quarterly budget memo", 1);
            index.commit_writer(writer, 1).unwrap();

            let mut writer = index.writer();
            writer
                .index_reader(letter, "body", "a letter about the budget".as_bytes(), 2)
                .unwrap();
            index.commit_writer(writer, 2).unwrap();
        }

        let index = FullTextIndex::open(open_store(&path)).unwrap();
        assert_eq!(index.index_version(), 2);
        assert_eq!(index.doc_count(), 2);

        let at1: Vec<ItemId> = index
            .search_documents(1, Some("budget"), None, |_| true)
            .iter()
            .map(|h| h.item)
            .collect();
        assert_eq!(at1, vec![memo]);

        let at2: HashSet<ItemId> = index
            .search_documents(2, Some("budget"), None, |_| true)
            .iter()
            .map(|h| h.item)
            .collect();
        assert_eq!(at2, HashSet::from([memo, letter]));
    }

    #[test]
    fn test_large_document_spans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.log");
        let item = ItemId::new();
        let text: String = (0..20_000).map(|i| format!("word{} ", i)).collect();

        {
            let index = FullTextIndex::open(open_store(&path)).unwrap();
            let mut writer = index.writer();
            writer.index_value(item, "body", &text, 1);
            index.commit_writer(writer, 1).unwrap();
        }

        let index = FullTextIndex::open(open_store(&path)).unwrap();
        let hits: Vec<_> = index
            .search_documents(1, Some("+word19999 +word0"), None, |_| true)
            .iter()
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item, item);
    }
}

mod semantics {
    use super::*;

    const VOCAB: &[&str] = &["alpha", "beta", "gamma", "delta", "omega", "sigma"];

    fn doc_strategy() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0..VOCAB.len(), 1..8)
    }

    proptest! {
        #[test]
        fn prop_matches_brute_force(
            docs in prop::collection::vec(doc_strategy(), 1..20),
            required in prop::collection::vec(0..VOCAB.len(), 0..2),
            optional in prop::collection::vec(0..VOCAB.len(), 0..3),
            excluded in prop::collection::vec(0..VOCAB.len(), 0..2),
        ) {
            let store = BlockFileStore::new(Arc::new(KvContainer::in_memory()), "fts", INDEX_BLOCK_SHIFT).unwrap();
            let index = FullTextIndex::open(store).unwrap();
            let mut writer = index.writer();
            let mut expected_texts = Vec::new();
            for words in &docs {
                let item = ItemId::new();
                let text: Vec<&str> = words.iter().map(|w| VOCAB[*w]).collect();
                let text = text.join(" ");
                writer.index_value(item, "body", &text, 1);
                expected_texts.push((item, text));
            }
            index.commit_writer(writer, 1).unwrap();

            let mut query_text = String::new();
            for w in &required { query_text.push_str(&format!("+{} ", VOCAB[*w])); }
            for w in &optional { query_text.push_str(&format!("{} ", VOCAB[*w])); }
            for w in &excluded { query_text.push_str(&format!("-{} ", VOCAB[*w])); }
            let query = Query::parse(&query_text);

            let expected: HashSet<ItemId> = expected_texts
                .iter()
                .filter(|(_, text)| {
                    let terms: HashSet<String> = tokenize(text).into_iter().collect();
                    let matches_terms = if query.required.is_empty() && query.optional.is_empty() {
                        true
                    } else if !query.required.is_empty() {
                        query.required.iter().all(|t| terms.contains(t))
                    } else {
                        query.optional.iter().any(|t| terms.contains(t))
                    };
                    matches_terms && !query.excluded.iter().any(|t| terms.contains(t))
                })
                .map(|(item, _)| *item)
                .collect();

            let hits: Vec<_> = index
                .search_documents(1, Some(&query_text), None, |_| true)
                .iter()
                .collect();
            let found: HashSet<ItemId> = hits.iter().map(|h| h.item).collect();
            prop_assert_eq!(found, expected);
            for pair in hits.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
