//! End-to-end tests through the `cairn` facade
//!
//! A small notes application: schema, durable repository, two views, live
//! sets, a background worker, block files and full-text search.

use cairn::{
    Attribute, Cardinality, DeletePolicy, Repository, RepositoryWorker, Schema, SchemaBuilder,
    SetOp, Value, ValueType,
};
use std::sync::mpsc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

fn schema() -> Schema {
    SchemaBuilder::new()
        .kind(
            "Notebook",
            &[],
            vec![
                Attribute::new("title").with_type(ValueType::Text).required(),
                Attribute::new("notes")
                    .with_type(ValueType::Item)
                    .with_cardinality(Cardinality::Set)
                    .with_inverse("notebook")
                    .with_delete_policy(DeletePolicy::Cascade),
            ],
        )
        .kind(
            "Note",
            &[],
            vec![
                Attribute::new("body").with_type(ValueType::Text).indexed(),
                Attribute::new("notebook").with_inverse("notes"),
                Attribute::new("attachment").with_type(ValueType::Text),
            ],
        )
        .build()
        .unwrap()
}

#[test]
fn test_notes_application() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let repo = Repository::create(dir.path().join("notes"), schema()).unwrap();

    let mut editor = repo.create_view(Some("editor"), None).unwrap();
    let book = editor.create_item("Notebook", None, Some("work")).unwrap();
    editor.set_value(book, "title", "Work").unwrap();
    let n1 = editor.create_item("Note", Some(book), Some("standup")).unwrap();
    editor.set_value(n1, "body", "daily standup agenda").unwrap();
    editor.set_value(n1, "notebook", book).unwrap();
    assert_eq!(editor.get_value(book, "notes").unwrap(), Some(Value::set([n1])));
    assert_eq!(editor.commit().unwrap(), 1);

    // A second view follows the notebook through a live attribute set
    let mut reader = repo.create_view(Some("reader"), None).unwrap();
    let in_book = reader.attribute_set(book, "notes").unwrap();
    let (tx, rx) = mpsc::channel();
    reader
        .watch(in_book, move |e| {
            let _ = tx.send((e.op, e.item));
        })
        .unwrap();

    let n2 = editor.create_item("Note", Some(book), Some("retro")).unwrap();
    editor.set_value(n2, "body", "sprint retro notes").unwrap();
    editor.set_value(n2, "notebook", book).unwrap();
    editor.commit().unwrap();

    assert_eq!(reader.set_len(in_book).unwrap(), 1);
    reader.refresh().unwrap();
    assert_eq!(reader.set_len(in_book).unwrap(), 2);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![(SetOp::Add, n2)]);

    // Full-text sees both notes at the latest version
    let hits: Vec<_> = reader.search("retro agenda", Some("body")).unwrap().iter().map(|h| h.item).collect();
    assert_eq!(hits.len(), 2);

    // Large values live in block files next to the items
    let mut out = repo.files().create_file("retro.txt").unwrap();
    out.write_bytes(&[7u8; 40_000]).unwrap();
    out.close().unwrap();
    editor.set_value(n2, "attachment", "retro.txt").unwrap();
    editor.commit().unwrap();
    assert_eq!(repo.files().file_length("retro.txt").unwrap(), 40_000);

    // Deleting the notebook cascades to its notes
    editor.delete_item(book).unwrap();
    editor.commit().unwrap();
    reader.refresh().unwrap();
    assert!(reader.find(n1).unwrap().is_none());
    assert!(reader.find(n2).unwrap().is_none());
    assert!(reader.roots().unwrap().is_empty());
    assert_eq!(reader.search("standup", None).unwrap().iter().count(), 0);
}

#[test]
fn test_worker_writes_are_visible_to_views() {
    init_tracing();
    let repo = Repository::ephemeral(schema()).unwrap();
    let worker = RepositoryWorker::spawn(&repo, "importer", 4).unwrap();
    for i in 0..3 {
        worker
            .enqueue(move |view| {
                let book = view.create_item("Notebook", None, None).unwrap();
                view.set_value(book, "title", format!("Imported {}", i)).unwrap();
                view.commit().unwrap();
            })
            .unwrap();
    }
    worker.drain();
    worker.terminate();

    let mut view = repo.create_view(None, None).unwrap();
    let books = view.kind_set("Notebook", false).unwrap();
    assert_eq!(view.set_len(books).unwrap(), 3);
    assert_eq!(repo.latest_version(), 3);
}
