//! Integration tests for live sets
//!
//! Random edit sequences are mirrored on a plain model. After every edit the
//! membership of each set, and the add/remove notifications it emitted, must
//! match the model's before/after difference exactly.

use cairn_core::{Attribute, ItemId, Schema, SchemaBuilder, Value, ValueType};
use cairn_engine::{Repository, RepositoryView, SetEvent, SetId, SetOp};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

fn schema() -> Schema {
    SchemaBuilder::new()
        .kind(
            "Note",
            &[],
            vec![Attribute::new("urgent").with_type(ValueType::Bool)],
        )
        .kind("Task", &["Note"], vec![])
        .build()
        .unwrap()
}

#[test]
fn test_kind_set_add_is_immediate_and_single() {
    let repo = Repository::ephemeral(schema()).unwrap();
    let mut view = repo.create_view(None, None).unwrap();
    let tasks = view.kind_set("Task", false).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    view.watch(tasks, move |e: &SetEvent| sink.lock().unwrap().push(e.clone()))
        .unwrap();

    let m = view.create_item("Task", None, None).unwrap();
    assert!(view.set_contains(tasks, m).unwrap());
    assert_eq!(
        *events.lock().unwrap(),
        vec![SetEvent {
            op: SetOp::Add,
            item: m,
            set: tasks
        }]
    );
}

#[test]
fn test_sets_survive_commit_without_rebuild() {
    let repo = Repository::ephemeral(schema()).unwrap();
    let mut view = repo.create_view(None, None).unwrap();
    let notes = view.kind_set("Note", true).unwrap();
    for _ in 0..3 {
        view.create_item("Note", None, None).unwrap();
    }
    view.commit().unwrap();
    view.create_item("Task", None, None).unwrap();
    view.commit().unwrap();
    assert_eq!(view.set_len(notes).unwrap(), 4);
    let stats = view.set_stats(notes).unwrap();
    assert_eq!(stats.rebuilds, 1);
    assert_eq!(stats.adds, 4);
}

#[derive(Debug, Clone)]
enum Op {
    Create { task: bool, urgent: bool },
    Delete { at: usize },
    Flag { at: usize, urgent: bool },
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<bool>(), any::<bool>()).prop_map(|(task, urgent)| Op::Create { task, urgent }),
        1 => any::<usize>().prop_map(|at| Op::Delete { at }),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(at, urgent)| Op::Flag { at, urgent }),
        1 => Just(Op::Commit),
    ]
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: ItemId,
    task: bool,
    urgent: bool,
}

struct Sets {
    notes: SetId,
    tasks: SetId,
    all: SetId,
    urgent: SetId,
    urgent_all: SetId,
    calm: SetId,
}

impl Sets {
    fn install(view: &mut RepositoryView) -> Self {
        let notes = view.kind_set("Note", false).unwrap();
        let tasks = view.kind_set("Task", false).unwrap();
        let all = view.union_set(&[notes, tasks]).unwrap();
        let urgent = view
            .filter_set(all, &["urgent"], |facts| {
                facts.get("urgent").and_then(Value::as_bool).unwrap_or(false)
            })
            .unwrap();
        let urgent_all = view.intersection_set(&[all, urgent]).unwrap();
        let calm = view.difference_set(all, &[urgent]).unwrap();
        Self {
            notes,
            tasks,
            all,
            urgent,
            urgent_all,
            calm,
        }
    }

    fn expected(&self, model: &[Entry]) -> BTreeMap<SetId, BTreeSet<ItemId>> {
        let select = |f: &dyn Fn(&Entry) -> bool| -> BTreeSet<ItemId> {
            model.iter().filter(|e| f(e)).map(|e| e.id).collect()
        };
        let mut out = BTreeMap::new();
        out.insert(self.notes, select(&|e| !e.task));
        out.insert(self.tasks, select(&|e| e.task));
        out.insert(self.all, select(&|_| true));
        out.insert(self.urgent, select(&|e| e.urgent));
        out.insert(self.urgent_all, select(&|e| e.urgent));
        out.insert(self.calm, select(&|e| !e.urgent));
        out
    }
}

fn apply(view: &mut RepositoryView, model: &mut Vec<Entry>, op: &Op) {
    match op {
        Op::Create { task, urgent } => {
            let kind = if *task { "Task" } else { "Note" };
            let id = view.create_item(kind, None, None).unwrap();
            view.set_value(id, "urgent", *urgent).unwrap();
            model.push(Entry {
                id,
                task: *task,
                urgent: *urgent,
            });
        }
        Op::Delete { at } => {
            if model.is_empty() {
                return;
            }
            let entry = model.remove(at % model.len());
            view.delete_item(entry.id).unwrap();
        }
        Op::Flag { at, urgent } => {
            if model.is_empty() {
                return;
            }
            let i = at % model.len();
            model[i].urgent = *urgent;
            view.set_value(model[i].id, "urgent", *urgent).unwrap();
        }
        Op::Commit => {
            view.commit().unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_set_deltas_match_model(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let repo = Repository::ephemeral(schema()).unwrap();
        let mut view = repo.create_view(None, None).unwrap();
        let sets = Sets::install(&mut view);
        let events: Arc<Mutex<Vec<SetEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let all_sets = [sets.notes, sets.tasks, sets.all, sets.urgent, sets.urgent_all, sets.calm];
        for set in all_sets {
            let sink = Arc::clone(&events);
            view.watch(set, move |e: &SetEvent| sink.lock().unwrap().push(e.clone())).unwrap();
        }

        let mut model: Vec<Entry> = Vec::new();
        let mut before = sets.expected(&model);
        for op in &ops {
            apply(&mut view, &mut model, op);
            let after = sets.expected(&model);
            let observed: Vec<SetEvent> = std::mem::take(&mut *events.lock().unwrap());

            for set in all_sets {
                let members: BTreeSet<ItemId> = view.set_items(set).unwrap().into_iter().collect();
                prop_assert_eq!(&members, &after[&set]);

                // Within one edit an item may transiently enter and leave a
                // set, so compare the net effect per item.
                let mut net: BTreeMap<ItemId, i32> = BTreeMap::new();
                for e in observed.iter().filter(|e| e.set == set) {
                    match e.op {
                        SetOp::Add => *net.entry(e.item).or_default() += 1,
                        SetOp::Remove => *net.entry(e.item).or_default() -= 1,
                        SetOp::Changed => {}
                    }
                }
                net.retain(|_, n| *n != 0);
                let added: BTreeSet<ItemId> = net.iter().filter(|(_, n)| **n > 0).map(|(id, _)| *id).collect();
                let removed: BTreeSet<ItemId> = net.iter().filter(|(_, n)| **n < 0).map(|(id, _)| *id).collect();
                prop_assert_eq!(&added, &after[&set].difference(&before[&set]).copied().collect::<BTreeSet<_>>());
                prop_assert_eq!(&removed, &before[&set].difference(&after[&set]).copied().collect::<BTreeSet<_>>());
                prop_assert!(net.values().all(|n| n.abs() == 1));
            }
            before = after;
        }

        for set in all_sets {
            prop_assert_eq!(view.set_stats(set).unwrap().rebuilds, 1);
        }
    }
}
