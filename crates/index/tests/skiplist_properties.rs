//! Property tests for the positional skip list
//!
//! Every operation sequence is mirrored on a plain `Vec` and the list is
//! checked against it: order, rank/position duality and link consistency.

use cairn_index::{FxNodeMap, SkipList};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u16, after: Option<usize> },
    Remove { at: usize },
    Move { at: usize, after: Option<usize> },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<u16>(), proptest::option::of(any::<usize>()))
            .prop_map(|(key, after)| Op::Insert { key, after }),
        1 => any::<usize>().prop_map(|at| Op::Remove { at }),
        1 => (any::<usize>(), proptest::option::of(any::<usize>()))
            .prop_map(|(at, after)| Op::Move { at, after }),
    ]
}

fn apply(list: &mut SkipList<u16>, map: &mut FxNodeMap<u16>, model: &mut Vec<u16>, op: &Op) {
    match op {
        Op::Insert { key, after } => {
            if model.contains(key) {
                return;
            }
            let after_key = after.and_then(|i| (!model.is_empty()).then(|| model[i % model.len()]));
            list.insert(map, *key, after_key.as_ref()).unwrap();
            let at = match after_key {
                Some(a) => model.iter().position(|k| *k == a).unwrap() + 1,
                None => 0,
            };
            model.insert(at, *key);
        }
        Op::Remove { at } => {
            if model.is_empty() {
                return;
            }
            let key = model.remove(at % model.len());
            list.remove(map, &key).unwrap();
        }
        Op::Move { at, after } => {
            if model.len() < 2 {
                return;
            }
            let key = model[at % model.len()];
            let after_key = after.map(|i| model[i % model.len()]);
            if after_key == Some(key) {
                assert!(list.move_key(map, &key, after_key.as_ref()).is_err());
                return;
            }
            list.move_key(map, &key, after_key.as_ref()).unwrap();
            model.retain(|k| *k != key);
            let at = match after_key {
                Some(a) => model.iter().position(|k| *k == a).unwrap() + 1,
                None => 0,
            };
            model.insert(at, key);
        }
    }
}

proptest! {
    #[test]
    fn prop_rank_position_duality(ops in prop::collection::vec(op_strategy(), 1..120), seed in any::<u64>()) {
        let mut list = SkipList::with_seed(seed);
        let mut map = FxNodeMap::default();
        let mut model = Vec::new();

        for op in &ops {
            apply(&mut list, &mut map, &mut model, op);
        }

        list.validate(&map).unwrap();
        prop_assert_eq!(list.keys(&map).unwrap(), model.clone());
        for key in &model {
            let position = list.position(&map, key).unwrap();
            prop_assert_eq!(list.access(&map, position as i64).unwrap(), *key);
        }
    }
}

#[test]
fn test_random_workload_stays_consistent() {
    let mut rng = StdRng::seed_from_u64(0xCA1A);
    let mut list = SkipList::with_seed(11);
    let mut map = FxNodeMap::default();
    let mut model = Vec::new();

    for step in 0..5000 {
        let op = match rng.gen_range(0..10) {
            0..=5 => Op::Insert {
                key: rng.gen(),
                after: rng.gen_bool(0.8).then(|| rng.gen()),
            },
            6..=7 => Op::Remove { at: rng.gen() },
            _ => Op::Move {
                at: rng.gen(),
                after: rng.gen_bool(0.8).then(|| rng.gen()),
            },
        };
        apply(&mut list, &mut map, &mut model, &op);
        if step % 500 == 0 {
            list.validate(&map).unwrap();
        }
    }

    list.validate(&map).unwrap();
    assert_eq!(list.keys(&map).unwrap(), model);
    for (i, key) in model.iter().enumerate() {
        assert_eq!(list.position(&map, key).unwrap(), i);
    }
    if !model.is_empty() {
        assert_eq!(list.access(&map, -1).unwrap(), *model.last().unwrap());
    }
}
