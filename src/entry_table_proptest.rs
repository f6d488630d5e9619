#![cfg(test)]

// Property tests for EntryTable kept inside the crate so they can reach the
// crate-private table.

use crate::entry_table::{EntryTable, Handle};
use proptest::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

fn hash_of(s: &str) -> u64 {
    let mut h = DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// Pool-indexed operations so shrinking moves toward earlier keys.
#[derive(Clone, Debug)]
enum Op {
    // Detach any linked row for the key, then link a fresh one.
    Replace(usize, i32),
    Detach(usize),
    RemoveLinked(usize),
    // Remove the oldest detached row still waiting for cleanup.
    RemoveDetached,
    Find(usize),
    Iterate,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::btree_set("[a-z]{0,4}", 1..=6).prop_flat_map(|pool| {
        let pool: Vec<String> = pool.into_iter().collect();
        let idx = 0..pool.len();
        let op = prop_oneof![
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Replace(i, v)),
            idx.clone().prop_map(Op::Detach),
            idx.clone().prop_map(Op::RemoveLinked),
            Just(Op::RemoveDetached),
            idx.clone().prop_map(Op::Find),
            Just(Op::Iterate),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Property: the table agrees with a model of linked rows plus a list of
// detached rows awaiting removal.
// Invariants exercised:
// - `find` resolves exactly the linked row for a key.
// - `len` counts linked rows; detached rows keep their slots and values.
// - Removing a detached row never disturbs the linked row for the same key.
// - Removed handles never resolve again.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_linked_and_detached_rows((pool, ops) in arb_scenario()) {
        let mut sut: EntryTable<String, i32> = EntryTable::with_capacity(0);
        let mut linked: HashMap<String, (Handle, i32)> = HashMap::new();
        let mut detached: Vec<(Handle, i32)> = Vec::new();
        let mut removed: Vec<Handle> = Vec::new();

        for op in ops {
            match op {
                Op::Replace(i, v) => {
                    let k = pool[i].clone();
                    if let Some((old, old_v)) = linked.remove(&k) {
                        prop_assert!(sut.detach(old));
                        detached.push((old, old_v));
                    }
                    let h = sut.insert_unique_with(hash_of(&k), k.clone(), |_, _| v);
                    linked.insert(k, (h, v));
                }
                Op::Detach(i) => {
                    let k = &pool[i];
                    match linked.remove(k) {
                        Some((h, v)) => {
                            prop_assert!(sut.detach(h));
                            prop_assert!(!sut.is_linked(h));
                            detached.push((h, v));
                        }
                        None => {
                            prop_assert!(sut.find(hash_of(k), k.as_str()).is_none());
                        }
                    }
                }
                Op::RemoveLinked(i) => {
                    let k = &pool[i];
                    if let Some((h, v)) = linked.remove(k) {
                        let (rk, rv) = sut.remove(h).expect("linked row present");
                        prop_assert_eq!(&rk, k);
                        prop_assert_eq!(rv, v);
                        removed.push(h);
                    }
                }
                Op::RemoveDetached => {
                    if !detached.is_empty() {
                        let (h, v) = detached.remove(0);
                        let (_, rv) = sut.remove(h).expect("detached row present");
                        prop_assert_eq!(rv, v);
                        removed.push(h);
                    }
                }
                Op::Find(i) => {
                    let k = &pool[i];
                    let found = sut.find(hash_of(k), k.as_str());
                    prop_assert_eq!(found, linked.get(k).map(|(h, _)| *h));
                }
                Op::Iterate => {
                    let seen: BTreeSet<String> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                    let expected: BTreeSet<String> = linked.keys().cloned().collect();
                    prop_assert_eq!(seen, expected);
                }
            }

            prop_assert_eq!(sut.len(), linked.len());
            prop_assert_eq!(sut.slot_count(), linked.len() + detached.len());
            for (h, v) in &detached {
                prop_assert_eq!(sut.value(*h), Some(v));
            }
            for h in &removed {
                prop_assert!(sut.value(*h).is_none());
            }
        }
    }
}
