//! Property-based convergence tests.
//!
//! Generates random concurrent insert/delete workloads across several replicas
//! and random delivery interleavings, then checks that every replica computes
//! the identical visible sequence once all operations have been applied.

use doc_sync::{Doc, Operation};
use proptest::prelude::*;

const REPLICAS: usize = 3;

/// One scripted local edit on one replica.
#[derive(Debug, Clone)]
struct Edit {
    replica: usize,
    position: usize,
    insert: Option<char>,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    (0..REPLICAS, 0..64usize, proptest::option::of(proptest::char::range('a', 'z'))).prop_map(
        |(replica, position, insert)| Edit {
            replica,
            position,
            insert,
        },
    )
}

/// Runs the script on isolated replicas, then delivers every operation to
/// every other replica in an order derived from `shuffle_seed`.
fn run_script(script: Vec<Edit>, shuffle_seed: u64) -> Vec<String> {
    let mut docs: Vec<Doc> = (0..REPLICAS).map(|i| Doc::new(i as u64 + 1)).collect();
    let mut produced: Vec<Vec<Operation>> = vec![Vec::new(); REPLICAS];

    for edit in script {
        let doc = &mut docs[edit.replica];
        match edit.insert {
            Some(ch) => {
                let pos = edit.position % (doc.visible_len() + 1);
                produced[edit.replica].push(doc.local_insert(pos, ch));
            }
            None => {
                if doc.visible_len() > 0 {
                    let pos = edit.position % doc.visible_len();
                    produced[edit.replica].extend(doc.local_delete(pos..pos + 1));
                }
            }
        }
    }

    // Flatten and pseudo-shuffle with a deterministic LCG so every run of the
    // same case explores the same interleaving.
    let mut all_ops: Vec<Operation> = produced.into_iter().flatten().collect();
    let mut state = shuffle_seed | 1;
    for i in (1..all_ops.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        all_ops.swap(i, j);
    }

    for doc in docs.iter_mut() {
        for op in &all_ops {
            doc.apply(op.clone()).unwrap();
        }
    }

    docs.iter().map(|d| d.text()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_replicas_converge(
        script in proptest::collection::vec(edit_strategy(), 1..40),
        shuffle_seed in any::<u64>(),
    ) {
        let texts = run_script(script, shuffle_seed);
        prop_assert_eq!(&texts[1], &texts[0]);
        prop_assert_eq!(&texts[2], &texts[0]);
    }

    #[test]
    fn prop_interleaving_is_irrelevant(
        script in proptest::collection::vec(edit_strategy(), 1..30),
        seed_a in any::<u64>(),
        seed_b in any::<u64>(),
    ) {
        // The same operation set delivered in two different orders must land
        // on the same text.
        let texts_a = run_script(script.clone(), seed_a);
        let texts_b = run_script(script, seed_b);
        prop_assert_eq!(texts_a, texts_b);
    }

    #[test]
    fn prop_double_delivery_is_idempotent(
        script in proptest::collection::vec(edit_strategy(), 1..30),
        shuffle_seed in any::<u64>(),
    ) {
        let mut source = Doc::new(1);
        let mut ops = Vec::new();
        for edit in &script {
            match edit.insert {
                Some(ch) => {
                    let pos = edit.position % (source.visible_len() + 1);
                    ops.push(source.local_insert(pos, ch));
                }
                None if source.visible_len() > 0 => {
                    let pos = edit.position % source.visible_len();
                    ops.extend(source.local_delete(pos..pos + 1));
                }
                None => {}
            }
        }

        let mut once = Doc::new(2);
        let mut twice = Doc::new(3);
        let _ = shuffle_seed;
        for op in &ops {
            once.apply(op.clone()).unwrap();
            twice.apply(op.clone()).unwrap();
            twice.apply(op.clone()).unwrap();
        }
        prop_assert_eq!(once.text(), twice.text());
        prop_assert_eq!(once.text(), source.text());
    }
}
