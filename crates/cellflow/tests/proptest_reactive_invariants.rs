//! Property-based invariant tests for the reactive graph.
//!
//! These tests verify invariants that must hold for **any** sequence of
//! writes:
//!
//! 1. Writing the current value never notifies or bumps the version.
//! 2. Version counts exactly the writes that changed the value.
//! 3. A tracked evaluation records each distinct cell read exactly once.
//! 4. Inside a transaction each written cell is delivered once, in first-write
//!    order, and only if some write changed it.
//! 5. A computed recomputes at most once per read, and its value always
//!    matches a direct evaluation over the current inputs.
//! 6. Dependency sets match the cells the last evaluation actually read.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cellflow::{Computed, Listenable, Listener, Observable, Runtime, Transaction, track};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

const CELLS: usize = 6;

/// (cell index, value) writes over a small value domain so repeats are common.
fn writes() -> impl Strategy<Value = Vec<(usize, i8)>> {
    proptest::collection::vec((0..CELLS, -3i8..=3), 0..60)
}

fn cells() -> Vec<Observable<i8>> {
    (0..CELLS).map(|_| Observable::new(0)).collect()
}

// ═════════════════════════════════════════════════════════════════════════
// 1–2. No-op assignment and version accounting
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn version_counts_only_changing_writes(values in proptest::collection::vec(-3i8..=3, 0..80)) {
        Runtime::scope(|| {
            let cell = Observable::new(0i8);
            let hits = Rc::new(Cell::new(0u64));
            let h = Rc::clone(&hits);
            let _sub = cell.listen(Listener::new(move || h.set(h.get() + 1)));

            let mut model = 0i8;
            let mut changes = 0u64;
            for v in values {
                if v != model {
                    changes += 1;
                    model = v;
                }
                cell.set(v);
            }
            prop_assert_eq!(cell.version(), changes);
            prop_assert_eq!(hits.get(), changes);
            prop_assert_eq!(cell.get(), model);
            Ok(())
        })?;
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Tracking records distinct reads
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn tracking_deduplicates_reads(reads in proptest::collection::vec(0..CELLS, 0..40)) {
        Runtime::scope(|| {
            let cells = cells();
            let ((), deps) = track(|| {
                for &i in &reads {
                    let _ = cells[i].get();
                }
            });

            let mut expected: Vec<usize> = Vec::new();
            for &i in &reads {
                if !expected.contains(&i) {
                    expected.push(i);
                }
            }
            prop_assert_eq!(deps.len(), expected.len());
            let ids: Vec<_> = deps.ids().collect();
            let expected_ids: Vec<_> = expected.iter().map(|&i| cells[i].id()).collect();
            prop_assert_eq!(ids, expected_ids);
            Ok(())
        })?;
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Transactions deliver once per changed cell
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn transaction_delivers_each_changed_cell_once(ops in writes()) {
        Runtime::scope(|| {
            let cells = cells();
            let log = Rc::new(RefCell::new(Vec::new()));
            let _subs: Vec<_> = cells
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let log = Rc::clone(&log);
                    cell.listen(Listener::new(move || log.borrow_mut().push(i)))
                })
                .collect();

            let mut model = [0i8; CELLS];
            let mut expected: Vec<usize> = Vec::new();
            Transaction::run(|| {
                for &(i, v) in &ops {
                    if model[i] != v {
                        model[i] = v;
                        if !expected.contains(&i) {
                            expected.push(i);
                        }
                    }
                    cells[i].set(v);
                }
            });

            prop_assert_eq!(&*log.borrow(), &expected);
            for (cell, want) in cells.iter().zip(model) {
                prop_assert_eq!(cell.get(), want);
            }
            prop_assert!(!Transaction::in_batch());
            Ok(())
        })?;
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5–6. Computed freshness, laziness, and dependency sets
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn computed_matches_direct_evaluation(
        ops in writes(),
        read_every in 1usize..8,
        batched in any::<bool>(),
    ) {
        Runtime::scope(|| {
            let cells = cells();
            let runs = Rc::new(Cell::new(0u32));
            let (cs, r) = (cells.clone(), Rc::clone(&runs));
            // Reads cell 0 to pick which half of the remaining cells to sum.
            let derived = Computed::new(move || {
                r.set(r.get() + 1);
                let pick = cs[0].get() >= 0;
                cs[1..]
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (i % 2 == 0) == pick)
                    .map(|(_, c)| i32::from(c.get()))
                    .sum::<i32>()
            });
            let direct = |cells: &[Observable<i8>]| -> i32 {
                let pick = cells[0].get_untracked() >= 0;
                cells[1..]
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (i % 2 == 0) == pick)
                    .map(|(_, c)| i32::from(c.get_untracked()))
                    .sum()
            };

            for chunk in ops.chunks(read_every) {
                let apply = || {
                    for &(i, v) in chunk {
                        cells[i].set(v);
                    }
                };
                if batched {
                    Transaction::run(apply);
                } else {
                    apply();
                }

                let before = runs.get();
                let value = derived.get();
                let after = runs.get();
                prop_assert!(after - before <= 1);
                prop_assert_eq!(value, direct(cells.as_slice()));

                let again = derived.get();
                prop_assert_eq!(runs.get(), after);
                prop_assert_eq!(again, value);

                let deps = derived.dependencies();
                let pick = cells[0].get_untracked() >= 0;
                prop_assert!(deps.contains(cells[0].id()));
                for (i, cell) in cells[1..].iter().enumerate() {
                    prop_assert_eq!(deps.contains(cell.id()), (i % 2 == 0) == pick);
                }
                for (i, cell) in cells.iter().enumerate() {
                    prop_assert_eq!(cell.listener_count(), usize::from(deps.contains(cell.id())), "cell {}", i);
                }
            }
            Ok(())
        })?;
    }
}
