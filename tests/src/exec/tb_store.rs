use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;

use tcg_core::tb::cflags::{CF_NOIRQ, CF_PARALLEL};
use tcg_core::{TbKey, TranslationBlock};
use tcg_exec::{TbInsert, TbStats, TbStore, TbStoreFull};

use super::{run_to_stop, sum_program};
use crate::toy::*;

fn tb(key: &TbKey) -> TranslationBlock {
    TranslationBlock::new(key)
}

// ── Keys ────────────────────────────────────────────────────

#[test]
fn flags_are_part_of_the_key() {
    let store = TbStore::new(8);
    let user = TbKey::new(0x1000, 0x1000, 0, 0);
    let sup = TbKey::new(0x1000, 0x1000, 1, 0);
    let a = store.insert(tb(&user)).unwrap();
    let b = store.insert(tb(&sup)).unwrap();
    assert_eq!(a, TbInsert::Inserted(0));
    assert_eq!(b, TbInsert::Inserted(1));
    assert_eq!(store.lookup(&user), Some(0));
    assert_eq!(store.lookup(&sup), Some(1));
}

#[test]
fn same_virtual_pc_different_physical_page() {
    let store = TbStore::new(8);
    let a = TbKey::new(0x1000, 0x5000, 0, 0);
    let b = TbKey::new(0x1000, 0x6000, 0, 0);
    store.insert(tb(&a)).unwrap();
    assert_eq!(store.lookup(&b), None);
    assert_eq!(store.insert(tb(&b)).unwrap(), TbInsert::Inserted(1));
}

#[test]
fn compile_flags_are_part_of_the_key() {
    let store = TbStore::new(8);
    let normal = TbKey::new(0x1000, 0x1000, 0, CF_PARALLEL);
    let single = TbKey::new(0x1000, 0x1000, 0, CF_PARALLEL | CF_NOIRQ | 1);
    store.insert(tb(&normal)).unwrap();
    assert_eq!(store.lookup(&single), None);
    store.insert(tb(&single)).unwrap();
    assert_eq!(store.count_matching(&normal), 1);
    assert_eq!(store.count_matching(&single), 1);
}

#[test]
fn invalid_block_is_not_found() {
    let store = TbStore::new(8);
    let key = TbKey::new(0x2000, 0x2000, 0, 0);
    store.insert(tb(&key)).unwrap();
    store.get(0).set_invalid();
    assert_eq!(store.lookup(&key), None);
    // Still linked in its bucket until removed; a replacement goes in
    // next to it.
    assert_eq!(store.insert(tb(&key)).unwrap(), TbInsert::Inserted(1));
    assert_eq!(store.lookup(&key), Some(1));
    assert_eq!(store.live(), 1);
    assert_eq!(store.len(), 2);
}

#[test]
fn full_store_reports_capacity() {
    let store = TbStore::new(2);
    store.insert(tb(&TbKey::new(0x0, 0x0, 0, 0))).unwrap();
    store.insert(tb(&TbKey::new(0x4, 0x4, 0, 0))).unwrap();
    let err = store.insert(tb(&TbKey::new(0x8, 0x8, 0, 0))).unwrap_err();
    assert_eq!(err, TbStoreFull(2));
    assert_eq!(err.to_string(), "translation block store full (2 blocks)");
    // An existing key is still answered.
    assert_eq!(
        store.insert(tb(&TbKey::new(0x4, 0x4, 0, 0))),
        Ok(TbInsert::Exists(1))
    );
}

// ── Concurrent publication ──────────────────────────────────

#[test]
fn racing_inserts_publish_one_block() {
    const THREADS: usize = 8;
    let store = Arc::new(TbStore::new(64));
    let key = TbKey::new(0x4000, 0x4000, 0, CF_PARALLEL);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.insert(tb(&key)).unwrap()
            })
        })
        .collect();
    let results: Vec<TbInsert> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let inserted = results
        .iter()
        .filter(|r| matches!(r, TbInsert::Inserted(_)))
        .count();
    assert_eq!(inserted, 1);
    // Every loser was handed the winner.
    assert!(results.iter().all(|r| r.index() == 0));
    assert_eq!(store.count_matching(&key), 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn racing_lookups_during_inserts() {
    let store = Arc::new(TbStore::new(1024));
    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..512u64 {
                store.insert(tb(&TbKey::new(i * 4, i * 4, 0, 0))).unwrap();
            }
        })
    };
    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut seen = 0;
            while seen < 512 {
                let key = TbKey::new(seen * 4, seen * 4, 0, 0);
                if let Some(idx) = store.lookup(&key) {
                    assert_eq!(store.get(idx).pc, seen * 4);
                    seen += 1;
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(store.len(), 512);
}

// ── Model check ─────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u32),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..6u64, 0..2u32).prop_map(|(pc, flags)| Op::Insert(pc, flags)),
        1 => (0..64usize).prop_map(Op::Remove),
    ]
}

fn key_of(pc: u64, flags: u32) -> TbKey {
    TbKey::new(0x1000 + pc * 4, 0x1000 + pc * 4, flags, 0)
}

proptest! {
    /// At most one published block answers any key, and lookups
    /// agree with a map of the live blocks.
    #[test]
    fn one_live_block_per_key(ops in proptest::collection::vec(op(), 1..64)) {
        let store = TbStore::new(128);
        let mut model: HashMap<TbKey, usize> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(pc, flags) => {
                    let key = key_of(pc, flags);
                    let before = store.len();
                    let res = store.insert(tb(&key)).unwrap();
                    match model.get(&key) {
                        Some(&idx) => prop_assert_eq!(res, TbInsert::Exists(idx)),
                        None => {
                            prop_assert_eq!(res, TbInsert::Inserted(before));
                            model.insert(key, before);
                        }
                    }
                }
                Op::Remove(i) => {
                    if i >= store.len() {
                        continue;
                    }
                    let linked = model.values().any(|&idx| idx == i);
                    prop_assert_eq!(store.remove(i), linked);
                    model.retain(|_, idx| *idx != i);
                }
            }

            for pc in 0..6 {
                for flags in 0..2 {
                    let key = key_of(pc, flags);
                    prop_assert!(store.count_matching(&key) <= 1);
                    prop_assert_eq!(store.lookup(&key), model.get(&key).copied());
                }
            }
        }
    }
}

// ── Full flush ──────────────────────────────────────────────

#[test]
fn flush_empties_everything() {
    let m = Machine::single();
    m.load(0x1000, &sum_program(3));
    let mut vcpu = m.vcpu(0x1000);
    run_to_stop(&m, &mut vcpu);
    assert_eq!(m.shared.tb_store.len(), 3);
    assert!(!m.ram.is_code_dirty(0x1000));

    m.shared.flush_all_tbs();
    assert!(m.shared.tb_store.is_empty());
    assert!(m.shared.pages.is_empty());
    assert_eq!(m.shared.tb_store.flush_count(), 1);
    assert_eq!(m.shared.code.used(), 0);
    // Pages that held code are writable again.
    assert!(m.ram.is_code_dirty(0x1000));

    m.shared.flush_all_tbs();
    assert!(m.shared.tb_store.is_empty());
    assert_eq!(m.shared.tb_store.flush_count(), 2);
    assert_eq!(TbStats::get(&m.shared.stats.flushes), 2);
}

#[test]
fn execution_after_flush_retranslates() {
    let m = Machine::single();
    m.load(0x1000, &sum_program(3));
    let mut vcpu = m.vcpu(0x1000);
    run_to_stop(&m, &mut vcpu);
    m.shared.flush_all_tbs();

    vcpu.arch.state.pc = 0x1000;
    run_to_stop(&m, &mut vcpu);
    assert_eq!(vcpu.arch.state.regs[2], 6);
    assert_eq!(vcpu.stats.translations, 6);
    assert_eq!(m.shared.tb_store.len(), 3);
    assert!(!m.ram.is_code_dirty(0x1000));
}

#[test]
fn store_exhaustion_flushes_and_continues() {
    let m = Machine::new(
        "thread=single,tb-size=1,regions=4,max-tbs=4"
            .parse()
            .unwrap(),
    );
    let mut prog = vec![jmp(1); 8];
    prog.push(li(1, 1));
    prog.push(stop());
    m.load(0x1000, &prog);
    let mut vcpu = m.vcpu(0x1000);
    run_to_stop(&m, &mut vcpu);

    assert_eq!(vcpu.arch.state.regs[1], 1);
    assert_eq!(TbStats::get(&m.shared.stats.flushes), 2);
    assert_eq!(TbStats::get(&m.shared.stats.translations), 9);
    assert_eq!(m.shared.tb_store.len(), 1);
}
