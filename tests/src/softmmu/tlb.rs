//! Soft TLB behaviour seen from outside the crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use tcg_core::{
    IdxMap, MemOp, MmuAccessType, MmuIdx, Prot, TlbBits, TARGET_PAGE_BITS, TARGET_PAGE_SIZE,
};
use tcg_softmmu::{
    AddressSpace, CpuTlb, GuestMmu, GuestRam, MmuFault, TlbFlags, TlbLookup, TlbTranslation,
};

const MODES: u8 = 3;
const VPAGES: u64 = 16;
const PPAGES: u64 = 32;

/// Walker over a mutable single-level page table. Unmapped pages are
/// identity-mapped.
#[derive(Default)]
struct Table {
    map: HashMap<u64, u64>,
    walks: usize,
}

impl GuestMmu for Table {
    fn tlb_fill(
        &mut self,
        vaddr: u64,
        _access: MmuAccessType,
        _mmu_idx: MmuIdx,
    ) -> Result<TlbTranslation, MmuFault> {
        self.walks += 1;
        let vpage = vaddr >> TARGET_PAGE_BITS;
        let ppage = self.map.get(&vpage).copied().unwrap_or(vpage);
        Ok(TlbTranslation::page(vaddr, ppage << TARGET_PAGE_BITS, Prot::RWX))
    }
}

fn ram_space(pages: u64) -> (AddressSpace, Arc<GuestRam>) {
    let mut mem = AddressSpace::new();
    let ram = mem.add_ram("ram", 0, pages * TARGET_PAGE_SIZE).unwrap();
    (mem, ram)
}

/// A tiny table so that fills collide and go through the victim TLB.
fn small_bits() -> TlbBits {
    TlbBits {
        min: 2,
        default: 2,
        max: 3,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Fill(u8, u64),
    /// Change the guest mapping without flushing.
    Remap(u64, u64),
    FlushPage(u64),
    FlushMode(u8),
    FlushAll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..MODES, 0..VPAGES).prop_map(|(m, v)| Op::Fill(m, v)),
        2 => (0..VPAGES, 0..PPAGES).prop_map(|(v, p)| Op::Remap(v, p)),
        1 => (0..VPAGES).prop_map(Op::FlushPage),
        1 => (0..MODES).prop_map(Op::FlushMode),
        1 => Just(Op::FlushAll),
    ]
}

proptest! {
    /// A hit always yields the host address of the latest walk for
    /// that (page, mode), until a flush covering it.
    #[test]
    fn hits_match_latest_walk(ops in proptest::collection::vec(op(), 1..96)) {
        let (mem, ram) = ram_space(PPAGES);
        let mut tlb = CpuTlb::new(small_bits());
        let mut table = Table::default();
        // (mode, vpage) -> ppage of the latest walk.
        let mut walked: HashMap<(u8, u64), u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Fill(m, v) => {
                    let before = table.walks;
                    let vaddr = v << TARGET_PAGE_BITS;
                    tlb.fill(MmuIdx(m), vaddr, MmuAccessType::Load, &mut table, &mem).unwrap();
                    if table.walks != before {
                        walked.insert((m, v), table.map.get(&v).copied().unwrap_or(v));
                    }
                }
                Op::Remap(v, p) => {
                    table.map.insert(v, p);
                }
                Op::FlushPage(v) => {
                    tlb.flush_page(v << TARGET_PAGE_BITS);
                    walked.retain(|&(_, wv), _| wv != v);
                }
                Op::FlushMode(m) => {
                    tlb.flush_by_mmuidx(MmuIdx(m).into());
                    walked.retain(|&(wm, _), _| wm != m);
                }
                Op::FlushAll => {
                    tlb.flush();
                    walked.clear();
                }
            }

            for m in 0..MODES {
                for v in 0..VPAGES {
                    let vaddr = (v << TARGET_PAGE_BITS) | 8;
                    if let TlbLookup::Hit(host) =
                        tlb.lookup(MmuIdx(m), vaddr, MemOp::U32, MmuAccessType::Load)
                    {
                        let p = walked.get(&(m, v)).copied();
                        prop_assert!(p.is_some(), "hit on {vaddr:#x} mode {m} without a walk");
                        let expect = ram.host_ptr((p.unwrap() << TARGET_PAGE_BITS) | 8);
                        prop_assert_eq!(host, expect);
                    }
                }
            }
        }
    }
}

#[test]
fn stale_mapping_survives_until_flush() {
    let (mem, ram) = ram_space(PPAGES);
    let mut tlb = CpuTlb::new(TlbBits::default());
    let mut table = Table::default();
    table.map.insert(1, 5);
    tlb.fill(MmuIdx(0), 0x1000, MmuAccessType::Load, &mut table, &mem).unwrap();

    table.map.insert(1, 6);
    assert_eq!(
        tlb.lookup(MmuIdx(0), 0x1004, MemOp::U32, MmuAccessType::Load),
        TlbLookup::Hit(ram.host_ptr(0x5004))
    );

    tlb.flush_page_by_mmuidx(0x1000, IdxMap::from(MmuIdx(0)));
    assert_eq!(
        tlb.lookup(MmuIdx(0), 0x1004, MemOp::U32, MmuAccessType::Load),
        TlbLookup::Miss
    );
    tlb.fill(MmuIdx(0), 0x1000, MmuAccessType::Load, &mut table, &mem).unwrap();
    assert_eq!(
        tlb.lookup(MmuIdx(0), 0x1004, MemOp::U32, MmuAccessType::Load),
        TlbLookup::Hit(ram.host_ptr(0x6004))
    );
}

#[test]
fn unassigned_page_is_mmio() {
    let (mem, _ram) = ram_space(4);
    let mut tlb = CpuTlb::new(TlbBits::default());
    let mut table = Table::default();
    table.map.insert(2, 0x100);
    tlb.fill(MmuIdx(0), 0x2000, MmuAccessType::Load, &mut table, &mem).unwrap();
    assert_eq!(
        tlb.lookup(MmuIdx(0), 0x2010, MemOp::U8, MmuAccessType::Load),
        TlbLookup::Mmio(0x10_0010)
    );
}

#[test]
fn remote_code_protection() {
    let (mem, ram) = ram_space(PPAGES);
    let mut tlb = CpuTlb::new(TlbBits::default());
    let mut table = Table::default();
    tlb.fill(MmuIdx(1), 0x3000, MmuAccessType::Store, &mut table, &mem).unwrap();
    assert!(matches!(
        tlb.lookup(MmuIdx(1), 0x3000, MemOp::U64, MmuAccessType::Store),
        TlbLookup::Hit(_)
    ));

    // Another thread write-protects the page while this one owns the TLB.
    let shared = Arc::clone(tlb.shared());
    let ram2 = Arc::clone(&ram);
    thread::spawn(move || {
        ram2.clear_code_dirty(0x3000);
        shared.reset_dirty_range(ram2.host_ptr(0x3000) as usize, TARGET_PAGE_SIZE as usize);
    })
    .join()
    .unwrap();

    assert_eq!(
        tlb.lookup(MmuIdx(1), 0x3000, MemOp::U64, MmuAccessType::Store),
        TlbLookup::Slow
    );
    let (flags, _) = tlb.probe(MmuIdx(1), 0x3000, MmuAccessType::Store).unwrap();
    assert!(flags.contains(TlbFlags::NOTDIRTY));
    // Other pages and other access kinds are untouched.
    assert!(matches!(
        tlb.lookup(MmuIdx(1), 0x3000, MemOp::U64, MmuAccessType::Load),
        TlbLookup::Hit(_)
    ));
}
