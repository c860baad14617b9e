use tcg_core::tb::cflags::*;
use tcg_core::tb::*;

fn key(pc: u64) -> TbKey {
    TbKey::new(pc, pc, 0, 0)
}

#[test]
fn tb_new() {
    let tb = TranslationBlock::new(&TbKey::new(0x1000, 0x8000, 3, CF_PARALLEL));
    assert_eq!(tb.pc, 0x1000);
    assert_eq!(tb.phys_pc, 0x8000);
    assert_eq!(tb.flags, 3);
    assert_eq!(tb.size, 0);
    assert_eq!(tb.icount, 0);
    assert_eq!(tb.page_addr, [None, None]);
    assert_eq!(tb.jmp_dest(0), None);
    assert_eq!(tb.jmp_dest(1), None);
    assert!(tb.jmp.lock().unwrap().jmp_list.is_empty());
    assert_eq!(tb.hash_next.load(std::sync::atomic::Ordering::Relaxed), TB_NONE);
    assert!(!tb.is_invalid());
}

#[test]
fn key_drops_unhashed_cflags() {
    // Bits outside CF_HASH_MASK do not change the key.
    let a = TbKey::new(0x1000, 0x1000, 0, CF_PARALLEL | 0x8000_0000);
    let b = TbKey::new(0x1000, 0x1000, 0, CF_PARALLEL);
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
}

#[test]
fn key_hash_in_range() {
    for pc in [0u64, 0x1000, 0xFFFF_FFFF, 0xFFFF_FFFF_FFFF_FFFF] {
        assert!(TbKey::new(pc, pc, 7, CF_NOIRQ | 1).hash() < TB_HASH_SIZE);
    }
}

#[test]
fn key_distinguishes_flags_and_phys() {
    let user = TbKey::new(0x1000, 0x1000, 0, 0);
    let sup = TbKey::new(0x1000, 0x1000, 1, 0);
    let other_phys = TbKey::new(0x1000, 0x5000, 0, 0);
    assert_ne!(user, sup);
    assert_ne!(user, other_phys);

    let tb = TranslationBlock::new(&user);
    assert!(tb.matches(&user));
    assert!(!tb.matches(&sup));
    assert!(!tb.matches(&other_phys));
    tb.set_invalid();
    assert!(!tb.matches(&user));
}

#[test]
fn jmp_slot_link_reset() {
    let tb = TranslationBlock::new(&key(0x1000));
    assert!(tb.try_set_jmp_dest(0, 7));
    assert_eq!(tb.jmp_dest(0), Some(7));
    // Linked slots are not relinked.
    assert!(!tb.try_set_jmp_dest(0, 9));
    assert_eq!(tb.jmp_dest(1), None);

    tb.reset_jmp_dest(0);
    assert_eq!(tb.jmp_dest(0), None);
    assert!(tb.try_set_jmp_dest(0, 0));
    assert_eq!(tb.jmp_dest(0), Some(0));
}

#[test]
fn jmp_slot_poison() {
    let tb = TranslationBlock::new(&key(0x1000));
    assert!(tb.try_set_jmp_dest(1, 4));
    assert_eq!(tb.poison_jmp_dest(1), Some(4));
    assert_eq!(tb.jmp_dest(1), None);
    // A poisoned slot stays unlinkable, even after a reset.
    assert!(!tb.try_set_jmp_dest(1, 5));
    tb.reset_jmp_dest(1);
    assert!(!tb.try_set_jmp_dest(1, 5));
    assert_eq!(tb.poison_jmp_dest(0), None);
}

#[test]
fn overlaps_single_page() {
    let mut tb = TranslationBlock::new(&TbKey::new(0x2100, 0x2100, 0, 0));
    tb.size = 0x20;
    tb.page_addr = [Some(0x2000), None];
    assert!(tb.overlaps_phys(0x2100, 0x2101));
    assert!(tb.overlaps_phys(0x211f, 0x2120));
    assert!(tb.overlaps_phys(0x2000, 0x3000));
    assert!(!tb.overlaps_phys(0x2120, 0x2200));
    assert!(!tb.overlaps_phys(0x20f0, 0x2100));
}

#[test]
fn overlaps_second_page() {
    // 0x10 bytes on the first page, 0x10 on a discontiguous second.
    let mut tb = TranslationBlock::new(&TbKey::new(0x1ff0, 0x4ff0, 0, 0));
    tb.size = 0x20;
    tb.page_addr = [Some(0x4000), Some(0x9000)];
    assert!(tb.overlaps_phys(0x4ffc, 0x5000));
    assert!(tb.overlaps_phys(0x9008, 0x9009));
    assert!(!tb.overlaps_phys(0x9010, 0x9020));
    // The physically adjacent page is not part of the TB.
    assert!(!tb.overlaps_phys(0x5000, 0x5010));
    let pages: Vec<_> = tb.pages().collect();
    assert_eq!(pages, vec![(0, 0x4000), (1, 0x9000)]);
}

#[test]
fn max_insns_from_cflags() {
    assert_eq!(TranslationBlock::max_insns(0), TB_MAX_INSNS);
    assert_eq!(TranslationBlock::max_insns(1 | CF_NOIRQ), 1);
    assert_eq!(TranslationBlock::max_insns(32 | CF_PARALLEL), 32);
}

// ── Jump cache ──────────────────────────────────────────────

#[test]
fn jump_cache_insert_lookup() {
    let mut jc = JumpCache::new();
    assert_eq!(jc.lookup(0x1000), None);
    jc.insert(0x1000, 3);
    assert_eq!(jc.lookup(0x1000), Some(3));
    // Same slot, different PC: the stored PC tells them apart.
    let alias = 0x1000 + ((TB_JMP_CACHE_SIZE as u64) << 2);
    assert_eq!(jc.lookup(alias), None);
    jc.insert(alias, 4);
    assert_eq!(jc.lookup(0x1000), None);
    jc.remove(alias);
    assert_eq!(jc.lookup(alias), None);
}

#[test]
fn jump_cache_invalidate_page() {
    let mut jc = JumpCache::new();
    jc.insert(0x0ff8, 1);
    jc.insert(0x1008, 2);
    jc.insert(0x2008, 3);
    jc.invalidate_page(0x1abc);
    // The previous page may spill into the flushed one.
    assert_eq!(jc.lookup(0x0ff8), None);
    assert_eq!(jc.lookup(0x1008), None);
    assert_eq!(jc.lookup(0x2008), Some(3));
    jc.invalidate();
    assert_eq!(jc.lookup(0x2008), None);
}
