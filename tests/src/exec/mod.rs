//! End-to-end tests of the execution loop on the toy guest.

mod tb_store;

use tcg_core::cpu::{EXCP_DEBUG, EXCP_HALTED, EXCP_HLT, EXCP_INTERRUPT, EXCP_YIELD};
use tcg_core::tb::cflags::CF_PARALLEL;
use tcg_core::{CpuInterrupt, Prot, TbKey};
use tcg_exec::{run, TbStats, Vcpu};

use crate::toy::*;

const HANDLER: u64 = 0x8000;

/// Run until the guest stops, passing over engine exits.
pub(crate) fn run_to_stop(m: &Machine, vcpu: &mut Vcpu<ToyCpu>) {
    for _ in 0..1000 {
        match run(&m.shared, vcpu) {
            EXCP_DEBUG => return,
            EXCP_HALTED => panic!("vCPU halted at {:#x}", vcpu.arch.state.pc),
            _ => {}
        }
    }
    panic!("guest did not stop (pc {:#x})", vcpu.arch.state.pc);
}

/// `r2 = 1 + 2 + .. + n` at 0x1000; the loop body starts at 0x100c.
pub(crate) fn sum_program(n: i32) -> Vec<u32> {
    vec![
        li(1, 0),
        li(2, 0),
        li(3, n),
        addi(1, 1, 1),
        add(2, 1),
        bne(1, 3, -2),
        stop(),
    ]
}

// ── Basic execution ─────────────────────────────────────────

#[test]
fn straight_line_block() {
    let m = Machine::single();
    m.load(0x1000, &[li(1, 5), addi(1, 1, 2), stop()]);
    let mut vcpu = m.vcpu(0x1000);
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_DEBUG);
    assert_eq!(vcpu.arch.state.regs[1], 7);
    assert_eq!(vcpu.arch.state.pc, 0x100c);
    assert_eq!(vcpu.stats.translations, 1);
    assert_eq!(m.shared.tb_store.len(), 1);

    let tb = m.shared.tb_store.get(0);
    assert_eq!(tb.size, 12);
    assert_eq!(tb.icount, 3);
    assert_eq!(tb.page_addr, [Some(0x1000), None]);
    // The page now holds code and is write-protected.
    assert!(m.shared.pages.is_code(0x1000));
    assert!(!m.ram.is_code_dirty(0x1000));
}

#[test]
fn loop_chains_back_edge() {
    let m = Machine::single();
    m.load(0x1000, &sum_program(10));
    let mut vcpu = m.vcpu(0x1000);
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_DEBUG);
    assert_eq!(vcpu.arch.state.regs[2], 55);

    // Prologue, loop body, exit block.
    assert_eq!(TbStats::get(&m.shared.stats.translations), 3);
    assert!(vcpu.stats.chained >= 8, "chained {}", vcpu.stats.chained);
    // prologue -> body, body -> body, body -> exit.
    assert_eq!(TbStats::get(&m.shared.stats.links), 3);
    let body = m.shared.tb_store.lookup(&TbKey::new(0x100c, 0x100c, 0, m.shared.curr_cflags()));
    let body = m.shared.tb_store.get(body.unwrap());
    assert!(body.jmp_dest(0).is_some());
    assert!(body.jmp_dest(1).is_some());
}

#[test]
fn second_vcpu_reuses_blocks() {
    let m = Machine::single();
    m.load(0x1000, &sum_program(4));
    let mut a = m.vcpu(0x1000);
    run_to_stop(&m, &mut a);
    let mut b = m.vcpu(0x1000);
    run_to_stop(&m, &mut b);
    assert_eq!(b.arch.state.regs[2], 10);
    assert_eq!(b.stats.translations, 0);
    assert!(b.stats.hash_hits > 0);
    assert_eq!(m.shared.tb_store.len(), 3);
}

#[test]
fn mode_selects_distinct_blocks() {
    let m = Machine::single();
    m.load(0x1000, &[li(1, 1), stop()]);
    let mut user = m.vcpu(0x1000);
    run_to_stop(&m, &mut user);
    let mut sup = m.vcpu(0x1000);
    sup.arch.state.mode = 1;
    run_to_stop(&m, &mut sup);

    let cf = m.shared.curr_cflags();
    let a = m.shared.tb_store.lookup(&TbKey::new(0x1000, 0x1000, 0, cf));
    let b = m.shared.tb_store.lookup(&TbKey::new(0x1000, 0x1000, 1, cf));
    assert!(a.is_some() && b.is_some());
    assert_ne!(a, b);
    assert_eq!(m.shared.tb_store.len(), 2);
    assert_eq!(m.shared.pages.tb_count(0x1000), 2);
}

#[test]
fn parallel_flag_follows_thread_mode() {
    let single = Machine::single();
    assert_eq!(single.shared.curr_cflags() & CF_PARALLEL, 0);
    let multi = Machine::multi();
    multi.load(0x1000, &[stop()]);
    let mut vcpu = multi.vcpu(0x1000);
    run_to_stop(&multi, &mut vcpu);
    assert_ne!(multi.shared.tb_store.get(0).cflags & CF_PARALLEL, 0);
}

#[test]
fn one_insn_per_tb() {
    let m = Machine::new(
        "thread=single,tb-size=1,regions=4,one-insn-per-tb=on"
            .parse()
            .unwrap(),
    );
    m.load(0x1000, &[li(1, 1), li(2, 2), stop()]);
    let mut vcpu = m.vcpu(0x1000);
    run_to_stop(&m, &mut vcpu);
    assert_eq!(vcpu.arch.state.regs[2], 2);
    assert_eq!(m.shared.tb_store.len(), 3);
    for i in 0..m.shared.tb_store.len() {
        assert_eq!(m.shared.tb_store.get(i).icount, 1);
    }
}

#[test]
fn indirect_jump_not_chained() {
    let m = Machine::single();
    m.load(0x1000, &[li(5, 0x1100), jr(5)]);
    m.load(0x1100, &[li(1, 3), stop()]);
    let mut vcpu = m.vcpu(0x1000);
    run_to_stop(&m, &mut vcpu);
    assert_eq!(vcpu.arch.state.regs[1], 3);
    assert_eq!(TbStats::get(&m.shared.stats.links), 0);
}

// ── Guest exceptions ────────────────────────────────────────

#[test]
fn trap_and_return() {
    let m = Machine::single();
    m.load(0x1000, &[trap(), li(1, 1), stop()]);
    m.load(HANDLER, &[addi(9, 9, 1), eret()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;
    run_to_stop(&m, &mut vcpu);

    let st = &vcpu.arch.state;
    assert_eq!(st.cause, EXC_TRAP as u64);
    assert_eq!(st.epc, 0x1004);
    assert_eq!(st.regs[9], 1);
    assert_eq!(st.regs[1], 1);
    assert_eq!(st.mode, 0);
    assert_eq!(vcpu.stats.exceptions, 1);
    // The handler ran in supervisor mode: its TB is keyed with flags 1.
    let cf = m.shared.curr_cflags();
    assert!(m.shared.tb_store.lookup(&TbKey::new(HANDLER, HANDLER, 1, cf)).is_some());
}

#[test]
fn fetch_from_non_executable_page() {
    let m = Machine::single();
    m.load(0x1000, &[jmp(0x800)]);
    m.load(HANDLER, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;
    vcpu.arch
        .mmu
        .lock()
        .unwrap()
        .insert(0x3000, (0x3000, Prot::READ | Prot::WRITE));
    run_to_stop(&m, &mut vcpu);

    let st = &vcpu.arch.state;
    assert_eq!(st.cause, EXC_FETCH as u64);
    assert_eq!(st.epc, 0x3000);
    assert_eq!(st.badvaddr, 0x3000);
    assert_eq!(m.shared.tb_store.len(), 2);
}

#[test]
fn fetch_outside_ram() {
    let m = Machine::single();
    let target = RAM_SIZE as u32 * 2;
    m.load(0x1000, &[li32(5, target)[0], li32(5, target)[1], jr(5)]);
    m.load(HANDLER, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;
    run_to_stop(&m, &mut vcpu);

    let st = &vcpu.arch.state;
    assert_eq!(st.cause, EXC_FETCH as u64);
    assert_eq!(st.epc, target as u64);
    assert_eq!(st.badvaddr, target as u64);
}

#[test]
fn undecodable_instruction() {
    let m = Machine::single();
    m.load(0x1000, &[li(1, 1), 0xff00_0000]);
    m.load(HANDLER, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;
    run_to_stop(&m, &mut vcpu);

    let st = &vcpu.arch.state;
    assert_eq!(st.regs[1], 1);
    assert_eq!(st.cause, EXC_ILLEGAL as u64);
    assert_eq!(st.epc, 0x1004);
    // The good prefix became a block of its own.
    assert_eq!(m.shared.tb_store.get(0).icount, 1);
}

#[test]
fn load_from_unreadable_page() {
    let m = Machine::single();
    m.load(0x1000, &[li(1, 9), lw(1, 0, 0x4000), stop()]);
    m.load(HANDLER, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;
    vcpu.arch.mmu.lock().unwrap().insert(0x4000, (0x4000, Prot::EXEC));
    run_to_stop(&m, &mut vcpu);

    let st = &vcpu.arch.state;
    assert_eq!(st.cause, EXC_LOAD as u64);
    assert_eq!(st.epc, 0x1004);
    assert_eq!(st.badvaddr, 0x4000);
    // The faulting load did not write its destination.
    assert_eq!(st.regs[1], 9);
}

#[test]
fn load_store_through_remapped_page() {
    let m = Machine::single();
    // Virtual 0x5000 is backed by physical 0x9000.
    m.load(
        0x1000,
        &[li(1, 0x77), sw(1, 0, 0x5010), lw(2, 0, 0x5010), lb(3, 0, 0x5010), stop()],
    );
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.mmu.lock().unwrap().insert(0x5000, (0x9000, Prot::RWX));
    run_to_stop(&m, &mut vcpu);
    assert_eq!(m.read_u32(0x9010), 0x77);
    assert_eq!(vcpu.arch.state.regs[2], 0x77);
    assert_eq!(vcpu.arch.state.regs[3], 0x77);
}

// ── Interrupts and halting ──────────────────────────────────

#[test]
fn wfi_halts_until_interrupt() {
    let m = Machine::single();
    m.load(0x1000, &[ei(), wfi(), li(1, 1), stop()]);
    m.load(HANDLER, &[li(7, 7), eret()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;

    assert_eq!(run(&m.shared, &mut vcpu), EXCP_HLT);
    assert!(vcpu.handle.is_halted());
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_HALTED);

    vcpu.handle.interrupt(CpuInterrupt::HARD);
    run_to_stop(&m, &mut vcpu);
    let st = &vcpu.arch.state;
    assert!(!vcpu.handle.is_halted());
    assert_eq!(st.cause, EXC_IRQ as u64);
    assert_eq!(st.epc, 0x1008);
    assert_eq!(st.regs[7], 7);
    assert_eq!(st.regs[1], 1);
    assert_eq!(vcpu.stats.interrupts, 1);
    assert!(vcpu.handle.interrupt_request().is_empty());
}

#[test]
fn masked_interrupt_waits_for_enable() {
    let m = Machine::single();
    m.load(0x1000, &[li(1, 1), ei(), li(2, 2), stop()]);
    m.load(HANDLER, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.arch.state.vector = HANDLER;

    vcpu.handle.interrupt(CpuInterrupt::HARD);
    // The kick makes the loop return before any TB runs.
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_INTERRUPT);
    assert_eq!(vcpu.stats.tbs_executed, 0);

    run_to_stop(&m, &mut vcpu);
    let st = &vcpu.arch.state;
    assert_eq!(st.cause, EXC_IRQ as u64);
    assert_eq!(st.epc, 0x1008);
    assert_eq!(st.regs[1], 1);
    assert_eq!(st.regs[2], 0);
}

#[test]
fn halt_request_stops_loop() {
    let m = Machine::single();
    m.load(0x1000, &[stop()]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.handle.interrupt(CpuInterrupt::HALT);
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_HLT);
    assert!(vcpu.handle.is_halted());
    assert!(!vcpu.handle.interrupt_request().contains(CpuInterrupt::HALT));
}

#[test]
fn timeslice_expiry_yields() {
    let m = Machine::new(
        "thread=single,tb-size=1,regions=4,rr-timeslice=4"
            .parse()
            .unwrap(),
    );
    m.load(0x1000, &[jmp(0)]);
    let mut vcpu = m.vcpu(0x1000);
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_YIELD);
    assert_eq!(vcpu.stats.tbs_executed, 4);
    // The self-link is followed once more before the expiry check.
    assert_eq!(vcpu.stats.chained, 3);
    // A fresh slice allows four more.
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_YIELD);
    assert_eq!(vcpu.stats.tbs_executed, 8);
}

#[test]
fn kick_before_entry_returns_interrupt() {
    let m = Machine::multi();
    m.load(0x1000, &[addi(1, 1, 1), jmp(-1)]);
    let mut vcpu = m.vcpu(0x1000);
    vcpu.handle.kick();
    assert_eq!(run(&m.shared, &mut vcpu), EXCP_INTERRUPT);
    assert_eq!(vcpu.arch.state.regs[1], 0);
    assert!(!vcpu.handle.exit_requested());
}
