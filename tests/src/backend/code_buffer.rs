use tcg_backend::code_buffer::{CodeBuffer, CodeRegions, RegionFull};

fn regions(size: usize, count: usize) -> CodeRegions {
    CodeRegions::new(CodeBuffer::new(size, false).unwrap(), count)
}

#[test]
fn test_emit_and_read() {
    let regs = regions(4096, 1);
    let mut r = regs.claim().unwrap();
    {
        let mut w = regs.writer(&mut r);
        w.emit_u8(0x90).unwrap();
        w.emit_u32(0xDEADBEEF).unwrap();
        assert_eq!(w.offset(), 5);
        w.align(8).unwrap();
        w.emit_u64(1).unwrap();
    }
    assert_eq!(r.offset(), 16);
    let code = regs.buffer().slice(0, 16);
    assert_eq!(code[0], 0x90);
    assert_eq!(&code[1..5], &0xDEADBEEFu32.to_le_bytes());
    assert_eq!(&code[5..8], &[0, 0, 0]);
    assert_eq!(code[8], 1);
}

#[test]
fn test_size_rounded_to_page() {
    let buf = CodeBuffer::new(100, false).unwrap();
    assert!(buf.capacity() >= 4096);
    assert_eq!(buf.capacity() % 4096, 0);
}

#[test]
fn test_executable_mapping() {
    let buf = CodeBuffer::new(4096, true).unwrap();
    assert_eq!(buf.ptr_at(0), buf.base_ptr());
}

#[test]
fn test_regions_disjoint_until_exhausted() {
    let regs = regions(4 * 4096, 4);
    assert_eq!(regs.region_size(), 4096);
    let claimed: Vec<_> = (0..4).map(|_| regs.claim().unwrap()).collect();
    let starts: Vec<_> = claimed.iter().map(|r| r.offset()).collect();
    assert_eq!(starts, vec![0, 4096, 8192, 12288]);
    assert!(regs.claim().is_none());
    assert_eq!(regs.used(), 4);
}

#[test]
fn test_region_full_and_rewind() {
    let regs = regions(2 * 4096, 2);
    let mut r = regs.claim().unwrap();
    let mut w = regs.writer(&mut r);
    w.emit_bytes(&[0xAA; 4000]).unwrap();
    assert_eq!(w.emit_bytes(&[0; 200]), Err(RegionFull));
    assert_eq!(w.remaining(), 96);
    drop(w);
    r.rewind(1000);
    assert_eq!(r.offset(), 1000);
    assert_eq!(r.remaining(), 3096);
}

#[test]
fn test_reset_makes_regions_stale() {
    let regs = regions(2 * 4096, 2);
    let old = regs.claim().unwrap();
    assert!(regs.is_current(&old));
    unsafe { regs.reset() };
    assert!(!regs.is_current(&old));
    assert_eq!(regs.used(), 0);
    let fresh = regs.claim().unwrap();
    assert_eq!(fresh.offset(), 0);
    assert!(regs.is_current(&fresh));
}
