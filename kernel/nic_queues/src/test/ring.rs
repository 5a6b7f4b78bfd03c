use super::*;

fn ring(sim: &Sim) -> DescriptorRing {
    DescriptorRing::new(sim.regs(TXQ_REGS, 0))
}

#[test]
fn allocate_rounds_up_to_powers_of_two() {
    let sim = Sim::new();
    for (requested, expected) in [(1, 1), (2, 2), (3, 4), (10, 16), (1000, 1024), (65536, 65536)] {
        for (stride, expected_stride) in [(16, 16), (17, 32), (48, 64)] {
            let mut r = ring(&sim);
            r.allocate(&sim.dma, requested, stride).unwrap();
            assert_eq!(r.capacity(), expected);
            assert_eq!(r.slot_stride(), expected_stride);
            assert!(r.capacity().is_power_of_two() && r.capacity() >= requested);
            assert_eq!(r.head(), 0);
            assert_eq!(r.tail(), 0);
        }
    }
}

#[test]
fn allocate_rejects_bad_sizes() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    assert_eq!(r.allocate(&sim.dma, 0, 16), Err(QueueError::InvalidSize(0)));
    assert_eq!(r.allocate(&sim.dma, 65537, 16), Err(QueueError::InvalidSize(65537)));
    assert_eq!(r.allocate(&sim.dma, u32::MAX, 16), Err(QueueError::InvalidSize(u32::MAX)));
    assert!(!r.is_allocated());

    r.allocate(&sim.dma, 8, 16).unwrap();
    assert_eq!(r.allocate(&sim.dma, 8, 16), Err(QueueError::AlreadyAllocated));
}

#[test]
fn allocate_reports_allocator_failure() {
    let sim = Sim::new();
    sim.dma.fail_after(0);
    let mut r = ring(&sim);
    assert!(matches!(r.allocate(&sim.dma, 8, 16), Err(QueueError::External(_))));
    assert!(!r.is_allocated());
}

#[test]
fn start_programs_registers_in_order() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    assert_eq!(r.start(3, 2), Err(QueueError::NotAllocated));
    r.allocate(&sim.dma, 10, 64).unwrap();
    r.start(3, 2).unwrap();
    assert!(r.is_active());

    let base = r.phys_addr().unwrap();
    let writes: Vec<(usize, u64)> = sim.ram.writes().iter().map(|w| (w.offset, w.value)).collect();
    let q = Sim::offset(TXQ_REGS, 0);
    let active = (1u64 << 31) | (2 << 8) | 4;
    assert_eq!(writes, vec![
        (q + QUEUE_ACTIVE_LOG_SIZE_REG, 0),
        (q + QUEUE_BASE_ADDR_LO_REG, base.low_u32() as u64),
        (q + QUEUE_BASE_ADDR_HI_REG, base.high_u32() as u64),
        (q + QUEUE_INDEX_REG, 3),
        (q + QUEUE_HEAD_PTR_REG, 0),
        (q + QUEUE_TAIL_PTR_REG, 0),
        (q + QUEUE_ACTIVE_LOG_SIZE_REG, active),
    ]);

    assert_eq!(r.start(3, 2), Err(QueueError::AlreadyActive));
}

#[test]
fn stop_is_idempotent() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    r.allocate(&sim.dma, 4, 16).unwrap();
    r.stop();
    assert_eq!(sim.write_count(TXQ_REGS, 0, QUEUE_ACTIVE_LOG_SIZE_REG), 0);

    r.start(0, 0).unwrap();
    sim.ram.clear_writes();
    r.stop();
    r.stop();
    assert!(!r.is_active());
    assert_eq!(sim.write_count(TXQ_REGS, 0, QUEUE_ACTIVE_LOG_SIZE_REG), 1);
    assert_eq!(sim.last_write(TXQ_REGS, 0, QUEUE_ACTIVE_LOG_SIZE_REG), Some(2));
}

#[test]
fn free_releases_memory() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    r.allocate(&sim.dma, 64, 16).unwrap();
    r.start(0, 0).unwrap();
    assert_eq!(sim.dma.live_allocations(), 1);
    r.free();
    assert!(!r.is_active());
    assert!(!r.is_allocated());
    assert_eq!(r.capacity(), 0);
    assert_eq!(sim.dma.live_allocations(), 0);
    r.allocate(&sim.dma, 64, 16).unwrap();
}

#[test]
fn start_clears_stale_slots() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    r.allocate(&sim.dma, 4, 16).unwrap();
    r.write_entry(1, 0, &Descriptor::new(PhysicalAddress::new(0x1234), 99, 0)).unwrap();
    r.start(0, 0).unwrap();
    let d: Descriptor = r.read_entry(1, 0).unwrap();
    assert_eq!(d.len(), 0);
    assert_eq!(d.addr(), PhysicalAddress::zero());
}

#[test]
fn reconcile_pointer_examples() {
    assert_eq!(reconcile_pointer(0, 0), 0);
    assert_eq!(reconcile_pointer(5, 9), 9);
    assert_eq!(reconcile_pointer(0xFFFF, 2), 0x1_0002);
    assert_eq!(reconcile_pointer(0x1_FFFE, 1), 0x2_0001);
    assert_eq!(reconcile_pointer(u32::MAX, 0), 0);
    assert_eq!(reconcile_pointer(0x1234_5678, 0x5678), 0x1234_5678);
}

#[test]
fn reconcile_pointer_follows_a_random_walk() {
    let mut seed = 0x2545_F491u32;
    let mut device = 0u64;
    let mut sw = 0u32;
    for _ in 0..10_000 {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let step = (seed >> 16) as u64 % 0x8000;
        device += step;
        let next = reconcile_pointer(sw, device as u32 & HW_PTR_MASK);
        assert_eq!(next.wrapping_sub(sw) as u64, step);
        assert_eq!(next, device as u32);
        sw = next;
    }
}

#[test]
fn hardware_pointers_are_reconciled_and_masked() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    r.allocate(&sim.dma, 16, 16).unwrap();
    r.start(0, 0).unwrap();
    let q = Sim::offset(TXQ_REGS, 0);

    r.set_head(0xFFFE);
    sim.ram.poke_u32(q + QUEUE_HEAD_PTR_REG, 3).unwrap();
    assert_eq!(r.read_hw_head(), Ok(0x1_0003));
    assert_eq!(r.head(), 0x1_0003);
    assert_eq!(r.slot(r.head()), 3);

    r.set_tail(0x2_0005);
    sim.ram.poke_u32(q + QUEUE_TAIL_PTR_REG, 0x0007).unwrap();
    assert_eq!(r.read_hw_tail(), Ok(0x2_0007));

    r.set_head(0x3_0010);
    r.write_hw_head().unwrap();
    assert_eq!(sim.last_write(TXQ_REGS, 0, QUEUE_HEAD_PTR_REG), Some(0x0010));
    r.write_hw_tail().unwrap();
    assert_eq!(sim.last_write(TXQ_REGS, 0, QUEUE_TAIL_PTR_REG), Some(0x0007));
}

#[test]
fn entries_stay_within_their_slot() {
    let sim = Sim::new();
    let mut r = ring(&sim);
    assert!(r.read_entry::<Descriptor>(0, 0).is_none());
    r.allocate(&sim.dma, 4, 2 * DESC_SIZE).unwrap();

    let d = Descriptor::new(PhysicalAddress::new(0xAB00), 64, 7);
    r.write_entry(5, 1, &d).unwrap();
    assert!(r.write_entry(5, 2, &d).is_none());
    assert!(r.read_entry::<CompletionRecord>(0, 0).is_some());
    assert!(r.read_entry::<CompletionRecord>(0, 1).is_none());

    // Pointer 5 is slot 1 of 4.
    let back: Descriptor = r.read_entry(1, 1).unwrap();
    assert_eq!(back.addr().value(), 0xAB00);
    assert_eq!(back.len(), 64);
    assert_eq!(back.csum_cmd(), 7);
}
