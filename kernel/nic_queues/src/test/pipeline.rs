//! Interrupt to event queue to dispatcher to ring, end to end.

use super::*;
use deferred_interrupt_tasks::InterruptSource;
use nic_buffers::{DmaAllocator, DmaReceiveBufferProvider};

fn send(sim: &Sim, tx: &Arc<TxRing>, count: usize) -> Arc<Tracker> {
    let tracker = Tracker::new();
    for _ in 0..count {
        tx.enqueue(TestPacket::boxed(&tracker)).unwrap();
    }
    tx.post().unwrap();
    assert_eq!(sim.last_write(TXQ_REGS, tx.index(), QUEUE_HEAD_PTR_REG), Some(tx.head()));
    tracker
}

/// The device finishes TX slots `ptrs` on CQ 0 and raises one event per completion.
fn transmit_done(sim: &Sim, ptrs: &[u16]) {
    for &ptr in ptrs {
        sim.post_completion(0, CompletionRecord::new(0, ptr, 0));
        sim.post_event(0, EVENT_TYPE_TX_CPL, 0);
    }
}

#[test]
fn tx_completions_flow_through_the_dispatcher() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 4);
    let dispatcher = Dispatcher::new(8, 64);
    let (tx, cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 10, 1);
    let tracker = send(&sim, &tx, 3);
    sim.ram.clear_writes();

    transmit_done(&sim, &[0, 1, 2]);
    assert!(irq.fire());
    // Scheduled once, not yet processed.
    assert!(cq.is_scheduled());
    assert_eq!(tx.clean_tail(), 0);
    assert_eq!(sim.last_write(EQ_REGS, 0, QUEUE_INDEX_REG), Some(irq.index() | QUEUE_ARM_MASK));

    assert_eq!(dispatcher.run_until_idle(), 1);
    assert_eq!(tx.clean_tail(), 3);
    assert_eq!(tracker.live(), 0);
    assert!(!cq.is_scheduled());
    assert_eq!(sim.write_count(CQ_REGS, 0, QUEUE_INDEX_REG), 1);
    assert_eq!(sim.last_write(CQ_REGS, 0, QUEUE_INDEX_REG), Some(QUEUE_ARM_MASK));
    assert!(!dispatcher.poll_once());
}

#[test]
fn gaps_hold_back_clean_tail() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 16);
    let dispatcher = Dispatcher::new(8, 64);
    let (tx, _cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 16, 1);
    let _tracker = send(&sim, &tx, 3);

    transmit_done(&sim, &[1, 2]);
    irq.fire();
    dispatcher.run_until_idle();
    assert_eq!(tx.clean_tail(), 0);
    assert_eq!(tx.owned_count(), 1);

    transmit_done(&sim, &[0]);
    irq.fire();
    dispatcher.run_until_idle();
    assert_eq!(tx.clean_tail(), 3);
}

#[test]
fn busy_queues_are_requeued_until_drained() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 16);
    let dispatcher = Dispatcher::new(8, 2);
    assert_eq!(dispatcher.budget(), 2);
    let (tx, cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 16, 1);
    let _tracker = send(&sim, &tx, 5);
    sim.ram.clear_writes();

    transmit_done(&sim, &[0, 1, 2, 3, 4]);
    irq.fire();

    assert!(dispatcher.poll_once());
    assert_eq!(tx.clean_tail(), 2);
    assert!(cq.is_scheduled());
    assert_eq!(sim.write_count(CQ_REGS, 0, QUEUE_INDEX_REG), 0);

    assert_eq!(dispatcher.run_until_idle(), 2);
    assert_eq!(tx.clean_tail(), 5);
    assert!(!cq.is_scheduled());
    assert_eq!(sim.write_count(CQ_REGS, 0, QUEUE_INDEX_REG), 1);
    assert_eq!(sim.write_count(CQ_REGS, 0, QUEUE_TAIL_PTR_REG), 3);
}

#[test]
fn events_while_scheduled_are_coalesced() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 16);
    let dispatcher = Dispatcher::new(8, 64);
    let (tx, _cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 16, 1);
    let _tracker = send(&sim, &tx, 4);

    transmit_done(&sim, &[0, 1]);
    irq.fire();
    transmit_done(&sim, &[2, 3]);
    irq.fire();
    assert_eq!(dispatcher.run_until_idle(), 1);
    assert_eq!(tx.clean_tail(), 4);
}

#[test]
fn a_zero_budget_still_makes_progress() {
    let dispatcher = Dispatcher::new(4, 0);
    assert_eq!(dispatcher.budget(), 1);
}

#[test]
fn notifier_runs_when_work_is_scheduled() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 16);
    let wakeups = Arc::new(AtomicUsize::new(0));
    let counter = wakeups.clone();
    let dispatcher = Dispatcher::with_notifier(8, 64, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, _cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 16, 1);
    let _tracker = send(&sim, &tx, 2);

    transmit_done(&sim, &[0, 1]);
    irq.fire();
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
    dispatcher.run_until_idle();
    assert_eq!(tx.clean_tail(), 2);
}

#[test]
fn rx_and_tx_share_an_event_queue() {
    let sim = Sim::new();
    let (eq, irq) = active_eq(&sim, 0, 16);
    let dispatcher = Dispatcher::new(8, 64);
    let (tx, _tx_cq) = active_tx(&sim, &eq, dispatcher.clone(), 0, 16, 1);

    let allocator: Arc<dyn DmaAllocator> = Arc::new(sim.dma.clone());
    let sink = CollectingSink::new();
    let rx = RxRing::new(0, sim.regs(RXQ_REGS, 0), Arc::new(DmaReceiveBufferProvider::new(allocator, 32)), sink.clone());
    rx.open(&sim.dma, 16, 1, 1500).unwrap();
    let rx_cq = CompletionQueue::new(1, CompletionKind::Receive, sim.regs(CQ_REGS, 1), dispatcher.clone());
    rx_cq.open(&sim.dma, 16).unwrap();
    rx_cq.activate(&eq, rx.clone()).unwrap();
    rx.activate().unwrap();
    assert_eq!(rx.cq_index(), Some(1));

    let tracker = send(&sim, &tx, 1);
    sim.receive(0, 1, 0, b"hello");
    sim.post_event(0, EVENT_TYPE_RX_CPL, 1);
    transmit_done(&sim, &[0]);
    irq.fire();

    assert_eq!(dispatcher.run_until_idle(), 2);
    assert_eq!(tracker.live(), 0);
    let seen = sink.take();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].data, b"hello".to_vec());
    assert_eq!(rx.clean_tail(), 1);

    rx_cq.deactivate();
    rx.deactivate();
    assert_eq!(rx.cq_index(), None);
}
