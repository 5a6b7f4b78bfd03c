//! Tests for the queue engine, against a simulated device.
//!
//! The device side is played by [`Sim`]: it reads queue registers from a
//! [`RamRegisterSpace`] and reads and writes queue memory through a
//! [`HeapDmaAllocator`], the way the hardware would.

extern crate std;

mod ring;
mod pipeline;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};
use nic_buffers::{
    Fragment, HeapDmaAllocator, HwTimestamp, PacketSink, PhysicalAddress, ReceivedPacket, TransmitPacket,
    PAGE_SIZE,
};
use register_space::{RamRegisterSpace, RegisterSpace, RegisterWindow};
use super::*;
use super::regs::*;

pub(crate) const EQ_REGS: usize = 0x0000;
pub(crate) const CQ_REGS: usize = 0x1000;
pub(crate) const TXQ_REGS: usize = 0x2000;
pub(crate) const RXQ_REGS: usize = 0x3000;
pub(crate) const STRIDE: usize = 0x20;


/// A simulated device: its register file and its view of DMA memory.
pub(crate) struct Sim {
    pub ram: Arc<RamRegisterSpace>,
    pub dma: HeapDmaAllocator,
}

impl Sim {
    pub fn new() -> Sim {
        Sim {
            ram: Arc::new(RamRegisterSpace::new(0x4000)),
            dma: HeapDmaAllocator::new(),
        }
    }

    /// The register-space offset of queue `index` in the family at `family`.
    pub fn offset(family: usize, index: u32) -> usize {
        family + index as usize * STRIDE
    }

    pub fn regs(&self, family: usize, index: u32) -> RegisterWindow {
        RegisterWindow::new(self.ram.clone(), Sim::offset(family, index), STRIDE).unwrap()
    }

    pub fn read(&self, offset: usize) -> u32 {
        self.ram.read_u32(offset).unwrap()
    }

    /// How many times the host wrote register `reg` of the given queue.
    pub fn write_count(&self, family: usize, index: u32, reg: usize) -> usize {
        self.ram.write_count(Sim::offset(family, index) + reg)
    }

    pub fn last_write(&self, family: usize, index: u32, reg: usize) -> Option<u32> {
        self.ram.last_write(Sim::offset(family, index) + reg).map(|v| v as u32)
    }

    fn base(&self, queue: usize) -> PhysicalAddress {
        let lo = self.read(queue + QUEUE_BASE_ADDR_LO_REG) as u64;
        let hi = self.read(queue + QUEUE_BASE_ADDR_HI_REG) as u64;
        PhysicalAddress::new(hi << 32 | lo)
    }

    fn size(&self, queue: usize) -> u32 {
        1 << (self.read(queue + QUEUE_ACTIVE_LOG_SIZE_REG) & 0xFF)
    }

    fn slot_stride(&self, queue: usize) -> u64 {
        (DESC_SIZE as u64) << ((self.read(queue + QUEUE_ACTIVE_LOG_SIZE_REG) >> 8) & 0xF)
    }

    /// Writes `record` at the hardware head of an event or completion queue and advances the head.
    fn produce<T: AsBytes>(&self, queue: usize, record: &T) {
        let head = self.read(queue + QUEUE_HEAD_PTR_REG);
        let slot = (head & (self.size(queue) - 1)) as u64;
        let addr = self.base(queue).offset(slot * record.as_bytes().len() as u64);
        self.dma.device_write(addr, record.as_bytes()).unwrap();
        self.ram.poke_u32(queue + QUEUE_HEAD_PTR_REG, (head + 1) & HW_PTR_MASK).unwrap();
    }

    pub fn post_event(&self, eq: u32, kind: u16, source: u16) {
        self.produce(Sim::offset(EQ_REGS, eq), &EventRecord::new(kind, source));
    }

    pub fn post_completion(&self, cq: u32, record: CompletionRecord) {
        self.produce(Sim::offset(CQ_REGS, cq), &record);
    }

    /// Reads descriptor `entry` of the slot of `ptr` in a TX or RX ring.
    pub fn descriptor(&self, family: usize, ring: u32, ptr: u32, entry: usize) -> Descriptor {
        let queue = Sim::offset(family, ring);
        let slot = (ptr & (self.size(queue) - 1)) as u64;
        let addr = self.base(queue).offset(slot * self.slot_stride(queue) + (entry * DESC_SIZE) as u64);
        let bytes = self.dma.device_read(addr, DESC_SIZE).unwrap();
        Descriptor::read_from(&bytes[..]).unwrap()
    }

    /// Moves the hardware tail pointer of a TX or RX ring, as the device does when it consumes slots.
    pub fn set_tail(&self, family: usize, ring: u32, tail: u32) {
        self.ram.poke_u32(Sim::offset(family, ring) + QUEUE_TAIL_PTR_REG, tail & HW_PTR_MASK).unwrap();
    }

    /// Receives `data` into the slot of `ptr` of an RX ring and posts its completion to `cq`.
    pub fn receive(&self, ring: u32, cq: u32, ptr: u32, data: &[u8]) {
        let desc = self.descriptor(RXQ_REGS, ring, ptr, 0);
        let len = data.len().min(desc.len() as usize);
        self.dma.device_write(desc.addr(), &data[..len]).unwrap();
        self.post_completion(cq, CompletionRecord::new(ring as u16, ptr as u16, data.len() as u16));
        self.set_tail(RXQ_REGS, ring, ptr + 1);
    }
}


/// Shared counters of the [`TestPacket`]s created from it.
#[derive(Default)]
pub(crate) struct Tracker {
    pub live: AtomicUsize,
    pub unmaps: AtomicUsize,
    pub timestamps: Mutex<Vec<HwTimestamp>>,
}

impl Tracker {
    pub fn new() -> Arc<Tracker> {
        Arc::new(Tracker::default())
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }
}

/// A transmit packet with fake fragments.
pub(crate) struct TestPacket {
    fragments: usize,
    fail_at: Option<usize>,
    timestamp: bool,
    csum_cmd: u16,
    tracker: Arc<Tracker>,
}

impl TestPacket {
    pub fn new(tracker: &Arc<Tracker>, fragments: usize) -> TestPacket {
        tracker.live.fetch_add(1, Ordering::SeqCst);
        TestPacket { fragments, fail_at: None, timestamp: false, csum_cmd: 0, tracker: tracker.clone() }
    }

    pub fn boxed(tracker: &Arc<Tracker>) -> Box<dyn TransmitPacket> {
        Box::new(TestPacket::new(tracker, 1))
    }

    pub fn failing_at(mut self, fragment: usize) -> TestPacket {
        self.fail_at = Some(fragment);
        self
    }

    pub fn with_timestamp(mut self) -> TestPacket {
        self.timestamp = true;
        self
    }

    pub fn with_csum_cmd(mut self, cmd: u16) -> TestPacket {
        self.csum_cmd = cmd;
        self
    }
}

/// The fake device address of `fragment`.
pub(crate) fn fragment_addr(fragment: usize) -> PhysicalAddress {
    PhysicalAddress::new(0x8000_0000 + fragment as u64 * 0x1000)
}

pub(crate) const FRAGMENT_LEN: u32 = 100;

impl TransmitPacket for TestPacket {
    fn fragment_count(&self) -> usize {
        self.fragments
    }

    fn length(&self) -> usize {
        self.fragments * FRAGMENT_LEN as usize
    }

    fn map_fragment(&mut self, index: usize) -> Result<Fragment, &'static str> {
        if self.fail_at == Some(index) {
            return Err("injected map failure");
        }
        Ok(Fragment { phys_addr: fragment_addr(index), length: FRAGMENT_LEN })
    }

    fn unmap(&mut self) {
        self.tracker.unmaps.fetch_add(1, Ordering::SeqCst);
    }

    fn checksum_command(&self) -> u16 {
        self.csum_cmd
    }

    fn timestamp_requested(&self) -> bool {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: HwTimestamp) {
        self.tracker.timestamps.lock().push(timestamp);
    }
}

impl Drop for TestPacket {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::SeqCst);
    }
}


/// What a [`CollectingSink`] saw of one received packet.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Seen {
    pub queue: u32,
    pub data: Vec<u8>,
    pub timestamp: Option<HwTimestamp>,
    pub checksum: Option<u16>,
}

#[derive(Default)]
pub(crate) struct CollectingSink {
    pub packets: Mutex<Vec<Seen>>,
}

impl CollectingSink {
    pub fn new() -> Arc<CollectingSink> {
        Arc::new(CollectingSink::default())
    }

    pub fn take(&self) -> Vec<Seen> {
        core::mem::take(&mut *self.packets.lock())
    }
}

impl PacketSink for CollectingSink {
    fn deliver(&self, packet: ReceivedPacket) {
        self.packets.lock().push(Seen {
            queue: packet.queue,
            data: packet.data().to_vec(),
            timestamp: packet.timestamp,
            checksum: packet.checksum,
        });
    }
}


/// Records which completion queues were notified, without processing them.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub notified: Mutex<Vec<(CompletionKind, u32)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler::default())
    }

    pub fn take(&self) -> Vec<(CompletionKind, u32)> {
        core::mem::take(&mut *self.notified.lock())
    }
}

impl CompletionHandler for RecordingHandler {
    fn completion_event(&self, cq: &Arc<CompletionQueue>) {
        self.notified.lock().push((cq.kind(), cq.index()));
    }
}


/// A clock that reports a settable number of seconds and counts how often it was read.
pub(crate) struct TestClock {
    pub seconds: Mutex<Option<u64>>,
    pub reads: AtomicUsize,
}

impl TestClock {
    pub fn new(seconds: u64) -> Arc<TestClock> {
        Arc::new(TestClock { seconds: Mutex::new(Some(seconds)), reads: AtomicUsize::new(0) })
    }

    pub fn set(&self, seconds: Option<u64>) {
        *self.seconds.lock() = seconds;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl PtpClock for TestClock {
    fn seconds(&self) -> Result<u64, &'static str> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.seconds.lock().ok_or("clock unavailable")
    }
}


/// An active event queue on its own software interrupt.
pub(crate) fn active_eq(sim: &Sim, index: u32, size: u32) -> (Arc<EventQueue>, Arc<deferred_interrupt_tasks::SoftInterrupt>) {
    let eq = EventQueue::new(index, sim.regs(EQ_REGS, index), 8, 8);
    eq.open(&sim.dma, size).unwrap();
    let irq = Arc::new(deferred_interrupt_tasks::SoftInterrupt::new(index + 10));
    eq.activate(irq.clone()).unwrap();
    (eq, irq)
}

/// An active TX ring of `size` slots, completed by an active CQ on `eq`.
pub(crate) fn active_tx(
    sim: &Sim,
    eq: &Arc<EventQueue>,
    handler: Arc<dyn CompletionHandler>,
    index: u32,
    size: u32,
    desc_block_size: u32,
) -> (Arc<TxRing>, Arc<CompletionQueue>) {
    let cq = CompletionQueue::new(index, CompletionKind::Transmit, sim.regs(CQ_REGS, index), handler);
    cq.open(&sim.dma, size).unwrap();
    let tx = TxRing::new(index, sim.regs(TXQ_REGS, index));
    tx.open(&sim.dma, size, desc_block_size).unwrap();
    cq.activate(eq, tx.clone()).unwrap();
    tx.activate().unwrap();
    (tx, cq)
}
