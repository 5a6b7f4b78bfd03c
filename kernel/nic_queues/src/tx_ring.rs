//! Transmit rings.
//!
//! Each slot of a transmit ring is one descriptor block, which holds all
//! fragments of exactly one packet. Unused descriptors of a block are zeroed.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use nic_buffers::{DmaAllocator, TransmitPacket};
use register_space::RegisterWindow;
use crate::{
    CompletionRecord, CompletionTarget, Descriptor, DescriptorRing, QueueError, RingStats,
    TimestampReconstructor,
};
use crate::regs::DESC_SIZE;


/// The result of successfully enqueueing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// The packet was queued and there is room for more.
    Queued,
    /// The packet was queued, but the ring is now full.
    /// The caller must stop producing until its [`TxWaker`] is woken.
    Full,
}

/// A packet that could not be enqueued, handed back to the caller.
pub struct EnqueueError {
    pub error: QueueError,
    pub packet: Box<dyn TransmitPacket>,
}

impl fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EnqueueError").field("error", &self.error).finish_non_exhaustive()
    }
}

/// Notified when a full transmit ring has room again.
pub trait TxWaker: Send + Sync {
    fn wake(&self, tx_queue: u32);
}


struct TxRingState {
    ring: DescriptorRing,
    clean_tail: u32,
    /// The packet owned by each slot, indexed by slot.
    packets: Vec<Option<Box<dyn TransmitPacket>>>,
    /// Descriptors per slot.
    desc_block_size: usize,
    cq_index: Option<u32>,
    /// Set once a producer has been told the ring is full.
    stopped: bool,
}

impl TxRingState {
    fn in_flight(&self) -> u32 {
        self.ring.head().wrapping_sub(self.clean_tail)
    }

    fn is_full(&self) -> bool {
        self.in_flight() >= self.ring.capacity() / 2
    }

    /// Advances `clean_tail` over contiguous slots that no longer own a packet.
    fn reconcile_clean_tail(&mut self) {
        let head = self.ring.head();
        while self.clean_tail != head {
            let slot = self.ring.slot(self.clean_tail);
            if self.packets[slot].is_some() {
                break;
            }
            self.clean_tail = self.clean_tail.wrapping_add(1);
        }
    }

    fn release_all(&mut self) {
        for packet in self.packets.iter_mut() {
            if let Some(mut p) = packet.take() {
                p.unmap();
            }
        }
    }
}


/// A ring of descriptors of packets for the device to send.
pub struct TxRing {
    index: u32,
    state: Mutex<TxRingState>,
    waker: Mutex<Option<Arc<dyn TxWaker>>>,
    timestamps: Mutex<Option<Arc<TimestampReconstructor>>>,
    checksum_offload: AtomicBool,
    stats: RingStats,
}

impl TxRing {
    /// Creates an unallocated transmit ring that is controlled through `regs`.
    pub fn new(index: u32, regs: RegisterWindow) -> Arc<TxRing> {
        Arc::new(TxRing {
            index,
            state: Mutex::new(TxRingState {
                ring: DescriptorRing::new(regs),
                clean_tail: 0,
                packets: Vec::new(),
                desc_block_size: 1,
                cq_index: None,
                stopped: false,
            }),
            waker: Mutex::new(None),
            timestamps: Mutex::new(None),
            checksum_offload: AtomicBool::new(false),
            stats: RingStats::default(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Allocates `size` slots of `desc_block_size` descriptors each.
    /// Both are rounded up to a power of two.
    pub fn open(&self, allocator: &dyn DmaAllocator, size: u32, desc_block_size: u32) -> Result<(), QueueError> {
        let desc_block_size = desc_block_size.max(1).next_power_of_two();
        let mut state = self.state.lock();
        state.ring.allocate(allocator, size, desc_block_size as usize * DESC_SIZE)?;
        state.packets = (0..state.ring.capacity()).map(|_| None).collect();
        state.desc_block_size = desc_block_size as usize;
        state.clean_tail = 0;
        state.stopped = false;
        Ok(())
    }

    /// Deactivates the ring and releases its memory.
    pub fn close(&self) {
        self.deactivate();
        let mut state = self.state.lock();
        state.ring.free();
        state.packets = Vec::new();
    }

    /// Starts the ring. A completion queue must already be bound to it.
    pub fn activate(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if !state.ring.is_allocated() {
            return Err(QueueError::NotAllocated);
        }
        let cq_index = state.cq_index.ok_or(QueueError::NotBound)?;
        let log_desc_block_size = state.desc_block_size.trailing_zeros();
        state.ring.start(cq_index, log_desc_block_size)?;
        state.clean_tail = 0;
        state.stopped = false;
        debug!("TX ring {}: active on CQ {}, size {}", self.index, cq_index, state.ring.capacity());
        Ok(())
    }

    /// Stops the ring, releases every packet it still owns and resets its pointers.
    /// Does nothing if the ring is not active.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        if !state.ring.is_active() {
            return;
        }
        state.ring.stop();
        state.release_all();
        state.ring.set_head(0);
        state.ring.set_tail(0);
        state.clean_tail = 0;
        state.stopped = false;
    }

    /// Queues `packet` in the next free slot. The device only sees it after [`TxRing::post()`].
    ///
    /// On failure the slot stays free and the packet is handed back.
    pub fn enqueue(&self, mut packet: Box<dyn TransmitPacket>) -> Result<TxStatus, EnqueueError> {
        let mut state = self.state.lock();
        if !state.ring.is_active() {
            return Err(EnqueueError { error: QueueError::NotActive, packet });
        }
        let fragments = packet.fragment_count();
        if fragments == 0 {
            return Err(EnqueueError { error: QueueError::MapError("packet has no fragments"), packet });
        }
        if fragments > state.desc_block_size {
            let error = QueueError::TooManyFragments { fragments, max: state.desc_block_size };
            return Err(EnqueueError { error, packet });
        }
        if state.is_full() {
            state.stopped = true;
            return Err(EnqueueError { error: QueueError::Full, packet });
        }

        let head = state.ring.head();
        let csum_cmd = if self.checksum_offload.load(Ordering::Relaxed) { packet.checksum_command() } else { 0 };
        for i in 0..state.desc_block_size {
            let desc = if i < fragments {
                match packet.map_fragment(i) {
                    Ok(fragment) => Descriptor::from_fragment(&fragment, if i == 0 { csum_cmd } else { 0 }),
                    Err(e) => {
                        packet.unmap();
                        return Err(EnqueueError { error: QueueError::MapError(e), packet });
                    }
                }
            } else {
                Descriptor::default()
            };
            if state.ring.write_entry(head, i, &desc).is_none() {
                packet.unmap();
                return Err(EnqueueError { error: QueueError::External("descriptor outside of ring"), packet });
            }
        }

        let slot = state.ring.slot(head);
        state.packets[slot] = Some(packet);
        state.ring.set_head(head.wrapping_add(1));

        if state.is_full() {
            state.stopped = true;
            info!("TX ring {}: full, stopping", self.index);
            Ok(TxStatus::Full)
        } else {
            Ok(TxStatus::Queued)
        }
    }

    /// Tells the device about every packet enqueued so far.
    pub fn post(&self) -> Result<(), QueueError> {
        let state = self.state.lock();
        if !state.ring.is_active() {
            return Err(QueueError::NotActive);
        }
        state.ring.write_hw_head()?;
        Ok(())
    }

    /// Releases the packet owned by the slot that `record` completes.
    fn complete_one(&self, record: &CompletionRecord) {
        let packet = {
            let mut state = self.state.lock();
            if !state.ring.is_allocated() {
                return;
            }
            let slot = state.ring.slot(record.index() as u32);
            state.packets[slot].take()
        };
        let Some(mut packet) = packet else {
            error!("TX ring {}: completion for empty slot {}", self.index, record.index());
            return;
        };

        if packet.timestamp_requested() {
            if let Some(ts) = self.timestamps.lock().as_ref() {
                packet.set_timestamp(ts.reconstruct(record));
            }
        }
        packet.unmap();
        self.stats.record(packet.length());
    }

    /// Advances `clean_tail` and wakes a stopped producer if there is room again.
    fn reconcile(&self) {
        let wake = {
            let mut state = self.state.lock();
            state.reconcile_clean_tail();
            if state.stopped && !state.is_full() {
                state.stopped = false;
                true
            } else {
                false
            }
        };
        if wake {
            if let Some(waker) = self.waker.lock().clone() {
                waker.wake(self.index);
            }
        }
    }

    pub fn set_waker(&self, waker: Arc<dyn TxWaker>) {
        *self.waker.lock() = Some(waker);
    }

    /// Captures transmit timestamps of packets that request one.
    pub fn enable_timestamps(&self, timestamps: Arc<TimestampReconstructor>) {
        *self.timestamps.lock() = Some(timestamps);
    }

    /// Passes each packet's checksum command on to the device.
    pub fn set_checksum_offload(&self, enabled: bool) {
        self.checksum_offload.store(enabled, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().ring.is_active()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().ring.capacity()
    }

    pub fn desc_block_size(&self) -> usize {
        self.state.lock().desc_block_size
    }

    pub fn head(&self) -> u32 {
        self.state.lock().ring.head()
    }

    pub fn clean_tail(&self) -> u32 {
        self.state.lock().clean_tail
    }

    /// The number of packets the ring currently owns.
    pub fn owned_count(&self) -> usize {
        self.state.lock().packets.iter().filter(|p| p.is_some()).count()
    }

    pub fn cq_index(&self) -> Option<u32> {
        self.state.lock().cq_index
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

impl CompletionTarget for TxRing {
    fn bind_completion_queue(&self, cq_index: u32) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.cq_index.is_some() {
            return Err(QueueError::BindingConflict);
        }
        state.cq_index = Some(cq_index);
        Ok(())
    }

    fn unbind_completion_queue(&self) {
        self.state.lock().cq_index = None;
    }

    fn complete(&self, record: &CompletionRecord) {
        self.complete_one(record);
    }

    fn finish_completions(&self) {
        self.reconcile();
    }
}
