//! Receive rings.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use nic_buffers::{
    DmaAllocator, PacketSink, PhysicalAddress, ReceiveBuffer, ReceiveBufferProvider, ReceivedPacket,
    PAGE_SIZE,
};
use register_space::RegisterWindow;
use crate::{
    CompletionRecord, CompletionTarget, Descriptor, DescriptorRing, QueueError, RingStats,
    TimestampReconstructor,
};
use crate::regs::{DESC_SIZE, ETH_HLEN, RX_REFILL_THRESHOLD};


/// The smallest page order whose buffers can hold a frame of the given MTU.
pub fn rx_page_order(mtu: u32) -> u32 {
    let needed = mtu as usize + ETH_HLEN as usize;
    let mut order = 0;
    while (PAGE_SIZE << order) < needed {
        order += 1;
    }
    order
}


struct RxRingState {
    ring: DescriptorRing,
    clean_tail: u32,
    /// The buffer owned by each slot, indexed by slot.
    buffers: Vec<Option<Box<dyn ReceiveBuffer>>>,
    desc_block_size: usize,
    cq_index: Option<u32>,
    page_order: u32,
}

impl RxRingState {
    fn missing(&self) -> u32 {
        self.ring.capacity().saturating_sub(self.ring.head().wrapping_sub(self.clean_tail))
    }

    fn release_all(&mut self) {
        for buffer in self.buffers.iter_mut() {
            if let Some(mut b) = buffer.take() {
                b.unmap();
            }
        }
    }
}


/// A ring of empty buffers for the device to receive packets into.
pub struct RxRing {
    index: u32,
    state: Mutex<RxRingState>,
    provider: Arc<dyn ReceiveBufferProvider>,
    sink: Arc<dyn PacketSink>,
    timestamps: Mutex<Option<Arc<TimestampReconstructor>>>,
    checksum_offload: AtomicBool,
    stats: RingStats,
}

impl RxRing {
    /// Creates an unallocated receive ring that is controlled through `regs`.
    /// Buffers come from `provider`, and received packets go to `sink`.
    pub fn new(
        index: u32,
        regs: RegisterWindow,
        provider: Arc<dyn ReceiveBufferProvider>,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<RxRing> {
        Arc::new(RxRing {
            index,
            state: Mutex::new(RxRingState {
                ring: DescriptorRing::new(regs),
                clean_tail: 0,
                buffers: Vec::new(),
                desc_block_size: 1,
                cq_index: None,
                page_order: 0,
            }),
            provider,
            sink,
            timestamps: Mutex::new(None),
            checksum_offload: AtomicBool::new(false),
            stats: RingStats::default(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Allocates `size` slots of `desc_block_size` descriptors each,
    /// for frames of up to `mtu` bytes plus an Ethernet header.
    pub fn open(&self, allocator: &dyn DmaAllocator, size: u32, desc_block_size: u32, mtu: u32) -> Result<(), QueueError> {
        let desc_block_size = desc_block_size.max(1).next_power_of_two();
        let mut state = self.state.lock();
        state.ring.allocate(allocator, size, desc_block_size as usize * DESC_SIZE)?;
        state.buffers = (0..state.ring.capacity()).map(|_| None).collect();
        state.desc_block_size = desc_block_size as usize;
        state.clean_tail = 0;
        state.page_order = rx_page_order(mtu);
        Ok(())
    }

    /// Deactivates the ring and releases its memory.
    pub fn close(&self) {
        self.deactivate();
        let mut state = self.state.lock();
        state.ring.free();
        state.buffers = Vec::new();
    }

    /// Changes the size of buffers used by later refills.
    pub fn set_mtu(&self, mtu: u32) {
        self.state.lock().page_order = rx_page_order(mtu);
    }

    pub fn page_order(&self) -> u32 {
        self.state.lock().page_order
    }

    /// Starts the ring and fills it with buffers. A completion queue must already be bound to it.
    pub fn activate(&self) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if !state.ring.is_allocated() {
                return Err(QueueError::NotAllocated);
            }
            let cq_index = state.cq_index.ok_or(QueueError::NotBound)?;
            let log_desc_block_size = state.desc_block_size.trailing_zeros();
            state.ring.start(cq_index, log_desc_block_size)?;
            state.clean_tail = 0;
            debug!("RX ring {}: active on CQ {}, size {}", self.index, cq_index, state.ring.capacity());
        }
        self.refill();
        Ok(())
    }

    /// Stops the ring, releases every buffer it still owns and resets its pointers.
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
    }

    /// Hands fresh buffers to the device for every empty slot,
    /// but only once at least [`RX_REFILL_THRESHOLD`] slots are empty.
    ///
    /// Buffers are obtained and mapped without holding the ring's lock.
    /// Stops early if a buffer cannot be obtained. The head pointer is written once, at the end.
    /// Returns the number of slots filled.
    pub fn refill(&self) -> u32 {
        let (missing, page_order) = {
            let state = self.state.lock();
            if !state.ring.is_active() {
                return 0;
            }
            (state.missing(), state.page_order)
        };
        if missing < RX_REFILL_THRESHOLD {
            return 0;
        }

        let mut fresh: Vec<(Box<dyn ReceiveBuffer>, PhysicalAddress)> = Vec::with_capacity(missing as usize);
        while fresh.len() < missing as usize {
            let mut buffer = match self.provider.allocate(page_order) {
                Ok(b) => b,
                Err(e) => {
                    error!("RX ring {}: failed to allocate receive buffer: {}", self.index, e);
                    break;
                }
            };
            match buffer.map() {
                Ok(addr) => fresh.push((buffer, addr)),
                Err(e) => {
                    error!("RX ring {}: failed to map receive buffer: {}", self.index, e);
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        if !state.ring.is_active() {
            drop(state);
            fresh.iter_mut().for_each(|(b, _)| b.unmap());
            return 0;
        }
        // Another refill may have run meanwhile.
        let room = state.missing();
        let mut filled = 0;
        let mut fresh = fresh.into_iter();
        while filled < room {
            let head = state.ring.head();
            let slot = state.ring.slot(head);
            if state.buffers[slot].is_some() {
                error!("RX ring {}: slot {} is still owned, stopping refill", self.index, slot);
                break;
            }
            let Some((mut buffer, phys_addr)) = fresh.next() else { break };

            let desc = Descriptor::new(phys_addr, buffer.capacity() as u32, 0);
            let written = state.ring.write_entry(head, 0, &desc).is_some()
                && (1..state.desc_block_size).all(|i| state.ring.write_entry(head, i, &Descriptor::default()).is_some());
            if !written {
                error!("RX ring {}: descriptor outside of ring", self.index);
                buffer.unmap();
                break;
            }
            state.buffers[slot] = Some(buffer);
            state.ring.set_head(head.wrapping_add(1));
            filled += 1;
        }

        if filled > 0 {
            if let Err(e) = state.ring.write_hw_head() {
                error!("RX ring {}: failed to write head pointer: {}", self.index, e);
            }
        }
        drop(state);
        // Left over when the ring filled up meanwhile.
        fresh.for_each(|(mut b, _)| b.unmap());
        filled
    }

    /// Delivers the packet in the slot that `record` completes to the packet sink.
    fn complete_one(&self, record: &CompletionRecord) {
        let buffer = {
            let mut state = self.state.lock();
            if !state.ring.is_allocated() {
                return;
            }
            let slot = state.ring.slot(record.index() as u32);
            state.buffers[slot].take()
        };
        let Some(mut buffer) = buffer else {
            error!("RX ring {}: completion for empty slot {}", self.index, record.index());
            return;
        };
        buffer.unmap();

        let length = (record.len() as usize).min(buffer.capacity());
        let timestamp = self.timestamps.lock().as_ref().map(|ts| ts.reconstruct(record));
        let checksum = self.checksum_offload.load(Ordering::Relaxed).then(|| record.rx_csum());
        self.stats.record(length);
        self.sink.deliver(ReceivedPacket {
            buffer,
            length,
            queue: self.index,
            timestamp,
            checksum,
        });
    }

    /// Advances `clean_tail` up to the device's tail pointer, then refills.
    fn reconcile(&self) {
        {
            let mut state = self.state.lock();
            if !state.ring.is_active() {
                return;
            }
            let tail = match state.ring.read_hw_tail() {
                Ok(tail) => tail,
                Err(e) => {
                    error!("RX ring {}: failed to read tail pointer: {}", self.index, e);
                    return;
                }
            };
            while state.clean_tail != tail {
                let slot = state.ring.slot(state.clean_tail);
                if state.buffers[slot].is_some() {
                    break;
                }
                state.clean_tail = state.clean_tail.wrapping_add(1);
            }
        }
        self.refill();
    }

    /// Attaches reconstructed hardware timestamps to received packets.
    pub fn enable_timestamps(&self, timestamps: Arc<TimestampReconstructor>) {
        *self.timestamps.lock() = Some(timestamps);
    }

    /// Passes the device's checksum of each packet on to the sink.
    pub fn set_checksum_offload(&self, enabled: bool) {
        self.checksum_offload.store(enabled, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().ring.is_active()
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().ring.capacity()
    }

    pub fn head(&self) -> u32 {
        self.state.lock().ring.head()
    }

    pub fn clean_tail(&self) -> u32 {
        self.state.lock().clean_tail
    }

    /// The number of buffers the ring currently owns.
    pub fn owned_count(&self) -> usize {
        self.state.lock().buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn cq_index(&self) -> Option<u32> {
        self.state.lock().cq_index
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

impl CompletionTarget for RxRing {
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
