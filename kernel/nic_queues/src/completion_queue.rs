//! Completion queues, which tell the host which TX or RX ring slots the device is done with.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use nic_buffers::DmaAllocator;
use register_space::RegisterWindow;
use crate::{CompletionKind, CompletionRecord, DescriptorRing, EventQueue, QueueError};
use crate::regs::{CPL_SIZE, QUEUE_ARM_MASK};


/// Reacts to a completion queue having new records.
pub trait CompletionHandler: Send + Sync {
    /// Called from interrupt context when an event names `cq`.
    ///
    /// Must not process the queue itself, only schedule that work for later.
    fn completion_event(&self, cq: &Arc<CompletionQueue>);
}

/// A TX or RX ring whose slots are completed through a [`CompletionQueue`].
pub trait CompletionTarget: Send + Sync {
    /// Records that the completion queue `cq_index` now completes this ring.
    ///
    /// Fails with [`QueueError::BindingConflict`] if another one already does.
    fn bind_completion_queue(&self, cq_index: u32) -> Result<(), QueueError>;

    fn unbind_completion_queue(&self);

    /// Handles one completion record that refers to a slot of this ring.
    fn complete(&self, record: &CompletionRecord);

    /// Called after each batch of completions, e.g., to advance `clean_tail`.
    fn finish_completions(&self);
}


struct CompletionQueueState {
    ring: DescriptorRing,
    eq: Option<Arc<EventQueue>>,
    target: Option<Arc<dyn CompletionTarget>>,
}

/// A queue of [`CompletionRecord`]s for exactly one TX or RX ring.
pub struct CompletionQueue {
    index: u32,
    kind: CompletionKind,
    handler: Arc<dyn CompletionHandler>,
    /// Set while processing of this queue is pending or in progress.
    scheduled: AtomicBool,
    state: Mutex<CompletionQueueState>,
}

impl CompletionQueue {
    /// Creates an unallocated completion queue that is controlled through `regs`.
    /// Events naming this queue are passed on to `handler`.
    pub fn new(
        index: u32,
        kind: CompletionKind,
        regs: RegisterWindow,
        handler: Arc<dyn CompletionHandler>,
    ) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue {
            index,
            kind,
            handler,
            scheduled: AtomicBool::new(false),
            state: Mutex::new(CompletionQueueState {
                ring: DescriptorRing::new(regs),
                eq: None,
                target: None,
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> CompletionKind {
        self.kind
    }

    /// Allocates room for `size` completion records, rounded up to a power of two.
    pub fn open(&self, allocator: &dyn DmaAllocator, size: u32) -> Result<(), QueueError> {
        self.state.lock().ring.allocate(allocator, size, CPL_SIZE)
    }

    /// Deactivates the queue and releases its memory.
    pub fn close(&self) {
        self.deactivate();
        self.state.lock().ring.free();
    }

    /// Starts the queue, delivering its events through `eq` and its completions to `target`.
    ///
    /// Fails if `eq` is not active or if `target` is already bound to another completion queue.
    /// The queue is armed on success.
    pub fn activate(self: &Arc<Self>, eq: &Arc<EventQueue>, target: Arc<dyn CompletionTarget>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.ring.is_active() {
            return Err(QueueError::AlreadyActive);
        }
        if !state.ring.is_allocated() {
            return Err(QueueError::NotAllocated);
        }
        if !eq.is_active() {
            return Err(QueueError::NotActive);
        }

        target.bind_completion_queue(self.index)?;
        if let Err(e) = eq.attach(self.kind, self.index, self.clone()) {
            target.unbind_completion_queue();
            return Err(e);
        }
        if let Err(e) = state.ring.start(eq.index(), 0) {
            eq.detach(self.kind, self.index);
            target.unbind_completion_queue();
            return Err(e);
        }

        self.scheduled.store(false, Ordering::Release);
        if let Err(e) = state.ring.write_index(eq.index() | QUEUE_ARM_MASK) {
            error!("CQ {}: failed to arm: {}", self.index, e);
        }
        debug!("CQ {} ({:?}): active on EQ {}, size {}", self.index, self.kind, eq.index(), state.ring.capacity());
        state.eq = Some(eq.clone());
        state.target = Some(target);
        Ok(())
    }

    /// Stops the queue and unbinds it from its event queue and ring. Does nothing if inactive.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        if !state.ring.is_active() {
            return;
        }
        state.ring.stop();
        if let Err(e) = state.ring.write_index(0) {
            error!("CQ {}: failed to clear event queue index: {}", self.index, e);
        }
        if let Some(eq) = state.eq.take() {
            eq.detach(self.kind, self.index);
        }
        if let Some(target) = state.target.take() {
            target.unbind_completion_queue();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().ring.is_active()
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().ring.capacity()
    }

    pub fn tail(&self) -> u32 {
        self.state.lock().ring.tail()
    }

    /// The index of the event queue this queue reports to, while active.
    pub fn eq_index(&self) -> Option<u32> {
        self.state.lock().eq.as_ref().map(|eq| eq.index())
    }

    /// Asks the device for an event once the next completion arrives.
    pub fn arm(&self) {
        let state = self.state.lock();
        let Some(eq) = state.eq.as_ref() else { return };
        if let Err(e) = state.ring.write_index(eq.index() | QUEUE_ARM_MASK) {
            error!("CQ {}: failed to arm: {}", self.index, e);
        }
    }

    /// Passes an event for this queue on to its handler.
    pub fn notify(self: &Arc<Self>) {
        self.handler.completion_event(self);
    }

    /// Marks this queue as scheduled for processing.
    ///
    /// Returns false if it already was.
    pub fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Marks this queue as no longer scheduled.
    pub fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Hands up to `budget` new completion records to the bound ring.
    ///
    /// The records are copied out and handed over after this queue's lock is released,
    /// so the ring may call back into this queue. The tail pointer is written back once.
    /// Returns the number of records consumed; if that equals `budget`, more may remain.
    pub fn process(&self, budget: usize) -> usize {
        let mut state = self.state.lock();
        if !state.ring.is_active() {
            return 0;
        }
        let Some(target) = state.target.clone() else { return 0 };
        let head = match state.ring.read_hw_head() {
            Ok(head) => head,
            Err(e) => {
                error!("CQ {}: failed to read head pointer: {}", self.index, e);
                return 0;
            }
        };

        let mut tail = state.ring.tail();
        let mut done = 0;
        let mut records = Vec::new();
        while tail != head && done < budget {
            match state.ring.read_entry::<CompletionRecord>(tail, 0) {
                Some(record) => records.push(record),
                None => error!("CQ {}: could not read completion at {}", self.index, tail),
            }
            tail = tail.wrapping_add(1);
            done += 1;
        }

        if done > 0 {
            state.ring.set_tail(tail);
            if let Err(e) = state.ring.write_hw_tail() {
                error!("CQ {}: failed to write tail pointer: {}", self.index, e);
            }
        }
        drop(state);

        for record in &records {
            target.complete(record);
        }
        target.finish_completions();
        done
    }
}
