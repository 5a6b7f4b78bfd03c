//! Event queues, which tell the host which completion queues have new records.
//!
//! An event queue's locks are shared with its interrupt handler, which must never spin on them.
//! The handler only ever `try_lock`s. If a thread holds either lock, the interrupt is
//! left pending and serviced by that thread right after it unlocks.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{fence, AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};
use nic_buffers::DmaAllocator;
use register_space::RegisterWindow;
use deferred_interrupt_tasks::{InterruptHandler, InterruptRegistrationError, InterruptSource};
use crate::{CompletionKind, CompletionQueue, DescriptorRing, EventRecord, QueueError};
use crate::regs::{EVENT_SIZE, EVENT_TYPE_RX_CPL, EVENT_TYPE_TX_CPL, QUEUE_ARM_MASK};


struct EventQueueState {
    ring: DescriptorRing,
    irq: Option<Arc<dyn InterruptSource>>,
}

/// The completion queues that events may name, indexed by completion queue index.
struct CompletionQueueTable {
    transmit: Vec<Option<Arc<CompletionQueue>>>,
    receive: Vec<Option<Arc<CompletionQueue>>>,
}

impl CompletionQueueTable {
    fn entries(&mut self, kind: CompletionKind) -> &mut Vec<Option<Arc<CompletionQueue>>> {
        match kind {
            CompletionKind::Transmit => &mut self.transmit,
            CompletionKind::Receive => &mut self.receive,
        }
    }
}


/// A queue of [`EventRecord`]s, bound to exactly one interrupt.
pub struct EventQueue {
    index: u32,
    state: Mutex<EventQueueState>,
    table: Mutex<CompletionQueueTable>,
    /// Set by an interrupt that found a lock taken.
    pending: AtomicBool,
}

impl EventQueue {
    /// Creates an unallocated event queue that is controlled through `regs`.
    ///
    /// Events may refer to TX completion queues below `tx_cq_capacity`
    /// and RX completion queues below `rx_cq_capacity`.
    pub fn new(index: u32, regs: RegisterWindow, tx_cq_capacity: u32, rx_cq_capacity: u32) -> Arc<EventQueue> {
        Arc::new(EventQueue {
            index,
            state: Mutex::new(EventQueueState { ring: DescriptorRing::new(regs), irq: None }),
            table: Mutex::new(CompletionQueueTable {
                transmit: (0..tx_cq_capacity).map(|_| None).collect(),
                receive: (0..rx_cq_capacity).map(|_| None).collect(),
            }),
            pending: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Allocates room for `size` events, rounded up to a power of two.
    pub fn open(&self, allocator: &dyn DmaAllocator, size: u32) -> Result<(), QueueError> {
        let result = self.state.lock().ring.allocate(allocator, size, EVENT_SIZE);
        self.service_pending();
        result
    }

    /// Deactivates the queue and releases its memory.
    pub fn close(&self) {
        self.deactivate();
        self.state.lock().ring.free();
        self.service_pending();
    }

    /// Registers this queue as the handler of `irq`, then starts it.
    ///
    /// No lock is held while registering, so `irq` may fire right away.
    pub fn activate(self: &Arc<Self>, irq: Arc<dyn InterruptSource>) -> Result<(), QueueError> {
        self.check_inactive()?;
        irq.register(self.clone()).map_err(|e| match e {
            InterruptRegistrationError::InUse { .. } => QueueError::BindingConflict,
            InterruptRegistrationError::Source(s) => QueueError::External(s),
        })?;

        let started = {
            let mut state = self.state.lock();
            let result = if state.ring.is_active() {
                Err(QueueError::AlreadyActive)
            } else {
                state.ring.start(irq.index(), 0)
            };
            if result.is_ok() {
                debug!("EQ {}: active on interrupt {}, size {}", self.index, irq.index(), state.ring.capacity());
                state.irq = Some(irq.clone());
            }
            result
        };
        if started.is_err() {
            irq.unregister();
        }
        self.service_pending();
        started
    }

    fn check_inactive(&self) -> Result<(), QueueError> {
        let result = {
            let state = self.state.lock();
            if state.ring.is_active() {
                Err(QueueError::AlreadyActive)
            } else if !state.ring.is_allocated() {
                Err(QueueError::NotAllocated)
            } else {
                Ok(())
            }
        };
        self.service_pending();
        result
    }

    /// Stops the queue and unregisters it from its interrupt. Does nothing if inactive.
    pub fn deactivate(&self) {
        let irq = {
            let mut state = self.state.lock();
            state.ring.stop();
            state.irq.take()
        };
        if let Some(irq) = irq {
            irq.unregister();
        }
        self.service_pending();
    }

    pub fn is_active(&self) -> bool {
        self.read_state(|s| s.ring.is_active())
    }

    pub fn is_allocated(&self) -> bool {
        self.read_state(|s| s.ring.is_allocated())
    }

    pub fn capacity(&self) -> u32 {
        self.read_state(|s| s.ring.capacity())
    }

    pub fn tail(&self) -> u32 {
        self.read_state(|s| s.ring.tail())
    }

    fn read_state<R>(&self, f: impl FnOnce(&EventQueueState) -> R) -> R {
        let value = f(&*self.state.lock());
        self.service_pending();
        value
    }

    /// Asks the device for an interrupt once the next event arrives.
    pub fn arm(&self) {
        Self::arm_locked(self.index, &*self.state.lock());
        self.service_pending();
    }

    fn arm_locked(index: u32, state: &EventQueueState) {
        if !state.ring.is_active() {
            return;
        }
        let irq = state.irq.as_ref().map_or(0, |irq| irq.index());
        if let Err(e) = state.ring.write_index(irq | QUEUE_ARM_MASK) {
            error!("EQ {}: failed to arm: {}", index, e);
        }
    }

    /// Makes `cq` the target of events of the given kind that name `cq_index`.
    pub fn attach(&self, kind: CompletionKind, cq_index: u32, cq: Arc<CompletionQueue>) -> Result<(), QueueError> {
        let result = {
            let mut table = self.table.lock();
            let entries = table.entries(kind);
            let capacity = entries.len() as u32;
            match entries.get_mut(cq_index as usize) {
                None => Err(QueueError::OutOfRange { index: cq_index, capacity }),
                Some(entry) if entry.is_some() => Err(QueueError::BindingConflict),
                Some(entry) => {
                    *entry = Some(cq);
                    Ok(())
                }
            }
        };
        self.service_pending();
        result
    }

    /// Removes the completion queue attached at `cq_index`, if any.
    pub fn detach(&self, kind: CompletionKind, cq_index: u32) {
        let removed = self.table.lock().entries(kind).get_mut(cq_index as usize).and_then(|entry| entry.take());
        self.service_pending();
        drop(removed);
    }

    /// Handles every event the device has written since the last drain, up to one full queue.
    ///
    /// Events that name no attached completion queue are logged and skipped.
    /// The tail pointer is written back once, at the end.
    /// Returns the number of events consumed. Does nothing if the queue is inactive.
    pub fn drain(&self) -> usize {
        let done = {
            let mut state = self.state.lock();
            let table = self.table.lock();
            self.drain_locked(&mut state, &table)
        };
        self.service_pending();
        done
    }

    fn drain_locked(&self, state: &mut EventQueueState, table: &CompletionQueueTable) -> usize {
        if !state.ring.is_active() {
            return 0;
        }
        let head = match state.ring.read_hw_head() {
            Ok(head) => head,
            Err(e) => {
                error!("EQ {}: failed to read head pointer: {}", self.index, e);
                return 0;
            }
        };

        let mut tail = state.ring.tail();
        let limit = state.ring.capacity() as usize;
        let mut done = 0;
        while tail != head && done < limit {
            match state.ring.read_entry::<EventRecord>(tail, 0) {
                Some(event) => self.dispatch(table, &event),
                None => error!("EQ {}: could not read event at {}", self.index, tail),
            }
            tail = tail.wrapping_add(1);
            done += 1;
        }

        if done > 0 {
            state.ring.set_tail(tail);
            if let Err(e) = state.ring.write_hw_tail() {
                error!("EQ {}: failed to write tail pointer: {}", self.index, e);
            }
        }
        done
    }

    fn dispatch(&self, table: &CompletionQueueTable, event: &EventRecord) {
        let kind = match event.kind() {
            EVENT_TYPE_TX_CPL => CompletionKind::Transmit,
            EVENT_TYPE_RX_CPL => CompletionKind::Receive,
            other => {
                error!("EQ {}: unknown event type {:#X} (source {})", self.index, other, event.source());
                return;
            }
        };
        let entries = match kind {
            CompletionKind::Transmit => &table.transmit,
            CompletionKind::Receive => &table.receive,
        };
        match entries.get(event.source() as usize).and_then(|entry| entry.as_ref()) {
            Some(cq) => cq.notify(),
            None => error!("EQ {}: event for unknown {:?} CQ {}", self.index, kind, event.source()),
        }
    }

    fn try_lock_both(&self) -> Option<(MutexGuard<'_, EventQueueState>, MutexGuard<'_, CompletionQueueTable>)> {
        let state = self.state.try_lock()?;
        let table = self.table.try_lock()?;
        Some((state, table))
    }

    /// Drains and re-arms the queue for every interrupt that arrived while a lock was taken.
    ///
    /// Returns without waiting if a lock is still taken; its holder will come back here.
    fn service_pending(&self) {
        fence(Ordering::SeqCst);
        while self.pending.load(Ordering::SeqCst) {
            let Some((mut state, table)) = self.try_lock_both() else { return };
            self.pending.store(false, Ordering::SeqCst);
            self.drain_locked(&mut state, &table);
            drop(table);
            Self::arm_locked(self.index, &state);
        }
    }
}

impl InterruptHandler for EventQueue {
    fn handle_interrupt(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.service_pending();
    }
}
