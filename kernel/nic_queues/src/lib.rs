//! The queue engine of a multi-queue NIC.
//!
//! Four kinds of rings move work between the host and the device.
//! All of them share the register and pointer protocol of [`DescriptorRing`]:
//! * a [`TxRing`] holds descriptors of packets to send,
//! * an [`RxRing`] holds descriptors of empty buffers for the device to fill,
//! * a [`CompletionQueue`] receives one record per finished TX or RX slot,
//! * an [`EventQueue`] receives one record whenever a completion queue has new records,
//!   and raises an interrupt.
//!
//! Interrupts are handled in two stages. The interrupt handler drains the event queue
//! and only notifies the [`CompletionHandler`] of each completion queue named by an event.
//! The [`Dispatcher`] then processes those completion queues later, in a deferred task,
//! with a bounded budget per pass.
//!
//! Locks are always taken in this order:
//! completion queue state, then event queue state or its completion queue table, then ring state.
//! Code that runs in interrupt context never takes a completion queue or ring lock,
//! and only `try_lock`s the event queue's own locks.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate spin;
extern crate zerocopy;
extern crate bit_field;
extern crate register_space;
extern crate nic_buffers;
extern crate deferred_interrupt_tasks;

pub mod regs;
mod records;
mod ring;
mod event_queue;
mod completion_queue;
mod tx_ring;
mod rx_ring;
mod timestamp;
mod dispatch;
#[cfg(test)]
mod test;

pub use records::{CompletionRecord, Descriptor, EventRecord};
pub use ring::{reconcile_pointer, DescriptorRing};
pub use event_queue::EventQueue;
pub use completion_queue::{CompletionHandler, CompletionQueue, CompletionTarget};
pub use tx_ring::{EnqueueError, TxRing, TxStatus, TxWaker};
pub use rx_ring::{rx_page_order, RxRing};
pub use timestamp::{PtpClock, TimestampReconstructor};
pub use dispatch::Dispatcher;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use register_space::RegisterError;


/// The errors returned by queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has no DMA buffer yet.
    NotAllocated,
    /// The queue already has a DMA buffer.
    AlreadyAllocated,
    /// The operation requires an active queue.
    NotActive,
    /// The queue is already active.
    AlreadyActive,
    /// The queue, ring or table slot is already bound to something else.
    BindingConflict,
    /// A ring cannot be activated before a completion queue is bound to it.
    NotBound,
    /// The transmit ring has no room for another packet.
    Full,
    /// The packet has more fragments than fit in one descriptor block.
    TooManyFragments { fragments: usize, max: usize },
    /// The requested size is zero or too large for the hardware pointers.
    InvalidSize(u32),
    /// An index lies outside of a completion queue table.
    OutOfRange { index: u32, capacity: u32 },
    /// A packet fragment could not be mapped for the device.
    MapError(&'static str),
    /// A collaborator, e.g., the DMA allocator, failed.
    External(&'static str),
    Register(RegisterError),
}

impl From<RegisterError> for QueueError {
    fn from(e: RegisterError) -> Self {
        QueueError::Register(e)
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::NotAllocated => write!(f, "queue is not allocated"),
            QueueError::AlreadyAllocated => write!(f, "queue is already allocated"),
            QueueError::NotActive => write!(f, "queue is not active"),
            QueueError::AlreadyActive => write!(f, "queue is already active"),
            QueueError::BindingConflict => write!(f, "queue is already bound"),
            QueueError::NotBound => write!(f, "no completion queue is bound"),
            QueueError::Full => write!(f, "ring is full"),
            QueueError::TooManyFragments { fragments, max } =>
                write!(f, "packet has {} fragments, at most {} are supported", fragments, max),
            QueueError::InvalidSize(size) => write!(f, "invalid queue size {}", size),
            QueueError::OutOfRange { index, capacity } =>
                write!(f, "index {} is out of range (capacity {})", index, capacity),
            QueueError::MapError(e) => write!(f, "mapping failed: {}", e),
            QueueError::External(e) => write!(f, "{}", e),
            QueueError::Register(e) => write!(f, "{}", e),
        }
    }
}


/// Which kind of ring a completion queue completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Transmit,
    Receive,
}


/// Packet and byte counters of one ring, updated during completion processing.
#[derive(Debug, Default)]
pub struct RingStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl RingStats {
    pub(crate) fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
