//! Abstractions for deferred interrupt tasks, a companion to regular interrupt handlers.
//!
//! We refer to the first, latency-sensitive part of interrupt handling as the
//! *interrupt handler* and the second, later part as the *deferred task*.
//! The interrupt handler runs synchronously when the interrupt occurs,
//! while the deferred task runs at some time in the future, ideally as soon as possible.
//!
//! An interrupt handler should be short and do the minimum amount of work possible,
//! because other interrupts are typically disabled while it executes to completion.
//! It only does a couple of quick things:
//!  * Notifies the deferred task that work is ready to be done,
//!    optionally providing details about what work it needs to do,
//!  * Acknowledges the interrupt such that the hardware knows it was handled.
//!
//! This crate provides:
//! * [`InterruptSource`], one interrupt line that a single [`InterruptHandler`] can be registered on,
//! * [`DeferredTaskQueue`], a bounded, preallocated, lock-free queue of pending deferred work
//!   that an interrupt handler can push to without allocating or blocking,
//! * [`SoftInterrupt`], an interrupt line that is fired in software,
//!   used when the device is simulated.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate mpmc;


use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use spin::Mutex;


/// The errors that may occur in [`InterruptSource::register()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptRegistrationError {
    /// The interrupt line `irq` already has a handler registered.
    InUse { irq: u32 },
    /// The platform could not set up the interrupt line.
    Source(&'static str),
}

impl fmt::Display for InterruptRegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterruptRegistrationError::InUse { irq } => write!(f, "interrupt {} is already in use", irq),
            InterruptRegistrationError::Source(e) => write!(f, "{}", e),
        }
    }
}


/// Code that runs in interrupt context whenever its interrupt line fires.
///
/// Implementations must not block, allocate, or take locks that deferred tasks may hold.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self);
}

/// One interrupt line, e.g., an MSI-X vector of the NIC.
pub trait InterruptSource: Send + Sync {
    /// The device-side index of this interrupt, as programmed into queue registers.
    fn index(&self) -> u32;

    /// Registers `handler` to be invoked whenever this interrupt fires.
    ///
    /// Only one handler may be registered at a time.
    fn register(&self, handler: Arc<dyn InterruptHandler>) -> Result<(), InterruptRegistrationError>;

    /// Removes the registered handler, if any.
    fn unregister(&self);
}


/// A bounded queue of deferred work items.
///
/// Interrupt handlers [`schedule()`](DeferredTaskQueue::schedule) items,
/// and the deferred task later takes them back out and runs them.
/// Its storage is allocated up front, so scheduling never allocates.
pub struct DeferredTaskQueue<T> {
    queue: mpmc::Queue<T>,
    /// Invoked after each scheduled item, e.g., to unblock the deferred task.
    notifier: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T: Send> DeferredTaskQueue<T> {
    /// Creates a queue that can hold at least `capacity` pending items.
    pub fn new(capacity: usize) -> DeferredTaskQueue<T> {
        DeferredTaskQueue {
            queue: mpmc::Queue::with_capacity(capacity),
            notifier: None,
        }
    }

    /// Like [`DeferredTaskQueue::new()`], but `notifier` is called each time work is scheduled.
    pub fn with_notifier<N>(capacity: usize, notifier: N) -> DeferredTaskQueue<T>
        where N: Fn() + Send + Sync + 'static
    {
        DeferredTaskQueue {
            queue: mpmc::Queue::with_capacity(capacity),
            notifier: Some(Box::new(notifier)),
        }
    }

    /// Adds `item` to the queue of pending work.
    ///
    /// Returns the item back if the queue is full.
    pub fn schedule(&self, item: T) -> Result<(), T> {
        self.queue.push(item)?;
        if let Some(notify) = self.notifier.as_ref() {
            notify();
        }
        Ok(())
    }

    /// Takes the oldest pending item out of the queue.
    pub fn next(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Repeatedly takes the oldest pending item and passes it to `action`,
    /// until no items are left. `action` may schedule more work.
    ///
    /// Failures are logged and do not stop the loop.
    /// Returns the number of items that were run.
    pub fn run_until_idle<F, E>(&self, mut action: F) -> usize
        where F: FnMut(T) -> Result<(), E>,
              E: fmt::Debug,
    {
        let mut count = 0;
        while let Some(item) = self.next() {
            count += 1;
            if let Err(e) = action(item) {
                error!("Deferred interrupt action returned failure: {:?}", e);
            }
        }
        count
    }
}


/// An interrupt line that fires only when software calls [`SoftInterrupt::fire()`].
pub struct SoftInterrupt {
    index: u32,
    handler: Mutex<Option<Arc<dyn InterruptHandler>>>,
}

impl SoftInterrupt {
    pub fn new(index: u32) -> SoftInterrupt {
        SoftInterrupt { index, handler: Mutex::new(None) }
    }

    /// Invokes the registered handler, as if the interrupt had occurred.
    ///
    /// Returns false if no handler was registered.
    pub fn fire(&self) -> bool {
        // Don't hold the lock while the handler runs, it may unregister itself.
        let handler = self.handler.lock().clone();
        match handler {
            Some(h) => {
                h.handle_interrupt();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl InterruptSource for SoftInterrupt {
    fn index(&self) -> u32 {
        self.index
    }

    fn register(&self, handler: Arc<dyn InterruptHandler>) -> Result<(), InterruptRegistrationError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            error!("Interrupt {} was already taken! Sharing interrupts is unsupported.", self.index);
            return Err(InterruptRegistrationError::InUse { irq: self.index });
        }
        *slot = Some(handler);
        Ok(())
    }

    fn unregister(&self) {
        self.handler.lock().take();
    }
}
