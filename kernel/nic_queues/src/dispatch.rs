//! The deferred half of completion handling.
//!
//! Event queue interrupts only mark completion queues as scheduled and push them
//! onto the [`Dispatcher`]'s task queue. A deferred task later calls
//! [`Dispatcher::run_until_idle()`] (or [`Dispatcher::poll_once()`]), which
//! processes each completion queue with a fixed budget. A queue that used up
//! its whole budget is pushed back for another pass; otherwise it is re-armed.

use alloc::sync::Arc;
use deferred_interrupt_tasks::DeferredTaskQueue;
use crate::{CompletionHandler, CompletionQueue};


/// Schedules and runs completion queue processing outside of interrupt context.
pub struct Dispatcher {
    tasks: DeferredTaskQueue<Arc<CompletionQueue>>,
    budget: usize,
}

impl Dispatcher {
    /// Creates a dispatcher for up to `max_queues` completion queues,
    /// each processed `budget` records at a time.
    pub fn new(max_queues: usize, budget: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            tasks: DeferredTaskQueue::new(max_queues),
            budget: budget.max(1),
        })
    }

    /// Like [`Dispatcher::new()`], but `notifier` is called whenever work is scheduled,
    /// e.g., to unblock the deferred task.
    pub fn with_notifier<N>(max_queues: usize, budget: usize, notifier: N) -> Arc<Dispatcher>
        where N: Fn() + Send + Sync + 'static
    {
        Arc::new(Dispatcher {
            tasks: DeferredTaskQueue::with_notifier(max_queues, notifier),
            budget: budget.max(1),
        })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Processes the next scheduled completion queue, if any.
    ///
    /// Returns false if nothing was scheduled.
    pub fn poll_once(&self) -> bool {
        match self.tasks.next() {
            Some(cq) => {
                self.run(cq);
                true
            }
            None => false,
        }
    }

    /// Processes scheduled completion queues until none are left.
    /// Returns the number of passes made.
    pub fn run_until_idle(&self) -> usize {
        self.tasks.run_until_idle(|cq| {
            self.run(cq);
            Ok::<(), ()>(())
        })
    }

    fn run(&self, cq: Arc<CompletionQueue>) {
        let done = cq.process(self.budget);
        if done >= self.budget {
            // More may be pending; stay scheduled and go around again.
            if let Err(cq) = self.tasks.schedule(cq) {
                error!("Dispatcher: task queue full, re-arming CQ {} early", cq.index());
                cq.clear_scheduled();
                cq.arm();
            }
        } else {
            cq.clear_scheduled();
            cq.arm();
        }
    }
}

impl CompletionHandler for Dispatcher {
    fn completion_event(&self, cq: &Arc<CompletionQueue>) {
        if !cq.try_schedule() {
            return;
        }
        if let Err(cq) = self.tasks.schedule(cq.clone()) {
            error!("Dispatcher: task queue full, dropping event for CQ {}", cq.index());
            cq.clear_scheduled();
        }
    }
}
