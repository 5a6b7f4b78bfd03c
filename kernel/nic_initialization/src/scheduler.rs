//! Transmit schedulers, which decide when the device services each TX queue.

use alloc::sync::Arc;
use register_space::RegisterSpace;
use reg_blocks::RegisterBlock;
use nic_resources::ResourceTable;
use crate::regs::*;


/// Turns servicing of individual TX queues on and off.
pub trait TxScheduler: Send + Sync {
    fn enable_queue(&self, tx_queue: u32) -> Result<(), &'static str>;
    fn disable_queue(&self, tx_queue: u32);
}


/// The device's round-robin scheduler, with one enable register per TX queue.
pub struct RoundRobinScheduler {
    block: RegisterBlock,
    queues: ResourceTable,
}

impl RoundRobinScheduler {
    /// Sets up the scheduler described by `block`, whose queue registers lie within
    /// the interface region that starts at `if_base` in `space`.
    pub fn new(space: Arc<dyn RegisterSpace>, if_base: usize, block: RegisterBlock) -> Result<RoundRobinScheduler, &'static str> {
        let read = |offset| block.read_u32(offset).map_err(|_| "RoundRobinScheduler: failed to read block registers");
        let offset = read(QM_REG_OFFSET)? as usize;
        let count = read(QM_REG_COUNT)?;
        let stride = read(QM_REG_STRIDE)?;
        debug!("RoundRobinScheduler: {} queues at {:#X}, stride {:#X}", count, offset, stride);
        Ok(RoundRobinScheduler {
            queues: ResourceTable::open(space, count, if_base + offset, stride),
            block,
        })
    }

    /// Starts the scheduler as a whole.
    pub fn enable(&self) -> Result<(), &'static str> {
        self.block.write_u32(SCHED_RR_REG_CTRL, 1).map_err(|_| "RoundRobinScheduler: failed to enable")
    }

    pub fn disable(&self) {
        if self.block.write_u32(SCHED_RR_REG_CTRL, 0).is_err() {
            error!("RoundRobinScheduler: failed to disable");
        }
    }

    fn write_queue(&self, tx_queue: u32, value: u32) -> Result<(), &'static str> {
        let regs = self.queues.window(tx_queue).map_err(|_| "RoundRobinScheduler: no such queue")?;
        regs.try_write_u32(0, value).map_err(|_| "RoundRobinScheduler: failed to write queue register")
    }
}

impl TxScheduler for RoundRobinScheduler {
    fn enable_queue(&self, tx_queue: u32) -> Result<(), &'static str> {
        self.write_queue(tx_queue, SCHED_RR_QUEUE_ENABLE)
    }

    fn disable_queue(&self, tx_queue: u32) {
        if let Err(e) = self.write_queue(tx_queue, 0) {
            error!("{} (queue {})", e, tx_queue);
        }
    }
}
