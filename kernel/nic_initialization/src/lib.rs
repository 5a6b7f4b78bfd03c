//! Bring-up of one NIC interface on top of the queue engine.
//!
//! [`NicInterface::create()`] discovers the interface's register blocks, reads
//! its capabilities, sets up one table per queue type, and starts one event
//! queue per interrupt. TX and RX queues are then opened and closed on demand,
//! each with its own completion queue, spread round-robin over the event queues.
//!
//! Completion processing happens in [`NicInterface::poll()`], which the owner
//! of the interface is expected to call from a deferred task.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
extern crate spin;
extern crate register_space;
extern crate reg_blocks;
extern crate nic_resources;
extern crate nic_buffers;
extern crate nic_queues;
extern crate deferred_interrupt_tasks;

pub mod regs;
mod phc;
mod scheduler;
mod registry;

pub use regs::InterfaceFeatures;
pub use phc::PhcClock;
pub use scheduler::{RoundRobinScheduler, TxScheduler};
pub use registry::DeviceRegistry;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use register_space::{RegisterError, RegisterSpace};
use reg_blocks::{BlockDirectory, DiscoveryError, RegisterBlock, ANY_VERSION, RB_TYPE_EQM, RB_TYPE_IF_CTRL,
    RB_TYPE_PHC, RB_TYPE_RX_CQM, RB_TYPE_RX_QM, RB_TYPE_SCHED_RR, RB_TYPE_TX_CQM, RB_TYPE_TX_QM};
use nic_resources::{ResourceError, ResourceTable};
use nic_buffers::{DmaAllocator, PacketSink, ReceiveBufferProvider};
use nic_queues::{
    CompletionKind, CompletionQueue, Dispatcher, EventQueue, PtpClock, QueueError, RxRing,
    TimestampReconstructor, TxRing,
};
use nic_queues::regs::{ETH_HLEN, QUEUE_ACTIVE_LOG_SIZE_REG};
use deferred_interrupt_tasks::InterruptSource;
use regs::*;


/// The errors that can occur while bringing up or using an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceError {
    /// A required register block of the given type was not found.
    MissingBlock(u32),
    /// No interrupt sources were given, or the interface has no event queues.
    NoInterrupts,
    /// The requested MTU exceeds what the interface supports.
    InvalidMtu { mtu: u32, max: u32 },
    Discovery(DiscoveryError),
    Resource(ResourceError),
    Queue(QueueError),
    Register(RegisterError),
}

impl From<DiscoveryError> for InterfaceError {
    fn from(e: DiscoveryError) -> Self {
        InterfaceError::Discovery(e)
    }
}

impl From<ResourceError> for InterfaceError {
    fn from(e: ResourceError) -> Self {
        InterfaceError::Resource(e)
    }
}

impl From<QueueError> for InterfaceError {
    fn from(e: QueueError) -> Self {
        InterfaceError::Queue(e)
    }
}

impl From<RegisterError> for InterfaceError {
    fn from(e: RegisterError) -> Self {
        InterfaceError::Register(e)
    }
}

impl fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterfaceError::MissingBlock(kind) => write!(f, "required register block {:#010X} not found", kind),
            InterfaceError::NoInterrupts => write!(f, "no interrupts available for event queues"),
            InterfaceError::InvalidMtu { mtu, max } => write!(f, "MTU {} exceeds maximum of {}", mtu, max),
            InterfaceError::Discovery(e) => write!(f, "register block discovery failed: {:?}", e),
            InterfaceError::Resource(e) => write!(f, "queue table error: {:?}", e),
            InterfaceError::Queue(e) => write!(f, "{}", e),
            InterfaceError::Register(e) => write!(f, "{}", e),
        }
    }
}


/// Sizes and limits used when bringing up an interface and opening its queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub event_queue_size: u32,
    /// Slots per TX ring, and records per TX completion queue.
    pub tx_ring_size: u32,
    /// Slots per RX ring, and records per RX completion queue.
    pub rx_ring_size: u32,
    /// Descriptors per TX slot, capped at what the device supports.
    pub tx_desc_block_size: u32,
    /// Programmed during bring-up if set; otherwise the interface's current MTU is kept.
    pub mtu: Option<u32>,
    /// Completion records processed per completion queue per pass.
    pub budget: usize,
    /// Completion queues that can be waiting for processing at once.
    pub dispatch_queue_depth: usize,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            event_queue_size: 1024,
            tx_ring_size: 1024,
            rx_ring_size: 1024,
            tx_desc_block_size: 4,
            mtu: None,
            budget: 64,
            dispatch_queue_depth: 256,
        }
    }
}


/// An open transmit queue: its ring and the completion queue that completes it.
#[derive(Clone)]
pub struct TxQueue {
    pub ring: Arc<TxRing>,
    pub cq: Arc<CompletionQueue>,
}

/// An open receive queue: its ring and the completion queue that completes it.
#[derive(Clone)]
pub struct RxQueue {
    pub ring: Arc<RxRing>,
    pub cq: Arc<CompletionQueue>,
}


/// The queue tables of an interface, one per queue type.
struct QueueTables {
    eq: ResourceTable,
    tx: ResourceTable,
    tx_cq: ResourceTable,
    rx: ResourceTable,
    rx_cq: ResourceTable,
}

/// One NIC interface and all of its queues.
pub struct NicInterface {
    directory: BlockDirectory,
    if_ctrl: RegisterBlock,
    features: InterfaceFeatures,
    port_count: u32,
    sched_count: u32,
    max_tx_mtu: u32,
    max_rx_mtu: u32,
    max_desc_block_size: u32,
    tables: QueueTables,
    config: InterfaceConfig,
    allocator: Arc<dyn DmaAllocator>,
    dispatcher: Arc<Dispatcher>,
    clock: Option<Arc<PhcClock>>,
    scheduler: Mutex<Option<Arc<dyn TxScheduler>>>,
    event_queues: Vec<Arc<EventQueue>>,
    next_eq: AtomicUsize,
    tx_queues: Mutex<Vec<TxQueue>>,
    rx_queues: Mutex<Vec<RxQueue>>,
}

impl NicInterface {
    /// Brings up the interface whose register region of `region_size` bytes starts at `base` in `space`.
    ///
    /// One event queue is started per entry of `irqs`, up to the number the interface has.
    /// If the interface has a round-robin scheduler block, it is used to enable TX queues.
    pub fn create(
        space: Arc<dyn RegisterSpace>,
        base: usize,
        region_size: usize,
        allocator: Arc<dyn DmaAllocator>,
        irqs: Vec<Arc<dyn InterruptSource>>,
        config: InterfaceConfig,
    ) -> Result<NicInterface, InterfaceError> {
        let directory = BlockDirectory::enumerate(space.clone(), base, 0, region_size)?;
        debug!("NicInterface: found {} register blocks at {:#X}", directory.len(), base);

        let if_ctrl = directory.find(RB_TYPE_IF_CTRL, ANY_VERSION, 0)
            .ok_or(InterfaceError::MissingBlock(RB_TYPE_IF_CTRL))?
            .clone();
        let features = InterfaceFeatures::from_bits_truncate(if_ctrl.read_u32(IF_CTRL_REG_FEATURES)?);
        let port_count = if_ctrl.read_u32(IF_CTRL_REG_PORT_COUNT)?;
        let sched_count = if_ctrl.read_u32(IF_CTRL_REG_SCHED_COUNT)?;
        let max_tx_mtu = if_ctrl.read_u32(IF_CTRL_REG_MAX_TX_MTU)?;
        let max_rx_mtu = if_ctrl.read_u32(IF_CTRL_REG_MAX_RX_MTU)?;
        info!("NicInterface: features {:?}, {} ports, {} schedulers, max MTU TX {} RX {}",
            features, port_count, sched_count, max_tx_mtu, max_rx_mtu);

        let table = |kind: u32| -> Result<ResourceTable, InterfaceError> {
            let block = directory.find(kind, ANY_VERSION, 0).ok_or(InterfaceError::MissingBlock(kind))?;
            let offset = block.read_u32(QM_REG_OFFSET)? as usize;
            let count = block.read_u32(QM_REG_COUNT)?;
            let stride = block.read_u32(QM_REG_STRIDE)?;
            debug!("NicInterface: block {:#010X}: {} queues at {:#X}, stride {:#X}", kind, count, offset, stride);
            Ok(ResourceTable::open_tracked(space.clone(), count, base + offset, stride))
        };
        let tables = QueueTables {
            eq: table(RB_TYPE_EQM)?,
            tx: table(RB_TYPE_TX_QM)?,
            tx_cq: table(RB_TYPE_TX_CQM)?,
            rx: table(RB_TYPE_RX_QM)?,
            rx_cq: table(RB_TYPE_RX_CQM)?,
        };

        let max_desc_block_size = probe_desc_block_size(&tables.tx)?;
        debug!("NicInterface: max descriptor block size {}", max_desc_block_size);

        let clock = match directory.find(RB_TYPE_PHC, ANY_VERSION, 0) {
            Some(block) => Some(Arc::new(PhcClock::new(block.clone()))),
            None => {
                if features.contains(InterfaceFeatures::PTP_TS) {
                    warn!("NicInterface: timestamping is supported but there is no PHC block");
                }
                None
            }
        };

        let scheduler: Option<Arc<dyn TxScheduler>> = match directory.find(RB_TYPE_SCHED_RR, ANY_VERSION, 0) {
            Some(block) => {
                let sched = RoundRobinScheduler::new(space.clone(), base, block.clone())
                    .map_err(QueueError::External)?;
                sched.enable().map_err(QueueError::External)?;
                Some(Arc::new(sched) as Arc<dyn TxScheduler>)
            }
            None => {
                warn!("NicInterface: no scheduler block, TX queues must be enabled externally");
                None
            }
        };

        let depth = config.dispatch_queue_depth
            .max((tables.tx_cq.capacity() + tables.rx_cq.capacity()) as usize);
        let mut nic = NicInterface {
            directory,
            if_ctrl,
            features,
            port_count,
            sched_count,
            max_tx_mtu,
            max_rx_mtu,
            max_desc_block_size,
            tables,
            config,
            allocator,
            dispatcher: Dispatcher::new(depth, config.budget),
            clock,
            scheduler: Mutex::new(scheduler),
            event_queues: Vec::new(),
            next_eq: AtomicUsize::new(0),
            tx_queues: Mutex::new(Vec::new()),
            rx_queues: Mutex::new(Vec::new()),
        };

        if let Err(e) = nic.start_event_queues(irqs) {
            nic.shutdown();
            return Err(e);
        }
        if let Some(mtu) = config.mtu {
            if let Err(e) = nic.set_mtu(mtu) {
                nic.shutdown();
                return Err(e);
            }
        }
        Ok(nic)
    }

    /// Opens, activates and arms one event queue per interrupt.
    fn start_event_queues(&mut self, irqs: Vec<Arc<dyn InterruptSource>>) -> Result<(), InterfaceError> {
        let count = (self.tables.eq.capacity() as usize).min(irqs.len());
        if count == 0 {
            return Err(InterfaceError::NoInterrupts);
        }
        if irqs.len() > count {
            warn!("NicInterface: only {} of {} interrupts get an event queue", count, irqs.len());
        }

        for irq in irqs.into_iter().take(count) {
            let index = self.tables.eq.allocate()?;
            let eq = EventQueue::new(
                index,
                self.tables.eq.window(index)?,
                self.tables.tx_cq.capacity(),
                self.tables.rx_cq.capacity(),
            );
            // Pushed first, so that shutdown releases it if starting fails.
            self.event_queues.push(eq.clone());
            eq.open(&*self.allocator, self.config.event_queue_size)?;
            eq.activate(irq)?;
            eq.arm();
        }
        Ok(())
    }

    /// The event queue for the next completion queue.
    fn next_event_queue(&self) -> Result<Arc<EventQueue>, InterfaceError> {
        if self.event_queues.is_empty() {
            return Err(InterfaceError::NoInterrupts);
        }
        let n = self.next_eq.fetch_add(1, Ordering::Relaxed) % self.event_queues.len();
        Ok(self.event_queues[n].clone())
    }

    fn timestamps(&self) -> Option<Arc<TimestampReconstructor>> {
        if !self.features.contains(InterfaceFeatures::PTP_TS) {
            return None;
        }
        let clock: Arc<dyn PtpClock> = self.clock.clone()?;
        Some(Arc::new(TimestampReconstructor::new(clock)))
    }

    /// Opens a TX queue and its completion queue, and enables the queue in the scheduler.
    pub fn open_tx_queue(&self) -> Result<TxQueue, InterfaceError> {
        let tx_index = self.tables.tx.allocate()?;
        let cq_index = match self.tables.tx_cq.allocate() {
            Ok(i) => i,
            Err(e) => {
                self.tables.tx.free(tx_index);
                return Err(e.into());
            }
        };
        let queue = match self.start_tx_queue(tx_index, cq_index) {
            Ok(q) => q,
            Err(e) => {
                error!("NicInterface: failed to open TX queue {}: {}", tx_index, e);
                self.tables.tx_cq.free(cq_index);
                self.tables.tx.free(tx_index);
                return Err(e);
            }
        };
        self.tx_queues.lock().push(queue.clone());
        Ok(queue)
    }

    fn start_tx_queue(&self, tx_index: u32, cq_index: u32) -> Result<TxQueue, InterfaceError> {
        let ring = TxRing::new(tx_index, self.tables.tx.window(tx_index)?);
        let cq = CompletionQueue::new(
            cq_index,
            CompletionKind::Transmit,
            self.tables.tx_cq.window(cq_index)?,
            self.dispatcher.clone(),
        );
        let queue = TxQueue { ring, cq };
        let desc_block_size = self.config.tx_desc_block_size.min(self.max_desc_block_size);

        let result = (|| {
            queue.ring.open(&*self.allocator, self.config.tx_ring_size, desc_block_size)?;
            queue.cq.open(&*self.allocator, self.config.tx_ring_size)?;
            queue.cq.activate(&self.next_event_queue()?, queue.ring.clone())?;
            queue.ring.set_checksum_offload(self.features.contains(InterfaceFeatures::TX_CSUM));
            if let Some(ts) = self.timestamps() {
                queue.ring.enable_timestamps(ts);
            }
            queue.ring.activate()?;
            let scheduler = self.scheduler.lock().clone();
            if let Some(sched) = scheduler {
                sched.enable_queue(tx_index).map_err(QueueError::External)?;
            }
            Ok::<(), InterfaceError>(())
        })();

        match result {
            Ok(()) => {
                debug!("NicInterface: opened TX queue {} with CQ {}", tx_index, cq_index);
                Ok(queue)
            }
            Err(e) => {
                stop_tx_queue(&queue, None);
                Err(e)
            }
        }
    }

    /// Opens an RX queue and its completion queue, and fills the ring with buffers from `provider`.
    /// Received packets are passed to `sink`.
    pub fn open_rx_queue(
        &self,
        provider: Arc<dyn ReceiveBufferProvider>,
        sink: Arc<dyn PacketSink>,
    ) -> Result<RxQueue, InterfaceError> {
        let rx_index = self.tables.rx.allocate()?;
        let cq_index = match self.tables.rx_cq.allocate() {
            Ok(i) => i,
            Err(e) => {
                self.tables.rx.free(rx_index);
                return Err(e.into());
            }
        };
        let queue = match self.start_rx_queue(rx_index, cq_index, provider, sink) {
            Ok(q) => q,
            Err(e) => {
                error!("NicInterface: failed to open RX queue {}: {}", rx_index, e);
                self.tables.rx_cq.free(cq_index);
                self.tables.rx.free(rx_index);
                return Err(e);
            }
        };
        self.rx_queues.lock().push(queue.clone());
        Ok(queue)
    }

    fn start_rx_queue(
        &self,
        rx_index: u32,
        cq_index: u32,
        provider: Arc<dyn ReceiveBufferProvider>,
        sink: Arc<dyn PacketSink>,
    ) -> Result<RxQueue, InterfaceError> {
        let ring = RxRing::new(rx_index, self.tables.rx.window(rx_index)?, provider, sink);
        let cq = CompletionQueue::new(
            cq_index,
            CompletionKind::Receive,
            self.tables.rx_cq.window(cq_index)?,
            self.dispatcher.clone(),
        );
        let queue = RxQueue { ring, cq };
        let mtu = self.mtu()?;

        let result = (|| {
            queue.ring.open(&*self.allocator, self.config.rx_ring_size, 1, mtu)?;
            queue.cq.open(&*self.allocator, self.config.rx_ring_size)?;
            queue.cq.activate(&self.next_event_queue()?, queue.ring.clone())?;
            queue.ring.set_checksum_offload(self.features.contains(InterfaceFeatures::RX_CSUM));
            if let Some(ts) = self.timestamps() {
                queue.ring.enable_timestamps(ts);
            }
            queue.ring.activate()?;
            Ok::<(), InterfaceError>(())
        })();

        match result {
            Ok(()) => {
                debug!("NicInterface: opened RX queue {} with CQ {}", rx_index, cq_index);
                Ok(queue)
            }
            Err(e) => {
                stop_rx_queue(&queue);
                Err(e)
            }
        }
    }

    /// Closes a TX queue opened by [`NicInterface::open_tx_queue()`], dropping any packets still in it.
    pub fn close_tx_queue(&self, queue: &TxQueue) {
        let index = queue.ring.index();
        let removed = {
            let mut queues = self.tx_queues.lock();
            let before = queues.len();
            queues.retain(|q| !Arc::ptr_eq(&q.ring, &queue.ring));
            queues.len() != before
        };
        if !removed {
            warn!("NicInterface: TX queue {} is not open", index);
            return;
        }
        let sched = self.scheduler.lock().clone();
        stop_tx_queue(queue, sched.as_deref());
        self.tables.tx_cq.free(queue.cq.index());
        self.tables.tx.free(index);
        debug!("NicInterface: closed TX queue {}", index);
    }

    /// Closes an RX queue opened by [`NicInterface::open_rx_queue()`], releasing its buffers.
    pub fn close_rx_queue(&self, queue: &RxQueue) {
        let index = queue.ring.index();
        let removed = {
            let mut queues = self.rx_queues.lock();
            let before = queues.len();
            queues.retain(|q| !Arc::ptr_eq(&q.ring, &queue.ring));
            queues.len() != before
        };
        if !removed {
            warn!("NicInterface: RX queue {} is not open", index);
            return;
        }
        stop_rx_queue(queue);
        self.tables.rx_cq.free(queue.cq.index());
        self.tables.rx.free(index);
        debug!("NicInterface: closed RX queue {}", index);
    }

    /// Processes pending completions of all queues. Returns the number of passes made.
    pub fn poll(&self) -> usize {
        self.dispatcher.run_until_idle()
    }

    /// Programs the MTU of both directions and resizes the buffers of later RX refills.
    pub fn set_mtu(&self, mtu: u32) -> Result<(), InterfaceError> {
        let frame = mtu.saturating_add(ETH_HLEN);
        if frame > self.max_tx_mtu || frame > self.max_rx_mtu {
            let max = self.max_tx_mtu.min(self.max_rx_mtu).saturating_sub(ETH_HLEN);
            return Err(InterfaceError::InvalidMtu { mtu, max });
        }
        self.if_ctrl.write_u32(IF_CTRL_REG_TX_MTU, frame)?;
        self.if_ctrl.write_u32(IF_CTRL_REG_RX_MTU, frame)?;
        for queue in self.rx_queues.lock().iter() {
            queue.ring.set_mtu(mtu);
        }
        info!("NicInterface: MTU set to {}", mtu);
        Ok(())
    }

    /// The current receive MTU, not counting the Ethernet header.
    pub fn mtu(&self) -> Result<u32, InterfaceError> {
        Ok(self.if_ctrl.read_u32(IF_CTRL_REG_RX_MTU)?.saturating_sub(ETH_HLEN))
    }

    /// Replaces the scheduler used to enable TX queues opened from now on.
    pub fn set_scheduler(&self, scheduler: Arc<dyn TxScheduler>) {
        *self.scheduler.lock() = Some(scheduler);
    }

    /// Closes every open queue and stops all event queues.
    /// Also done when the interface is dropped; calling it again does nothing.
    pub fn shutdown(&self) {
        let tx_queues: Vec<TxQueue> = self.tx_queues.lock().clone();
        for queue in tx_queues.iter() {
            self.close_tx_queue(queue);
        }
        let rx_queues: Vec<RxQueue> = self.rx_queues.lock().clone();
        for queue in rx_queues.iter() {
            self.close_rx_queue(queue);
        }
        for eq in self.event_queues.iter() {
            eq.close();
            self.tables.eq.free(eq.index());
        }
        info!("NicInterface: shut down");
    }

    pub fn directory(&self) -> &BlockDirectory {
        &self.directory
    }

    pub fn features(&self) -> InterfaceFeatures {
        self.features
    }

    pub fn port_count(&self) -> u32 {
        self.port_count
    }

    pub fn sched_count(&self) -> u32 {
        self.sched_count
    }

    pub fn max_tx_mtu(&self) -> u32 {
        self.max_tx_mtu
    }

    pub fn max_rx_mtu(&self) -> u32 {
        self.max_rx_mtu
    }

    /// The largest number of descriptors per TX slot the device supports.
    pub fn max_desc_block_size(&self) -> u32 {
        self.max_desc_block_size
    }

    pub fn event_queues(&self) -> &[Arc<EventQueue>] {
        &self.event_queues
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn clock(&self) -> Option<&Arc<PhcClock>> {
        self.clock.as_ref()
    }

    pub fn tx_queue_count(&self) -> usize {
        self.tx_queues.lock().len()
    }

    pub fn rx_queue_count(&self) -> usize {
        self.rx_queues.lock().len()
    }

    pub fn tx_table(&self) -> &ResourceTable {
        &self.tables.tx
    }

    pub fn rx_table(&self) -> &ResourceTable {
        &self.tables.rx
    }
}


impl Drop for NicInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}


/// Finds the largest descriptor block size by writing the maximum log2 size to
/// TX queue 0's control register and reading back what the device kept.
fn probe_desc_block_size(tx: &ResourceTable) -> Result<u32, InterfaceError> {
    let regs = tx.window(0)?;
    regs.try_write_u32(QUEUE_ACTIVE_LOG_SIZE_REG, DESC_BLOCK_PROBE)?;
    let log = (regs.try_read_u32(QUEUE_ACTIVE_LOG_SIZE_REG)? >> 8) & 0xF;
    regs.try_write_u32(QUEUE_ACTIVE_LOG_SIZE_REG, 0)?;
    Ok(1 << log)
}

fn stop_tx_queue(queue: &TxQueue, scheduler: Option<&dyn TxScheduler>) {
    if let Some(sched) = scheduler {
        sched.disable_queue(queue.ring.index());
    }
    queue.ring.deactivate();
    queue.cq.deactivate();
    queue.ring.close();
    queue.cq.close();
}

fn stop_rx_queue(queue: &RxQueue) {
    queue.ring.deactivate();
    queue.cq.deactivate();
    queue.ring.close();
    queue.cq.close();
}
