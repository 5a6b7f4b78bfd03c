//! Defines the memory that NIC rings hand to the device, and the packets and
//! buffers that are sent and received through them.
//!
//! The queue engine never allocates packet memory itself. It works through
//! a few collaborator traits instead:
//! * [`DmaAllocator`] provides the coherent memory that holds descriptor rings,
//! * [`TransmitPacket`] is an outgoing packet made of one or more fragments,
//! * [`ReceiveBufferProvider`] hands out empty [`ReceiveBuffer`]s for receive rings,
//! * [`PacketSink`] consumes every [`ReceivedPacket`].
//!
//! [`DmaTransmitBuffer`], [`DmaReceiveBuffer`] and [`DmaReceiveBufferProvider`]
//! are the default implementations over plain DMA memory,
//! and [`HeapDmaAllocator`] simulates DMA memory on the heap.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate mpmc;
extern crate zerocopy;

mod dma;
mod heap;
#[cfg(test)]
mod test;

pub use dma::{DmaAllocator, DmaBuffer, DmaMemory, PhysicalAddress};
pub use heap::HeapDmaAllocator;

use core::ops::{Deref, DerefMut};
use alloc::{boxed::Box, sync::Arc};


/// The size of one page, the granularity of DMA allocations and receive buffers.
pub const PAGE_SIZE: usize = 4096;

/// One physically-contiguous piece of an outgoing packet, as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub phys_addr: PhysicalAddress,
    pub length: u32,
}

/// A hardware timestamp of a sent or received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HwTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl HwTimestamp {
    pub fn as_nanos(&self) -> u128 {
        self.seconds as u128 * 1_000_000_000 + self.nanoseconds as u128
    }
}


/// A packet waiting to be transmitted.
///
/// A transmit ring maps each fragment when the packet is enqueued
/// and unmaps the packet once the device reports it as sent (or the ring is torn down).
pub trait TransmitPacket: Send {
    /// The number of physically-contiguous fragments in this packet.
    fn fragment_count(&self) -> usize;
    /// The total length of this packet in bytes.
    fn length(&self) -> usize;
    /// Makes fragment `index` visible to the device.
    fn map_fragment(&mut self, index: usize) -> Result<Fragment, &'static str>;
    /// Revokes the device's access to every mapped fragment.
    fn unmap(&mut self);
    /// The checksum-offload command for the first descriptor, or zero for none.
    fn checksum_command(&self) -> u16 {
        0
    }
    /// Whether the sender wants to know when this packet left the wire.
    fn timestamp_requested(&self) -> bool {
        false
    }
    /// Called with the transmit timestamp just before the packet is released.
    fn set_timestamp(&mut self, _timestamp: HwTimestamp) { }
}

/// An empty buffer that a receive ring lends to the device.
pub trait ReceiveBuffer: Send {
    /// The number of bytes the device may write into this buffer.
    fn capacity(&self) -> usize;
    /// Makes the buffer writable by the device and returns its device address.
    fn map(&mut self) -> Result<PhysicalAddress, &'static str>;
    /// Revokes the device's access to this buffer.
    fn unmap(&mut self);
    /// The whole buffer, as last written by the device.
    fn as_slice(&self) -> &[u8];
}

/// Hands out receive buffers.
pub trait ReceiveBufferProvider: Send + Sync {
    /// Returns an unmapped buffer of at least `PAGE_SIZE << page_order` bytes.
    fn allocate(&self, page_order: u32) -> Result<Box<dyn ReceiveBuffer>, &'static str>;
}

/// A packet that the device has written into a [`ReceiveBuffer`].
pub struct ReceivedPacket {
    /// The buffer that holds the packet, already unmapped.
    pub buffer: Box<dyn ReceiveBuffer>,
    /// The number of valid bytes at the start of `buffer`.
    pub length: usize,
    /// The index of the receive queue this packet arrived on.
    pub queue: u32,
    pub timestamp: Option<HwTimestamp>,
    /// The raw checksum computed by the device, if it offloads checksums.
    pub checksum: Option<u16>,
}

impl ReceivedPacket {
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.length]
    }
}

/// Consumes packets received by a receive ring.
///
/// `deliver` is called from deferred-task context and must not block.
/// No queue or ring lock is held while it runs.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: ReceivedPacket);
}


/// A buffer that stores a packet to be transmitted through the NIC
/// and is guaranteed to be contiguous in device memory.
/// Auto-dereferences into a byte slice that covers its current length.
pub struct DmaTransmitBuffer {
    buffer: DmaBuffer,
    length: u16,
    checksum_command: u16,
    timestamp_requested: bool,
    timestamp: Option<HwTimestamp>,
}

impl DmaTransmitBuffer {
    /// Creates a new DmaTransmitBuffer with the specified size in bytes.
    /// The size is a `u16` because that is the maximum size of an NIC transmit buffer.
    pub fn new(allocator: &dyn DmaAllocator, size_in_bytes: u16) -> Result<DmaTransmitBuffer, &'static str> {
        let buffer = allocator.allocate_coherent(size_in_bytes as usize)?;
        Ok(DmaTransmitBuffer {
            buffer,
            length: size_in_bytes,
            checksum_command: 0,
            timestamp_requested: false,
            timestamp: None,
        })
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.buffer.phys_addr()
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the current length.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.length {
            Err("DmaTransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    /// Asks the device to compute and insert a checksum, see the `csum_cmd` descriptor field.
    pub fn set_checksum_command(&mut self, command: u16) {
        self.checksum_command = command;
    }

    pub fn request_timestamp(&mut self) {
        self.timestamp_requested = true;
    }

    /// The transmit timestamp, once the packet has been sent.
    pub fn timestamp(&self) -> Option<HwTimestamp> {
        self.timestamp
    }
}

impl Deref for DmaTransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer.as_slice()[..self.length as usize]
    }
}

impl DerefMut for DmaTransmitBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let length = self.length as usize;
        &mut self.buffer.as_slice_mut()[..length]
    }
}

impl TransmitPacket for DmaTransmitBuffer {
    fn fragment_count(&self) -> usize {
        1
    }

    fn length(&self) -> usize {
        self.length as usize
    }

    fn map_fragment(&mut self, index: usize) -> Result<Fragment, &'static str> {
        if index != 0 {
            return Err("DmaTransmitBuffer has only one fragment");
        }
        Ok(Fragment { phys_addr: self.buffer.phys_addr(), length: self.length as u32 })
    }

    // DMA memory is always visible to the device.
    fn unmap(&mut self) { }

    fn checksum_command(&self) -> u16 {
        self.checksum_command
    }

    fn timestamp_requested(&self) -> bool {
        self.timestamp_requested
    }

    fn set_timestamp(&mut self, timestamp: HwTimestamp) {
        self.timestamp = Some(timestamp);
    }
}


/// A buffer that receives a packet from the NIC
/// and is guaranteed to be contiguous in device memory.
/// When dropped, its underlying memory is automatically returned to its pool for future reuse.
pub struct DmaReceiveBuffer {
    /// Always `Some`, except while being dropped.
    buffer: Option<DmaBuffer>,
    mapped: bool,
    pool: Arc<mpmc::Queue<DmaBuffer>>,
}

impl DmaReceiveBuffer {
    /// Wraps `buffer`, which will be returned to the given `pool` when this object is dropped.
    pub fn new(buffer: DmaBuffer, pool: Arc<mpmc::Queue<DmaBuffer>>) -> DmaReceiveBuffer {
        DmaReceiveBuffer { buffer: Some(buffer), mapped: false, pool }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.buffer.as_ref().map_or(PhysicalAddress::zero(), |b| b.phys_addr())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

impl ReceiveBuffer for DmaReceiveBuffer {
    fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.size_in_bytes())
    }

    fn map(&mut self) -> Result<PhysicalAddress, &'static str> {
        let buffer = self.buffer.as_ref().ok_or("DmaReceiveBuffer has no memory")?;
        self.mapped = true;
        Ok(buffer.phys_addr())
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }

    fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.as_slice())
    }
}

impl Drop for DmaReceiveBuffer {
    fn drop(&mut self) {
        let Some(mut buffer) = self.buffer.take() else { return };
        buffer.zero();
        if let Err(_b) = self.pool.push(buffer) {
            // The pool is full, so the memory is simply released.
            trace!("DmaReceiveBuffer::drop(): pool full, releasing buffer at {:#X}", _b.phys_addr());
        }
    }
}


/// A [`ReceiveBufferProvider`] that recycles the memory of dropped receive buffers.
pub struct DmaReceiveBufferProvider {
    allocator: Arc<dyn DmaAllocator>,
    pool: Arc<mpmc::Queue<DmaBuffer>>,
}

impl DmaReceiveBufferProvider {
    /// Creates a provider whose pool holds up to `pool_capacity` released buffers.
    pub fn new(allocator: Arc<dyn DmaAllocator>, pool_capacity: usize) -> DmaReceiveBufferProvider {
        DmaReceiveBufferProvider {
            allocator,
            pool: Arc::new(mpmc::Queue::with_capacity(pool_capacity)),
        }
    }

    /// Fills the pool with up to `count` buffers of the given page order.
    ///
    /// Returns how many buffers were added.
    pub fn preallocate(&self, count: usize, page_order: u32) -> Result<usize, &'static str> {
        let size = PAGE_SIZE << page_order;
        for added in 0..count {
            let buffer = self.allocator.allocate_coherent(size)?;
            if self.pool.push(buffer).is_err() {
                return Ok(added);
            }
        }
        Ok(count)
    }
}

impl ReceiveBufferProvider for DmaReceiveBufferProvider {
    fn allocate(&self, page_order: u32) -> Result<Box<dyn ReceiveBuffer>, &'static str> {
        let size = PAGE_SIZE << page_order;
        let buffer = loop {
            match self.pool.pop() {
                Some(b) if b.size_in_bytes() >= size => break b,
                // Left over from a different MTU; let it be released.
                Some(_too_small) => continue,
                None => break self.allocator.allocate_coherent(size)?,
            }
        };
        Ok(Box::new(DmaReceiveBuffer::new(buffer, self.pool.clone())))
    }
}
