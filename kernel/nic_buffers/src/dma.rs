//! Physically-contiguous, device-visible memory.

use alloc::boxed::Box;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use zerocopy::{AsBytes, FromBytes};


/// An address as seen by the device when it performs DMA.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(value: u64) -> PhysicalAddress {
        PhysicalAddress(value)
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The low 32 bits, as programmed into a base-address-low register.
    pub const fn low_u32(&self) -> u32 {
        self.0 as u32
    }

    /// The high 32 bits, as programmed into a base-address-high register.
    pub const fn high_u32(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn offset(&self, bytes: u64) -> PhysicalAddress {
        PhysicalAddress(self.0 + bytes)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysicalAddress({:#X})", self.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// A region of memory that both the CPU and the device can access.
///
/// Implementors release the memory when dropped. They must be `Sync`,
/// since buffers are shared through lock-free pools.
pub trait DmaMemory: Send + Sync {
    /// The starting virtual address of the region, as seen by the CPU.
    fn virt_addr(&self) -> NonNull<u8>;
    /// The starting address of the region, as seen by the device.
    fn phys_addr(&self) -> PhysicalAddress;
    /// The size of the region in bytes.
    fn size_in_bytes(&self) -> usize;
}

/// Hands out coherent DMA memory, e.g., physically-contiguous uncached pages.
pub trait DmaAllocator: Send + Sync {
    /// Allocates a zero-filled, physically-contiguous region of at least `size_in_bytes` bytes.
    fn allocate_coherent(&self, size_in_bytes: usize) -> Result<DmaBuffer, &'static str>;
}


/// An exclusively-owned region of DMA memory.
///
/// The memory is returned to its allocator exactly once, when this buffer is dropped.
pub struct DmaBuffer {
    mem: Box<dyn DmaMemory>,
}

impl DmaBuffer {
    pub fn new(mem: Box<dyn DmaMemory>) -> DmaBuffer {
        DmaBuffer { mem }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.mem.phys_addr()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.mem.size_in_bytes()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is valid for `size_in_bytes` bytes for as long as `self.mem` lives.
        unsafe { core::slice::from_raw_parts(self.mem.virt_addr().as_ptr(), self.mem.size_in_bytes()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive CPU-side access.
        unsafe { core::slice::from_raw_parts_mut(self.mem.virt_addr().as_ptr(), self.mem.size_in_bytes()) }
    }

    /// Reads a `T` that the device may have written at byte `offset`.
    ///
    /// Returns `None` if `T` does not fit at that offset.
    pub fn read_at<T: FromBytes>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        // Order this read after the device-written index that told us the record was ready.
        core::sync::atomic::fence(Ordering::Acquire);
        T::read_from(self.as_slice().get(offset..end)?)
    }

    /// Writes `value` at byte `offset`, for the device to read.
    ///
    /// Returns `None` if `T` does not fit at that offset.
    pub fn write_at<T: AsBytes>(&mut self, offset: usize, value: &T) -> Option<()> {
        let bytes = value.as_bytes();
        let end = offset.checked_add(bytes.len())?;
        self.as_slice_mut().get_mut(offset..end)?.copy_from_slice(bytes);
        core::sync::atomic::fence(Ordering::Release);
        Some(())
    }

    /// Fills the whole buffer with zeros.
    pub fn zero(&mut self) {
        self.as_slice_mut().fill(0);
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DmaBuffer {{ phys_addr: {:#X}, size: {} }}", self.phys_addr(), self.size_in_bytes())
    }
}
