//! A [`DmaAllocator`] backed by the kernel heap, for devices that are simulated.
//!
//! Each allocation is page-aligned and is assigned a synthetic device address.
//! The "device" side can then read and write the allocations by device address
//! through [`HeapDmaAllocator::device_read()`] and [`HeapDmaAllocator::device_write()`].

use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    boxed::Box,
    collections::BTreeMap,
    sync::Arc,
    vec::Vec,
};
use core::ptr::NonNull;
use spin::Mutex;
use crate::{DmaAllocator, DmaBuffer, DmaMemory, PhysicalAddress, PAGE_SIZE};

/// The first synthetic device address handed out.
const FIRST_DEVICE_ADDRESS: u64 = 0x1_0000_0000;

struct Region {
    virt: usize,
    size: usize,
}

#[derive(Default)]
struct Inner {
    /// Live allocations, keyed by their device address.
    regions: BTreeMap<u64, Region>,
    next_device_address: u64,
    /// How many more allocations may succeed. `None` means unlimited.
    remaining: Option<usize>,
}

impl Inner {
    /// Finds the live region containing `phys..phys + len`.
    fn locate(&self, phys: PhysicalAddress, len: usize) -> Result<*mut u8, &'static str> {
        let addr = phys.value();
        let (start, region) = self.regions.range(..=addr).next_back()
            .ok_or("HeapDmaAllocator: no allocation at that device address")?;
        let offset = (addr - start) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= region.size => Ok((region.virt + offset) as *mut u8),
            _ => Err("HeapDmaAllocator: device access runs past the end of its allocation"),
        }
    }
}


/// A heap-backed DMA allocator with a software "device" view of its memory.
#[derive(Clone)]
pub struct HeapDmaAllocator {
    inner: Arc<Mutex<Inner>>,
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        HeapDmaAllocator::new()
    }
}

impl HeapDmaAllocator {
    pub fn new() -> HeapDmaAllocator {
        HeapDmaAllocator {
            inner: Arc::new(Mutex::new(Inner {
                next_device_address: FIRST_DEVICE_ADDRESS,
                ..Default::default()
            })),
        }
    }

    /// Lets only the next `count` allocations succeed; later ones fail.
    pub fn fail_after(&self, count: usize) {
        self.inner.lock().remaining = Some(count);
    }

    /// Removes any limit set by [`HeapDmaAllocator::fail_after()`].
    pub fn unlimited(&self) {
        self.inner.lock().remaining = None;
    }

    /// The number of allocations that have not been dropped yet.
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Copies `data` into DMA memory at device address `phys`, as the device would.
    pub fn device_write(&self, phys: PhysicalAddress, data: &[u8]) -> Result<(), &'static str> {
        let inner = self.inner.lock();
        let dst = inner.locate(phys, data.len())?;
        // SAFETY: `locate` checked that the destination lies within a live allocation.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Copies `len` bytes out of DMA memory at device address `phys`, as the device would.
    pub fn device_read(&self, phys: PhysicalAddress, len: usize) -> Result<Vec<u8>, &'static str> {
        let inner = self.inner.lock();
        let src = inner.locate(phys, len)?;
        let mut out = alloc::vec![0u8; len];
        // SAFETY: `locate` checked that the source lies within a live allocation.
        unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        Ok(out)
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate_coherent(&self, size_in_bytes: usize) -> Result<DmaBuffer, &'static str> {
        if size_in_bytes == 0 {
            return Err("HeapDmaAllocator: cannot allocate zero bytes");
        }
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.remaining.as_mut() {
            if *remaining == 0 {
                return Err("HeapDmaAllocator: out of DMA memory");
            }
            *remaining -= 1;
        }

        let size = (size_in_bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| "HeapDmaAllocator: invalid allocation size")?;
        // SAFETY: the layout has a non-zero size.
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or("HeapDmaAllocator: heap allocation failed")?;

        let phys = PhysicalAddress::new(inner.next_device_address);
        inner.next_device_address += size as u64;
        inner.regions.insert(phys.value(), Region { virt: virt.as_ptr() as usize, size });

        Ok(DmaBuffer::new(Box::new(HeapDmaMemory {
            virt,
            phys,
            layout,
            owner: self.inner.clone(),
        })))
    }
}


struct HeapDmaMemory {
    virt: NonNull<u8>,
    phys: PhysicalAddress,
    layout: Layout,
    owner: Arc<Mutex<Inner>>,
}

// The memory is exclusively owned; the pointer is only shared with the simulated device.
unsafe impl Send for HeapDmaMemory {}
// Shared references only expose the addresses; the bytes are reached through `&mut DmaBuffer`.
unsafe impl Sync for HeapDmaMemory {}

impl DmaMemory for HeapDmaMemory {
    fn virt_addr(&self) -> NonNull<u8> {
        self.virt
    }

    fn phys_addr(&self) -> PhysicalAddress {
        self.phys
    }

    fn size_in_bytes(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapDmaMemory {
    fn drop(&mut self) {
        // Remove the region first so the device can no longer reach it.
        self.owner.lock().regions.remove(&self.phys.value());
        // SAFETY: `virt` was allocated with exactly this layout and is freed only here.
        unsafe { dealloc(self.virt.as_ptr(), self.layout) };
    }
}
