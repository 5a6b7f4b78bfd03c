//! Tables of identical hardware resources (queues) laid out at a fixed stride
//! within an interface's register region.
//!
//! A queue manager block tells the driver where its queues' registers start,
//! how many queues there are, and how far apart their register windows are.
//! A [`ResourceTable`] turns a queue index into the address of that queue's registers,
//! and optionally tracks which indices are in use.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate bit_field;
extern crate register_space;


use alloc::{sync::Arc, vec::Vec};
use bit_field::BitField;
use spin::Mutex;
use register_space::{RegisterError, RegisterSpace, RegisterWindow};


/// The errors returned by a [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// The given index is not less than the table's capacity.
    OutOfRange { index: u32, capacity: u32 },
    /// Every slot of the table is already allocated.
    Exhausted,
    /// This table was opened without allocation tracking.
    Untracked,
    /// The slot's register window does not fit in the register space.
    Register(RegisterError),
}

impl From<RegisterError> for ResourceError {
    fn from(e: RegisterError) -> Self {
        ResourceError::Register(e)
    }
}


/// A fixed-capacity, strided array of register windows, one per resource instance.
pub struct ResourceTable {
    space: Arc<dyn RegisterSpace>,
    capacity: u32,
    base: usize,
    stride: u32,
    /// One bit per slot, set while the slot is allocated. `None` if untracked.
    bitmap: Option<Mutex<Vec<u64>>>,
}

impl ResourceTable {
    /// Opens a table of `capacity` resources whose registers start at offset `base`
    /// of the `space` and repeat every `stride` bytes. Allocation is not tracked.
    pub fn open(space: Arc<dyn RegisterSpace>, capacity: u32, base: usize, stride: u32) -> ResourceTable {
        ResourceTable { space, capacity, base, stride, bitmap: None }
    }

    /// Like [`ResourceTable::open()`], but also tracks which slots are allocated.
    pub fn open_tracked(space: Arc<dyn RegisterSpace>, capacity: u32, base: usize, stride: u32) -> ResourceTable {
        let words = (capacity as usize + 63) / 64;
        ResourceTable {
            space,
            capacity,
            base,
            stride,
            bitmap: Some(Mutex::new(alloc::vec![0u64; words])),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Returns the register-space offset of the resource at `index`.
    pub fn address(&self, index: u32) -> Result<usize, ResourceError> {
        if index >= self.capacity {
            return Err(ResourceError::OutOfRange { index, capacity: self.capacity });
        }
        Ok(self.base + index as usize * self.stride as usize)
    }

    /// Returns the register window of the resource at `index`, `stride` bytes long.
    pub fn window(&self, index: u32) -> Result<RegisterWindow, ResourceError> {
        let address = self.address(index)?;
        RegisterWindow::new(self.space.clone(), address, self.stride as usize).map_err(ResourceError::from)
    }

    /// Allocates the lowest free slot and returns its index.
    pub fn allocate(&self) -> Result<u32, ResourceError> {
        let bitmap = self.bitmap.as_ref().ok_or(ResourceError::Untracked)?;
        let mut words = bitmap.lock();
        for (w, word) in words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = w * 64 + bit;
            if index >= self.capacity as usize {
                break;
            }
            word.set_bit(bit, true);
            return Ok(index as u32);
        }
        Err(ResourceError::Exhausted)
    }

    /// Returns the slot at `index` to the table.
    ///
    /// Freeing an invalid or already-free index does nothing.
    pub fn free(&self, index: u32) {
        let Some(bitmap) = self.bitmap.as_ref() else { return };
        if index >= self.capacity {
            warn!("ResourceTable::free(): ignoring out-of-range index {} (capacity {})", index, self.capacity);
            return;
        }
        let mut words = bitmap.lock();
        words[index as usize / 64].set_bit(index as usize % 64, false);
    }

    /// Returns true if the slot at `index` is currently allocated.
    /// Untracked tables and out-of-range indices report false.
    pub fn is_allocated(&self, index: u32) -> bool {
        match self.bitmap.as_ref() {
            Some(bitmap) if index < self.capacity => {
                bitmap.lock()[index as usize / 64].get_bit(index as usize % 64)
            }
            _ => false,
        }
    }
}
