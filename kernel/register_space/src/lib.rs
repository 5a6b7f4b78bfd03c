//! Access to a device's flat, memory-mapped register region.
//!
//! Every functional unit of the NIC (interface control, queue managers, the
//! individual queues themselves) is reached through a byte offset into one
//! register region. This crate provides:
//! * [`RegisterSpace`], the trait that a mapped region implements,
//! * [`MmioRegion`], the implementation over real memory-mapped I/O,
//! * [`RamRegisterSpace`], a RAM-backed region that records every write,
//!   used when the device is simulated or driven from outside the process,
//! * [`RegisterWindow`], a cheap, cloneable, bounds-checked sub-range of a space.
//!
//! All accesses are naturally aligned and atomic at their width.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate volatile;

mod ram;

pub use ram::{RamRegisterSpace, RegisterWrite};

use alloc::sync::Arc;
use core::fmt;
use volatile::Volatile;


/// The errors that can occur when accessing a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The access at `offset` of `width` bytes falls outside the region.
    OutOfBounds { offset: usize, width: usize },
    /// The access at `offset` is not aligned to its `width`.
    Misaligned { offset: usize, width: usize },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegisterError::OutOfBounds { offset, width } =>
                write!(f, "{}-byte register access at {:#X} is out of bounds", width, offset),
            RegisterError::Misaligned { offset, width } =>
                write!(f, "{}-byte register access at {:#X} is misaligned", width, offset),
        }
    }
}

/// Checks that an access of `width` bytes at `offset` fits in a region of `size` bytes
/// and is naturally aligned.
pub fn check_access(size: usize, offset: usize, width: usize) -> Result<(), RegisterError> {
    if offset % width != 0 {
        return Err(RegisterError::Misaligned { offset, width });
    }
    match offset.checked_add(width) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RegisterError::OutOfBounds { offset, width }),
    }
}


/// A region of device registers that can be read and written at byte offsets.
///
/// Implementations must check every access against the size of the region
/// and never touch memory outside of it.
pub trait RegisterSpace: Send + Sync {
    /// The size of this region in bytes.
    fn size(&self) -> usize;

    fn read_u8(&self, offset: usize) -> Result<u8, RegisterError>;
    fn read_u16(&self, offset: usize) -> Result<u16, RegisterError>;
    fn read_u32(&self, offset: usize) -> Result<u32, RegisterError>;
    fn read_u64(&self, offset: usize) -> Result<u64, RegisterError>;

    fn write_u8(&self, offset: usize, value: u8) -> Result<(), RegisterError>;
    fn write_u16(&self, offset: usize, value: u16) -> Result<(), RegisterError>;
    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError>;
    fn write_u64(&self, offset: usize, value: u64) -> Result<(), RegisterError>;
}


/// A memory-mapped register region, accessed with volatile loads and stores.
pub struct MmioRegion {
    base: usize,
    size: usize,
}

// The region is device memory; every access is a single volatile load or store.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wraps the already-mapped register region at virtual address `base`.
    ///
    /// # Safety
    /// `base..base + size` must be mapped as uncached device memory for the
    /// whole lifetime of the returned object, and must not be used as normal memory.
    pub unsafe fn new(base: usize, size: usize) -> MmioRegion {
        MmioRegion { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn register<T: Copy>(&self, offset: usize) -> Result<*mut Volatile<T>, RegisterError> {
        check_access(self.size, offset, core::mem::size_of::<T>())?;
        Ok((self.base + offset) as *mut Volatile<T>)
    }

    fn read<T: Copy>(&self, offset: usize) -> Result<T, RegisterError> {
        let reg = self.register::<T>(offset)?;
        // SAFETY: the access was bounds- and alignment-checked against the mapped region.
        Ok(unsafe { (*reg).read() })
    }

    fn write<T: Copy>(&self, offset: usize, value: T) -> Result<(), RegisterError> {
        let reg = self.register::<T>(offset)?;
        // SAFETY: the access was bounds- and alignment-checked against the mapped region.
        unsafe { (*reg).write(value) };
        Ok(())
    }
}

impl RegisterSpace for MmioRegion {
    fn size(&self) -> usize { self.size }

    fn read_u8(&self, offset: usize) -> Result<u8, RegisterError> { self.read(offset) }
    fn read_u16(&self, offset: usize) -> Result<u16, RegisterError> { self.read(offset) }
    fn read_u32(&self, offset: usize) -> Result<u32, RegisterError> { self.read(offset) }
    fn read_u64(&self, offset: usize) -> Result<u64, RegisterError> { self.read(offset) }

    fn write_u8(&self, offset: usize, value: u8) -> Result<(), RegisterError> { self.write(offset, value) }
    fn write_u16(&self, offset: usize, value: u16) -> Result<(), RegisterError> { self.write(offset, value) }
    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError> { self.write(offset, value) }
    fn write_u64(&self, offset: usize, value: u64) -> Result<(), RegisterError> { self.write(offset, value) }
}


/// A bounds-checked sub-range of a [`RegisterSpace`].
///
/// Offsets passed to a window are relative to the start of the window.
/// Cloning a window is cheap; all clones refer to the same underlying space.
#[derive(Clone)]
pub struct RegisterWindow {
    space: Arc<dyn RegisterSpace>,
    offset: usize,
    size: usize,
}

impl RegisterWindow {
    /// Creates a window of `size` bytes starting at `offset` in the given `space`.
    pub fn new(space: Arc<dyn RegisterSpace>, offset: usize, size: usize) -> Result<RegisterWindow, RegisterError> {
        match offset.checked_add(size) {
            Some(end) if end <= space.size() => Ok(RegisterWindow { space, offset, size }),
            _ => Err(RegisterError::OutOfBounds { offset, width: size }),
        }
    }

    /// Creates a window covering the entire `space`.
    pub fn whole(space: Arc<dyn RegisterSpace>) -> RegisterWindow {
        let size = space.size();
        RegisterWindow { space, offset: 0, size }
    }

    /// Returns a window of `size` bytes starting at `offset` within this window.
    pub fn subwindow(&self, offset: usize, size: usize) -> Result<RegisterWindow, RegisterError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(RegisterWindow {
                space: self.space.clone(),
                offset: self.offset + offset,
                size,
            }),
            _ => Err(RegisterError::OutOfBounds { offset, width: size }),
        }
    }

    /// The offset of this window within its underlying space.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn space(&self) -> &Arc<dyn RegisterSpace> {
        &self.space
    }

    pub fn try_read_u32(&self, offset: usize) -> Result<u32, RegisterError> {
        check_access(self.size, offset, 4)?;
        self.space.read_u32(self.offset + offset)
    }

    pub fn try_write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError> {
        check_access(self.size, offset, 4)?;
        self.space.write_u32(self.offset + offset, value)
    }

    pub fn try_read_u64(&self, offset: usize) -> Result<u64, RegisterError> {
        check_access(self.size, offset, 8)?;
        self.space.read_u64(self.offset + offset)
    }

    pub fn try_write_u64(&self, offset: usize, value: u64) -> Result<(), RegisterError> {
        check_access(self.size, offset, 8)?;
        self.space.write_u64(self.offset + offset, value)
    }

    /// Reads a 32-bit register whose offset is known to lie within this window.
    ///
    /// A failed access is logged and reads as zero.
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.try_read_u32(offset).unwrap_or_else(|e| {
            error!("RegisterWindow at {:#X}: read failed: {}", self.offset, e);
            0
        })
    }

    /// Writes a 32-bit register whose offset is known to lie within this window.
    ///
    /// A failed access is logged and the write is dropped.
    pub fn write_u32(&self, offset: usize, value: u32) {
        if let Err(e) = self.try_write_u32(offset, value) {
            error!("RegisterWindow at {:#X}: write of {:#X} failed: {}", self.offset, value, e);
        }
    }
}

impl fmt::Debug for RegisterWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RegisterWindow {{ offset: {:#X}, size: {:#X} }}", self.offset, self.size)
    }
}
