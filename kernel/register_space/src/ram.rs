//! A register space backed by ordinary memory.
//!
//! Stands in for the device when it is simulated or reached through a
//! shadow copy from outside the driver process. Every write performed through
//! the [`RegisterSpace`] trait is recorded so the register traffic can be inspected.
//! The "hardware side" updates registers with the `poke_*` functions,
//! which are not recorded.

use alloc::vec::Vec;
use alloc::collections::BTreeMap;
use spin::Mutex;
use super::{RegisterSpace, RegisterError, check_access};


/// One recorded register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: usize,
    pub width: usize,
    pub value: u64,
}

pub struct RamRegisterSpace {
    memory: Mutex<Vec<u8>>,
    writes: Mutex<Vec<RegisterWrite>>,
    /// Per-register masks applied to 32-bit writes, emulating read-only bits.
    write_masks: Mutex<BTreeMap<usize, u32>>,
}

impl RamRegisterSpace {
    /// Creates a zero-filled register space of `size` bytes.
    pub fn new(size: usize) -> RamRegisterSpace {
        RamRegisterSpace {
            memory: Mutex::new(alloc::vec![0; size]),
            writes: Mutex::new(Vec::new()),
            write_masks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns a copy of every write recorded so far, in order.
    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.writes.lock().clone()
    }

    /// Returns how many recorded writes targeted the register at `offset`.
    pub fn write_count(&self, offset: usize) -> usize {
        self.writes.lock().iter().filter(|w| w.offset == offset).count()
    }

    /// Returns the last value written to the register at `offset`, if any.
    pub fn last_write(&self, offset: usize) -> Option<u64> {
        self.writes.lock().iter().rev().find(|w| w.offset == offset).map(|w| w.value)
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Only the bits set in `mask` will be stored by subsequent 32-bit writes to `offset`.
    pub fn set_write_mask(&self, offset: usize, mask: u32) {
        self.write_masks.lock().insert(offset, mask);
    }

    /// Sets a 32-bit register from the device side, without recording it.
    pub fn poke_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError> {
        self.store(offset, &value.to_le_bytes())
    }

    /// Sets a 64-bit register from the device side, without recording it.
    pub fn poke_u64(&self, offset: usize, value: u64) -> Result<(), RegisterError> {
        self.store(offset, &value.to_le_bytes())
    }

    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], RegisterError> {
        let memory = self.memory.lock();
        check_access(memory.len(), offset, N)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&memory[offset..offset + N]);
        Ok(bytes)
    }

    fn store(&self, offset: usize, bytes: &[u8]) -> Result<(), RegisterError> {
        let mut memory = self.memory.lock();
        check_access(memory.len(), offset, bytes.len())?;
        memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn record(&self, offset: usize, width: usize, value: u64) {
        self.writes.lock().push(RegisterWrite { offset, width, value });
    }
}

impl RegisterSpace for RamRegisterSpace {
    fn size(&self) -> usize {
        self.memory.lock().len()
    }

    fn read_u8(&self, offset: usize) -> Result<u8, RegisterError> {
        self.load::<1>(offset).map(u8::from_le_bytes)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, RegisterError> {
        self.load::<2>(offset).map(u16::from_le_bytes)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, RegisterError> {
        self.load::<4>(offset).map(u32::from_le_bytes)
    }

    fn read_u64(&self, offset: usize) -> Result<u64, RegisterError> {
        self.load::<8>(offset).map(u64::from_le_bytes)
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<(), RegisterError> {
        self.store(offset, &value.to_le_bytes())?;
        self.record(offset, 1, value.into());
        Ok(())
    }

    fn write_u16(&self, offset: usize, value: u16) -> Result<(), RegisterError> {
        self.store(offset, &value.to_le_bytes())?;
        self.record(offset, 2, value.into());
        Ok(())
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError> {
        let stored = match self.write_masks.lock().get(&offset) {
            Some(mask) => value & mask,
            None => value,
        };
        self.store(offset, &stored.to_le_bytes())?;
        self.record(offset, 4, value.into());
        Ok(())
    }

    fn write_u64(&self, offset: usize, value: u64) -> Result<(), RegisterError> {
        self.store(offset, &value.to_le_bytes())?;
        self.record(offset, 8, value);
        Ok(())
    }
}
