//! The state and register protocol shared by all four kinds of queues.

use bit_field::BitField;
use zerocopy::{AsBytes, FromBytes};
use nic_buffers::{DmaAllocator, DmaBuffer, PhysicalAddress};
use register_space::{RegisterError, RegisterWindow};
use crate::QueueError;
use crate::regs::*;


/// Advances the free-running software pointer `sw` to match the narrower
/// hardware pointer `hw`.
///
/// Correct as long as the hardware pointer moves by less than one full
/// wraparound of [`HW_PTR_MASK`] between two calls.
pub fn reconcile_pointer(sw: u32, hw: u32) -> u32 {
    sw.wrapping_add(hw.wrapping_sub(sw) & HW_PTR_MASK)
}


/// A ring of equally-sized slots in one DMA buffer, plus that ring's registers.
///
/// `head` and `tail` are 32-bit free-running counters. Slot `n` lives at
/// `(n & (capacity - 1)) * slot_stride` within the buffer.
pub struct DescriptorRing {
    regs: RegisterWindow,
    buffer: Option<DmaBuffer>,
    capacity: u32,
    slot_stride: usize,
    log_desc_block_size: u32,
    head: u32,
    tail: u32,
    active: bool,
}

impl DescriptorRing {
    /// Creates an unallocated ring that is controlled through `regs`.
    pub fn new(regs: RegisterWindow) -> DescriptorRing {
        DescriptorRing {
            regs,
            buffer: None,
            capacity: 0,
            slot_stride: 0,
            log_desc_block_size: 0,
            head: 0,
            tail: 0,
            active: false,
        }
    }

    /// Allocates the ring's DMA buffer.
    ///
    /// Both `capacity` and `slot_stride` are rounded up to a power of two.
    pub fn allocate(&mut self, allocator: &dyn DmaAllocator, capacity: u32, slot_stride: usize) -> Result<(), QueueError> {
        if self.buffer.is_some() {
            return Err(QueueError::AlreadyAllocated);
        }
        let rounded = match capacity.checked_next_power_of_two() {
            Some(c) if capacity != 0 && c <= HW_PTR_MASK + 1 => c,
            _ => return Err(QueueError::InvalidSize(capacity)),
        };
        if slot_stride == 0 {
            return Err(QueueError::InvalidSize(0));
        }
        let slot_stride = slot_stride.next_power_of_two();

        let buffer = allocator.allocate_coherent(rounded as usize * slot_stride)
            .map_err(QueueError::External)?;
        self.buffer = Some(buffer);
        self.capacity = rounded;
        self.slot_stride = slot_stride;
        self.head = 0;
        self.tail = 0;
        Ok(())
    }

    /// Stops the ring if needed, then releases its DMA buffer.
    pub fn free(&mut self) {
        self.stop();
        self.buffer = None;
        self.capacity = 0;
        self.slot_stride = 0;
        self.head = 0;
        self.tail = 0;
    }

    /// Programs the ring's registers and sets the active bit.
    ///
    /// `index_value` goes into the index register, and `log_desc_block_size`
    /// into the control register. Both pointers restart at zero.
    pub fn start(&mut self, index_value: u32, log_desc_block_size: u32) -> Result<(), QueueError> {
        if self.active {
            return Err(QueueError::AlreadyActive);
        }
        let buffer = self.buffer.as_mut().ok_or(QueueError::NotAllocated)?;
        buffer.zero();
        let base = buffer.phys_addr();
        self.head = 0;
        self.tail = 0;
        self.log_desc_block_size = log_desc_block_size & MAX_LOG_DESC_BLOCK_SIZE;

        self.regs.try_write_u32(QUEUE_ACTIVE_LOG_SIZE_REG, 0)?;
        self.regs.try_write_u32(QUEUE_BASE_ADDR_LO_REG, base.low_u32())?;
        self.regs.try_write_u32(QUEUE_BASE_ADDR_HI_REG, base.high_u32())?;
        self.regs.try_write_u32(QUEUE_INDEX_REG, index_value)?;
        self.regs.try_write_u32(QUEUE_HEAD_PTR_REG, 0)?;
        self.regs.try_write_u32(QUEUE_TAIL_PTR_REG, 0)?;
        self.regs.try_write_u32(QUEUE_ACTIVE_LOG_SIZE_REG, self.control_word(true))?;
        self.active = true;
        Ok(())
    }

    /// Clears the active bit. Does nothing if the ring is not active.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.regs.write_u32(QUEUE_ACTIVE_LOG_SIZE_REG, self.control_word(false));
        self.active = false;
    }

    fn control_word(&self, active: bool) -> u32 {
        let mut word = 0u32;
        word.set_bits(QUEUE_LOG_SIZE_BITS, self.capacity.trailing_zeros());
        word.set_bits(QUEUE_LOG_DESC_BLOCK_BITS, self.log_desc_block_size);
        word.set_bit(QUEUE_ACTIVE_BIT, active);
        word
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The number of slots, zero while unallocated.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn slot_stride(&self) -> usize {
        self.slot_stride
    }

    pub fn phys_addr(&self) -> Option<PhysicalAddress> {
        self.buffer.as_ref().map(|b| b.phys_addr())
    }

    pub fn regs(&self) -> &RegisterWindow {
        &self.regs
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn set_head(&mut self, head: u32) {
        self.head = head;
    }

    pub fn set_tail(&mut self, tail: u32) {
        self.tail = tail;
    }

    /// The slot that the free-running pointer `ptr` refers to.
    pub fn slot(&self, ptr: u32) -> usize {
        (ptr & self.capacity.wrapping_sub(1)) as usize
    }

    /// Reconciles `head` with the hardware head pointer and returns the new value.
    pub fn read_hw_head(&mut self) -> Result<u32, RegisterError> {
        let hw = self.regs.try_read_u32(QUEUE_HEAD_PTR_REG)?;
        self.head = reconcile_pointer(self.head, hw);
        Ok(self.head)
    }

    /// Reconciles `tail` with the hardware tail pointer and returns the new value.
    pub fn read_hw_tail(&mut self) -> Result<u32, RegisterError> {
        let hw = self.regs.try_read_u32(QUEUE_TAIL_PTR_REG)?;
        self.tail = reconcile_pointer(self.tail, hw);
        Ok(self.tail)
    }

    pub fn write_hw_head(&self) -> Result<(), RegisterError> {
        self.regs.try_write_u32(QUEUE_HEAD_PTR_REG, self.head & HW_PTR_MASK)
    }

    pub fn write_hw_tail(&self) -> Result<(), RegisterError> {
        self.regs.try_write_u32(QUEUE_TAIL_PTR_REG, self.tail & HW_PTR_MASK)
    }

    /// Writes the index register, e.g., to arm an EQ or CQ.
    pub fn write_index(&self, value: u32) -> Result<(), RegisterError> {
        self.regs.try_write_u32(QUEUE_INDEX_REG, value)
    }

    /// Reads the `entry`-th `T` within the slot of pointer `ptr`.
    pub fn read_entry<T: FromBytes>(&self, ptr: u32, entry: usize) -> Option<T> {
        let offset = self.entry_offset::<T>(ptr, entry)?;
        self.buffer.as_ref()?.read_at(offset)
    }

    /// Writes the `entry`-th `T` within the slot of pointer `ptr`.
    pub fn write_entry<T: AsBytes>(&mut self, ptr: u32, entry: usize, value: &T) -> Option<()> {
        let offset = self.entry_offset::<T>(ptr, entry)?;
        self.buffer.as_mut()?.write_at(offset, value)
    }

    fn entry_offset<T>(&self, ptr: u32, entry: usize) -> Option<usize> {
        let size = core::mem::size_of::<T>();
        let within = entry.checked_mul(size)?;
        if within + size > self.slot_stride {
            return None;
        }
        Some(self.slot(ptr) * self.slot_stride + within)
    }
}
