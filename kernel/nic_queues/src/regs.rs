//! Register offsets and bit definitions shared by every kind of queue.
//!
//! Each queue instance has its own small register window:
//!
//! | offset | register                                                       |
//! |--------|----------------------------------------------------------------|
//! | `0x00` | DMA base address, low 32 bits                                  |
//! | `0x04` | DMA base address, high 32 bits                                 |
//! | `0x08` | size as log2 in bits 0-7, descriptor block size as log2 in bits 8-11, active bit 31 |
//! | `0x0C` | interrupt index (EQ), EQ index (CQ) or CQ index (TX/RX), plus the arm bit |
//! | `0x10` | head pointer                                                   |
//! | `0x18` | tail pointer                                                   |

pub const QUEUE_BASE_ADDR_LO_REG:   usize = 0x00;
pub const QUEUE_BASE_ADDR_HI_REG:   usize = 0x04;
pub const QUEUE_ACTIVE_LOG_SIZE_REG: usize = 0x08;
pub const QUEUE_INDEX_REG:          usize = 0x0C;
pub const QUEUE_HEAD_PTR_REG:       usize = 0x10;
pub const QUEUE_TAIL_PTR_REG:       usize = 0x18;

/// The minimum size of a queue's register window.
pub const QUEUE_REG_WINDOW_SIZE:    usize = 0x20;

/// Bit of the active/size register that enables the queue.
pub const QUEUE_ACTIVE_BIT:         usize = 31;
/// Bits of the active/size register holding log2 of the queue size.
pub const QUEUE_LOG_SIZE_BITS:      core::ops::Range<usize> = 0..8;
/// Bits of the active/size register holding log2 of the descriptor block size.
pub const QUEUE_LOG_DESC_BLOCK_BITS: core::ops::Range<usize> = 8..12;

/// Set in the index register of an EQ or CQ to request one more event or interrupt.
pub const QUEUE_ARM_MASK:           u32 = 1 << 31;

/// Hardware head and tail pointers are only this wide.
pub const HW_PTR_MASK:              u32 = 0xFFFF;

/// The largest descriptor block the control register can express, as a log2.
pub const MAX_LOG_DESC_BLOCK_SIZE:  u32 = 0xF;


/// The size of one transmit or receive descriptor.
pub const DESC_SIZE:                usize = 16;
/// The size of one completion record.
pub const CPL_SIZE:                 usize = 32;
/// The size of one event record.
pub const EVENT_SIZE:               usize = 32;

pub const EVENT_TYPE_TX_CPL:        u16 = 0x0000;
pub const EVENT_TYPE_RX_CPL:        u16 = 0x0001;

/// A receive ring is only refilled once at least this many slots are empty.
pub const RX_REFILL_THRESHOLD:      u32 = 8;

/// The length of an Ethernet header.
pub const ETH_HLEN:                 u32 = 14;
