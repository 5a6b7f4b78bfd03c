//! Discovery of the register blocks that make up a NIC's register region.
//!
//! The device describes its own register layout as a singly-linked list of
//! register blocks. Each block starts with a three-word header:
//!
//! | offset | field                                                     |
//! |--------|-----------------------------------------------------------|
//! | `0x0`  | block type                                                |
//! | `0x4`  | block version                                             |
//! | `0x8`  | offset of the next block, relative to the traversal base  |
//!
//! A next offset of zero ends a (non-empty) list, as does an offset that
//! falls outside of the region being walked.
//! Functional units (interface control, queue managers, ports, clocks) are then
//! located by looking up their block type in the resulting [`BlockDirectory`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate register_space;


use alloc::{sync::Arc, vec::Vec};
use register_space::{RegisterError, RegisterSpace, RegisterWindow};


/// Offset of the block type within a block header.
pub const RB_REG_TYPE:      usize = 0x00;
/// Offset of the block version within a block header.
pub const RB_REG_VERSION:   usize = 0x04;
/// Offset of the next-block pointer within a block header.
pub const RB_REG_NEXT_PTR:  usize = 0x08;
/// The size of a block header in bytes.
pub const RB_HEADER_SIZE:   usize = 0x0C;

/// Passed as the version to [`BlockDirectory::find()`] to match any version.
pub const ANY_VERSION: u32 = 0;

// Block types found in the device and interface register regions.
pub const RB_TYPE_FW_ID:          u32 = 0xFFFF_FFFF;
pub const RB_TYPE_IF:             u32 = 0x0000_C000;
pub const RB_TYPE_IF_CTRL:        u32 = 0x0000_C001;
pub const RB_TYPE_PORT:           u32 = 0x0000_C002;
pub const RB_TYPE_SCHED_BLOCK:    u32 = 0x0000_C003;
pub const RB_TYPE_CLK_INFO:       u32 = 0x0000_C008;
pub const RB_TYPE_EQM:            u32 = 0x0000_C010;
pub const RB_TYPE_TX_QM:          u32 = 0x0000_C020;
pub const RB_TYPE_RX_QM:          u32 = 0x0000_C021;
pub const RB_TYPE_TX_CQM:         u32 = 0x0000_C030;
pub const RB_TYPE_RX_CQM:         u32 = 0x0000_C031;
pub const RB_TYPE_SCHED_RR:       u32 = 0x0000_C040;
pub const RB_TYPE_PHC:            u32 = 0x0000_C080;
pub const RB_TYPE_RX_QUEUE_MAP:   u32 = 0x0000_C090;


/// The errors that can occur while walking a register block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The next pointer of some block led back to the block at `header_offset`,
    /// which was already visited.
    LoopDetected { header_offset: usize },
    /// A block header could not be read.
    Register(RegisterError),
}

impl From<RegisterError> for DiscoveryError {
    fn from(e: RegisterError) -> Self {
        DiscoveryError::Register(e)
    }
}


/// One register block found during discovery.
#[derive(Debug, Clone)]
pub struct RegisterBlock {
    /// The block type, identifying which functional unit this is.
    pub kind: u32,
    /// The version of that functional unit's register interface.
    pub version: u32,
    /// The offset within the register space that next pointers are relative to.
    pub base: usize,
    /// The offset of this block's header, relative to `base`.
    pub header_offset: usize,
    /// The registers of this block, from its header to the end of the region.
    regs: RegisterWindow,
}

impl RegisterBlock {
    /// The registers of this block. Offsets are relative to the block header.
    pub fn regs(&self) -> &RegisterWindow {
        &self.regs
    }

    /// Reads the 32-bit register at `offset` from the block header.
    pub fn read_u32(&self, offset: usize) -> Result<u32, RegisterError> {
        self.regs.try_read_u32(offset)
    }

    /// Writes the 32-bit register at `offset` from the block header.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterError> {
        self.regs.try_write_u32(offset, value)
    }
}


/// The ordered list of register blocks found in one register region.
#[derive(Debug, Clone)]
pub struct BlockDirectory {
    blocks: Vec<RegisterBlock>,
}

impl BlockDirectory {
    /// Walks the register block list of the region of `region_size` bytes that starts at
    /// `base` within `space`, beginning with the block at `start_offset` (relative to `base`).
    ///
    /// Returns the blocks in traversal order. Fails if the list forms a loop.
    pub fn enumerate(
        space: Arc<dyn RegisterSpace>,
        base: usize,
        start_offset: usize,
        region_size: usize,
    ) -> Result<BlockDirectory, DiscoveryError> {
        let region = RegisterWindow::new(space, base, region_size)?;
        let mut blocks: Vec<RegisterBlock> = Vec::new();
        let mut offset = start_offset;

        loop {
            if (offset == 0 && !blocks.is_empty()) || offset >= region_size {
                break;
            }

            if blocks.iter().any(|rb| rb.header_offset == offset) {
                error!("Register blocks form a loop at offset {:#X} (base {:#X})", offset, base);
                return Err(DiscoveryError::LoopDetected { header_offset: offset });
            }

            let regs = region.subwindow(offset, region_size - offset)?;
            let kind = regs.try_read_u32(RB_REG_TYPE)?;
            let version = regs.try_read_u32(RB_REG_VERSION)?;
            let next = regs.try_read_u32(RB_REG_NEXT_PTR)? as usize;

            trace!("reg block at {:#X}: type {:#010X}, version {:#010X}, next {:#X}", offset, kind, version, next);

            blocks.push(RegisterBlock {
                kind,
                version,
                base,
                header_offset: offset,
                regs,
            });
            offset = next;
        }

        Ok(BlockDirectory { blocks })
    }

    /// Returns the `index`-th block (counting from 0) of the given `kind`.
    /// A `version` of [`ANY_VERSION`] matches blocks of every version.
    pub fn find(&self, kind: u32, version: u32, index: usize) -> Option<&RegisterBlock> {
        self.blocks.iter()
            .filter(|rb| rb.kind == kind && (version == ANY_VERSION || rb.version == version))
            .nth(index)
    }

    /// Returns how many blocks of the given `kind` exist, of any version.
    pub fn count(&self, kind: u32) -> usize {
        self.blocks.iter().filter(|rb| rb.kind == kind).count()
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
