//! Registers of the interface-level blocks, as offsets from each block's header.

// Interface control block.
pub const IF_CTRL_REG_FEATURES:     usize = 0x0C;
pub const IF_CTRL_REG_PORT_COUNT:   usize = 0x10;
pub const IF_CTRL_REG_SCHED_COUNT:  usize = 0x14;
pub const IF_CTRL_REG_MAX_TX_MTU:   usize = 0x20;
pub const IF_CTRL_REG_MAX_RX_MTU:   usize = 0x24;
pub const IF_CTRL_REG_TX_MTU:       usize = 0x28;
pub const IF_CTRL_REG_RX_MTU:       usize = 0x2C;

/// Queue manager blocks (event, TX, TX completion, RX, RX completion queues)
/// and the round-robin scheduler all describe a strided register table this way.
/// The table offset is relative to the interface's register region.
pub const QM_REG_OFFSET:            usize = 0x0C;
pub const QM_REG_COUNT:             usize = 0x10;
pub const QM_REG_STRIDE:            usize = 0x14;

// Round-robin scheduler block.
pub const SCHED_RR_REG_CTRL:        usize = 0x18;
/// The per-queue enable bit in a scheduler queue register.
pub const SCHED_RR_QUEUE_ENABLE:    u32 = 1 << 0;

// PTP hardware clock block.
pub const PHC_REG_CUR_SEC_L:        usize = 0x18;
pub const PHC_REG_CUR_SEC_H:        usize = 0x1C;

/// Written to a TX queue's control register to find the largest supported
/// log2 descriptor block size, which then reads back in the same field.
pub const DESC_BLOCK_PROBE:         u32 = 0xF << 8;

bitflags! {
    /// The optional features an interface reports in its control block.
    pub struct InterfaceFeatures: u32 {
        const RSS       = 1 << 0;
        /// Completion records carry hardware timestamps.
        const PTP_TS    = 1 << 4;
        /// TX descriptors may carry a checksum offload command.
        const TX_CSUM   = 1 << 8;
        /// RX completions carry the packet's checksum.
        const RX_CSUM   = 1 << 9;
        const RX_HASH   = 1 << 10;
    }
}
