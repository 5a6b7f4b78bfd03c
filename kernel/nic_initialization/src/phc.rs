//! The PTP hardware clock of an interface.

use reg_blocks::RegisterBlock;
use nic_queues::PtpClock;
use crate::regs::{PHC_REG_CUR_SEC_H, PHC_REG_CUR_SEC_L};


/// A [`PtpClock`] read from a PHC register block.
pub struct PhcClock {
    block: RegisterBlock,
}

impl PhcClock {
    pub fn new(block: RegisterBlock) -> PhcClock {
        PhcClock { block }
    }
}

impl PtpClock for PhcClock {
    fn seconds(&self) -> Result<u64, &'static str> {
        let lo = self.block.read_u32(PHC_REG_CUR_SEC_L).map_err(|_| "PhcClock: failed to read seconds (low)")?;
        let hi = self.block.read_u32(PHC_REG_CUR_SEC_H).map_err(|_| "PhcClock: failed to read seconds (high)")?;
        Ok((hi as u64) << 32 | lo as u64)
    }
}
