//! Reconstruction of full hardware timestamps from completion records.
//!
//! A completion record only carries the nanoseconds and the low 16 bits of the
//! seconds of the device's clock. The upper bits come from a cached copy of
//! the full seconds value, which is re-read from the clock whenever bits 8..16
//! of the record no longer match the cache.

use alloc::sync::Arc;
use spin::Mutex;
use nic_buffers::HwTimestamp;
use crate::CompletionRecord;


/// The device's PTP hardware clock.
pub trait PtpClock: Send + Sync {
    /// The current time of day of the clock, in whole seconds.
    fn seconds(&self) -> Result<u64, &'static str>;
}

/// Turns the truncated timestamps in completion records into full timestamps.
///
/// Each ring has its own reconstructor, so its cache is only touched
/// during that ring's completion processing.
pub struct TimestampReconstructor {
    clock: Arc<dyn PtpClock>,
    /// The last full seconds value read from the clock, if any.
    cached_seconds: Mutex<Option<u64>>,
}

impl TimestampReconstructor {
    pub fn new(clock: Arc<dyn PtpClock>) -> TimestampReconstructor {
        TimestampReconstructor { clock, cached_seconds: Mutex::new(None) }
    }

    pub fn reconstruct(&self, record: &CompletionRecord) -> HwTimestamp {
        self.reconstruct_raw(record.ts_s(), record.ts_ns())
    }

    pub fn reconstruct_raw(&self, ts_s: u16, ts_ns: u32) -> HwTimestamp {
        let ts_s = ts_s as u64;
        let mut cached = self.cached_seconds.lock();
        let stale = match *cached {
            Some(seconds) => (seconds ^ ts_s) & 0xFF00 != 0,
            None => true,
        };
        if stale {
            match self.clock.seconds() {
                Ok(seconds) => *cached = Some(seconds),
                Err(e) => error!("TimestampReconstructor: failed to read PTP clock: {}", e),
            }
        }
        let upper = cached.unwrap_or(0) & !0xFF;
        HwTimestamp { seconds: ts_s | upper, nanoseconds: ts_ns }
    }
}
