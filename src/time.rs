use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP era 0 epoch (1900) and the UNIX epoch.
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Monotonic clock expressed as nanoseconds since the UNIX epoch.
///
/// The wall-clock reading is taken once; afterwards time advances with
/// `Instant`, so steps of the system clock never move media timestamps
/// backwards.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
    origin_unix_ns: u64,
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock {
    pub fn new() -> Self {
        let origin_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            origin: Instant::now(),
            origin_unix_ns,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.origin_unix_ns + self.origin.elapsed().as_nanos() as u64
    }
}

pub fn duration_ns(d: Duration) -> u64 {
    d.as_nanos() as u64
}

/// Splits UNIX nanoseconds into NTP seconds and 32-bit fraction.
pub fn unix_ns_to_ntp(ns: u64) -> (u32, u32) {
    let secs = ns / NANOS_PER_SEC + NTP_UNIX_OFFSET_SECS;
    let frac = ((ns % NANOS_PER_SEC) << 32) / NANOS_PER_SEC;
    (secs as u32, frac as u32)
}

pub fn ntp_to_unix_ns(ntp_sec: u32, ntp_frac: u32) -> u64 {
    let secs = (ntp_sec as u64).saturating_sub(NTP_UNIX_OFFSET_SECS);
    let frac_ns = ((ntp_frac as u64) * NANOS_PER_SEC) >> 32;
    secs * NANOS_PER_SEC + frac_ns
}

/// Middle 32 bits of a 64-bit NTP timestamp (LSR field of a report block).
pub fn ntp_compact(ntp_sec: u32, ntp_frac: u32) -> u32 {
    (ntp_sec << 16) | (ntp_frac >> 16)
}

/// Delay expressed in units of 1/65536 seconds (DLSR field).
pub fn ns_to_dlsr(ns: u64) -> u32 {
    ((ns as u128 * 65536) / NANOS_PER_SEC as u128).min(u32::MAX as u128) as u32
}
