//! Client-side synchronization: per-target cycles, diff decisions and
//! resumable chunked downloads into `.sync` sidecars.

pub mod engine;
pub mod retention;
pub mod scheduler;
pub mod sidecar;
pub mod window;

pub use engine::{CycleOutcome, RequestIds, SyncEngine, TransferPlan};
pub use scheduler::Scheduler;
pub use window::SyncWindow;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

/// Milliseconds since the unix epoch; negative before it.
pub fn unix_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub fn filetime_from_millis(ms: i64) -> FileTime {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    FileTime::from_unix_time(secs, nanos)
}

pub fn system_time_from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_conversions() {
        for ms in [0i64, 1, 999, 1_700_000_000_123, -1500] {
            assert_eq!(unix_millis(system_time_from_millis(ms)), ms);
            let ft = filetime_from_millis(ms);
            assert_eq!(
                ft.unix_seconds() * 1000 + i64::from(ft.nanoseconds() / 1_000_000),
                ms
            );
        }
    }
}
