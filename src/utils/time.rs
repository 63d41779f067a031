//! Wall-clock helpers. Packet timestamps and clock sync work in UTC
//! milliseconds since the Unix epoch.

use crate::error::{constants, ProtocolError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time in milliseconds.
///
/// # Errors
/// Returns `ProtocolError::Custom` if the system clock is before the epoch.
pub fn try_now_ms() -> Result<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Current UTC time in milliseconds, or 0 if the clock is before the epoch.
#[inline]
pub fn now_ms() -> i64 {
    try_now_ms().unwrap_or(0)
}
