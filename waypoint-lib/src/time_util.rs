use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, used for UDP session idle tracking
pub(crate) fn get_since_the_epoch() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}
