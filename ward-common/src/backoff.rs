use std::{cmp::min, time::Duration};

/// Longest single wait produced by [`iter`], regardless of base.
const MAXIMUM_WAIT: Duration = Duration::from_secs(300);

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// [`tokio::time::sleep`] to observe time-based exponential backoff.
///
/// The first item is `base`, then `base * 2`, `base * 4`, ... capped at
/// [`MAXIMUM_WAIT`]. The refresh retry loop uses the configured
/// `RETRY_DELAY_BASE` here; the node client uses a sub-second base.
pub fn iter(base: Duration) -> impl Iterator<Item = Duration> {
    let base_ms = base.as_millis().max(1) as u64;
    (0u32..).map(move |index| {
        let factor = 2u64.saturating_pow(index);
        let wait_ms = base_ms.saturating_mul(factor);
        min(Duration::from_millis(wait_ms), MAXIMUM_WAIT)
    })
}
