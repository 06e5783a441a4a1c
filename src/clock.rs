//! Monotonic deadlines
//!
//! Transfer timeouts are relative millisecond values supplied by the user; the
//! engine converts them to absolute points on the monotonic clock at submit
//! time. A timeout of zero means the transfer never times out, and such
//! deadlines order after every set deadline so they collect at the tail of the
//! in-flight list.

use std::time::{Duration, Instant};

/// Absolute expiry point of an in-flight transfer.
///
/// `Never` (user timeout of zero) compares greater than every `At` value; the
/// derived ordering relies on the variant declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Deadline {
    /// Expires at the given monotonic instant.
    At(Instant),
    /// Never expires.
    Never,
}

impl Deadline {
    /// Compute the absolute deadline for a relative millisecond timeout,
    /// measured from `now`. Zero means infinite.
    pub(crate) fn from_timeout_ms(timeout_ms: u32, now: Instant) -> Deadline {
        if timeout_ms == 0 {
            return Deadline::Never;
        }
        match now.checked_add(Duration::from_millis(u64::from(timeout_ms))) {
            Some(at) => Deadline::At(at),
            // saturate unrepresentably distant deadlines
            None => Deadline::Never,
        }
    }

    /// Whether this deadline has passed at `now`.
    pub(crate) fn expired(&self, now: Instant) -> bool {
        match self {
            Deadline::At(at) => *at <= now,
            Deadline::Never => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_is_never() {
        let now = Instant::now();
        assert_eq!(Deadline::from_timeout_ms(0, now), Deadline::Never);
    }

    #[test]
    fn test_never_sorts_after_every_set_deadline() {
        let now = Instant::now();
        let soon = Deadline::from_timeout_ms(1, now);
        let later = Deadline::from_timeout_ms(1_000_000, now);
        assert!(soon < later);
        assert!(later < Deadline::Never);
        assert!(soon < Deadline::Never);
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let d = Deadline::from_timeout_ms(50, now);
        assert!(!d.expired(now));
        assert!(d.expired(now + Duration::from_millis(50)));
        assert!(d.expired(now + Duration::from_secs(1)));
        assert!(!Deadline::Never.expired(now + Duration::from_secs(3600)));
    }
}
