//! Timing: reconnect, retry and beacon intervals, retry policies, and the
//! `Timer` seam so hosts can drive these delays with a virtual clock in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Pause between client reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on a single TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between attempts to send a text or a chunk.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(200);
/// How often a queued text re-checks for a live connection.
pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Attempts per chunk before the whole chunked transfer is failed.
pub const CHUNK_SEND_ATTEMPTS: u32 = 5;
/// Host beacon period.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(2);
/// Beacon pause after a send error.
pub const BEACON_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Source of delays. Production uses the runtime's sleep; tests can pause time.
pub trait Timer: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// How often and how long to retry a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry forever with a fixed delay (texts).
    Unbounded { delay: Duration },
    /// Give up after `max_attempts` (chunks).
    Limited { delay: Duration, max_attempts: u32 },
}

impl RetryPolicy {
    pub fn for_text() -> Self {
        RetryPolicy::Unbounded {
            delay: SEND_RETRY_DELAY,
        }
    }

    pub fn for_chunk() -> Self {
        RetryPolicy::Limited {
            delay: SEND_RETRY_DELAY,
            max_attempts: CHUNK_SEND_ATTEMPTS,
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures,
    /// or `None` when the policy is exhausted.
    pub fn next_delay(&self, failed_attempts: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Unbounded { delay } => Some(delay),
            RetryPolicy::Limited {
                delay,
                max_attempts,
            } => (failed_attempts < max_attempts).then_some(delay),
        }
    }
}
