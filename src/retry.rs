//! Backoff generators and the retry policy consumed by [`send`](crate::sender::send)

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use http::StatusCode;

/// Default delay before the first retry
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(250);

/// Default upper bound for a single delay
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of retries once retrying is enabled
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Generates successive wait durations between attempts.
///
/// `None` means "stop": no further attempt must be made.
pub trait Backoff: Send + Sync {
    /// Duration to wait before the next attempt
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Restarts the sequence from the beginning
    fn reset(&mut self);
}

impl<B: Backoff + ?Sized> Backoff for Box<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        (**self).next_backoff()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBackoff;

impl Backoff for StopBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

/// Retries forever, always waiting the same duration.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.0)
    }

    fn reset(&mut self) {}
}

/// Grows the delay by `multiplier` after every attempt, never exceeding
/// `max_interval`. A multiplier of `1.0` yields a constant delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay handed out
    pub initial_interval: Duration,
    /// Growth factor between two delays
    pub multiplier: f64,
    /// Cap for a single delay
    pub max_interval: Duration,
    current_interval: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial_interval`
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        ExponentialBackoff {
            initial_interval,
            multiplier,
            max_interval,
            current_interval: initial_interval,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(DEFAULT_INITIAL_INTERVAL, 1.0, DEFAULT_MAX_INTERVAL)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.current_interval.min(self.max_interval);
        self.current_interval = self
            .current_interval
            .mul_f64(self.multiplier.max(1.0))
            .min(self.max_interval);
        Some(delay)
    }

    fn reset(&mut self) {
        self.current_interval = self.initial_interval;
    }
}

/// Stops the wrapped backoff after `max_retries` delays.
#[derive(Debug, Clone)]
pub struct WithMaxRetries<B> {
    inner: B,
    max_retries: u32,
    retries: u32,
}

impl<B: Backoff> WithMaxRetries<B> {
    /// Wraps `inner`, allowing at most `max_retries` delays
    pub fn new(inner: B, max_retries: u32) -> Self {
        WithMaxRetries {
            inner,
            max_retries,
            retries: 0,
        }
    }
}

impl<B: Backoff> Backoff for WithMaxRetries<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.retries = 0;
        self.inner.reset();
    }
}

/// Decides whether and when a request is sent again.
///
/// Network failures and the statuses in
/// [`is_retryable_code`](crate::errors::is_retryable_code) are retried, plus any
/// statuses added with [`RetryPolicy::with_codes`].
pub struct RetryPolicy {
    pub(crate) backoff: Box<dyn Backoff>,
    pub(crate) extra_codes: HashSet<StatusCode>,
}

impl RetryPolicy {
    /// Retry policy that never sends a request twice. Used by `send` unless
    /// the caller opts in.
    pub fn disabled() -> Self {
        RetryPolicy {
            backoff: Box::new(StopBackoff),
            extra_codes: HashSet::new(),
        }
    }

    /// Replaces the backoff
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// Retries these statuses too, in addition to the default retryable ones
    pub fn with_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.extra_codes.extend(codes);
        self
    }

    /// Returns true if `status` was added with [`RetryPolicy::with_codes`]
    pub fn is_extra_code(&self, status: StatusCode) -> bool {
        self.extra_codes.contains(&status)
    }
}

/// 250ms constant delay, 3 retries at most, no extra codes.
impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: Box::new(WithMaxRetries::new(
                ExponentialBackoff::default(),
                DEFAULT_MAX_RETRIES,
            )),
            extra_codes: HashSet::new(),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("extra_codes", &self.extra_codes)
            .finish_non_exhaustive()
    }
}
