//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::sync::BackoffSettings;

/// Delay generator of the reconnection loop.
///
/// The n-th delay is drawn uniformly from `[0, min(max, initial * 2^n)]`. Once
/// the first failure is older than `max_elapsed`, no delay is returned and the
/// caller must give up. A success resets everything.
///
/// # Examples
///
/// ```ignore
/// let mut backoff = Backoff::new(settings);
/// loop {
///     match sync_once().await {
///         Ok(_) => backoff.reset(),
///         Err(_) => match backoff.next_delay() {
///             Some(delay) => sleep(delay).await,
///             None => break,
///         },
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
    failing_since: Option<Instant>,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Backoff {
            settings,
            attempt: 0,
            failing_since: None,
        }
    }

    /// Number of consecutive failures.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time spent failing so far.
    pub fn elapsed(&self) -> Duration {
        self.failing_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    /// Upper bound of the next delay.
    fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.settings
            .initial
            .saturating_mul(factor)
            .min(self.settings.max)
    }

    /// Records a failure and returns how long to wait before retrying, or
    /// `None` if the failures lasted longer than allowed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        if let Some(max_elapsed) = self.settings.max_elapsed {
            if since.elapsed() >= max_elapsed {
                return None;
            }
        }

        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let millis = ceiling.as_millis() as u64;
        Some(Duration::from_millis(rand::thread_rng().gen_range(0..=millis)))
    }

    /// Forgets past failures after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.failing_since = None;
    }
}
