//! Client-side sliding-window request limiter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed and has been counted.
    Granted,
    /// The window is full.
    Limited {
        /// Time until the oldest counted request leaves the window.
        retry_after: Duration,
    },
}

/// At most `max_requests` admissions in any rolling `window`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl RateLimiter {
    /// Build a limiter from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: usize::try_from(config.max_requests).unwrap_or(usize::MAX),
            window: config.window(),
            admitted: VecDeque::new(),
        }
    }

    /// Admit or reject a request made now.
    pub fn try_acquire(&mut self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    /// Admit or reject a request made at `now`.
    pub fn try_acquire_at(&mut self, now: Instant) -> Admission {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() < self.max_requests {
            self.admitted.push_back(now);
            return Admission::Granted;
        }

        let retry_after = self.admitted.front().map_or(self.window, |&oldest| {
            (oldest + self.window).saturating_duration_since(now)
        });
        Admission::Limited { retry_after }
    }

    /// Admissions currently inside the window as of `now`.
    #[must_use]
    pub fn in_window_at(&self, now: Instant) -> usize {
        self.admitted
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < self.window)
            .count()
    }
}
