// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Monotonic time source for the limiter, as elapsed time since an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Real time, measured from the moment the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

struct WindowState {
    window_start: Option<Duration>,
    allowed: u64,
    seen: u64,
}

/// Caps the number of kept traces per fixed one-second window.
///
/// A negative limit allows everything and a zero limit allows nothing. Both still count calls,
/// so [`RateLimiter::effective_rate`] always reports the observed accept ratio.
#[derive(Clone)]
pub struct RateLimiter {
    limit: i64,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<WindowState>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("effective_rate", &self.effective_rate())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(limit: i64) -> Self {
        Self::with_clock(limit, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(limit: i64, clock: Arc<dyn Clock>) -> Self {
        RateLimiter {
            limit,
            window: DEFAULT_WINDOW,
            clock,
            state: Arc::new(Mutex::new(WindowState {
                window_start: None,
                allowed: 0,
                seen: 0,
            })),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Consumes one slot of the current window if any is left.
    pub fn is_allowed(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();
        self.roll_window(&mut state, now);

        let allowed = match self.limit {
            l if l < 0 => true,
            0 => false,
            l => state.allowed < l.unsigned_abs(),
        };
        state.seen += 1;
        if allowed {
            state.allowed += 1;
        }
        allowed
    }

    /// Accepted over seen for the current window, or 1.0 when nothing was seen yet.
    pub fn effective_rate(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock_state();
        self.roll_window(&mut state, now);
        if state.seen == 0 {
            return 1.0;
        }
        state.allowed as f64 / state.seen as f64
    }

    fn roll_window(&self, state: &mut WindowState, now: Duration) {
        match state.window_start {
            Some(start) if now.saturating_sub(start) < self.window => {}
            Some(start) => {
                // Align to window boundaries so idle periods do not shift the grid.
                let elapsed = now.saturating_sub(start).as_nanos();
                let windows = elapsed / self.window.as_nanos().max(1);
                let offset = self.window.as_nanos() * windows;
                state.window_start =
                    Some(start + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX)));
                state.allowed = 0;
                state.seen = 0;
            }
            None => state.window_start = Some(now),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
