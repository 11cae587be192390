//! Per-minute token reservation window.
//!
//! Callers reserve their estimated token count before each provider call.
//! When a reservation would push the running period over the configured
//! per-minute budget, the caller sleeps in one-second steps until the period
//! rolls over — at most 120 steps, after which the reservation is admitted
//! anyway. The mutex guards only the arithmetic; sleeping happens outside.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum number of one-second waits before a reservation is forced through.
const MAX_WAITS: u32 = 120;

struct WindowState {
    period_start: Instant,
    tokens_this_period: u64,
}

/// Sliding per-minute token budget shared by every in-process caller.
pub struct TokenRateLimiter {
    tokens_per_minute: u64,
    state: Mutex<WindowState>,
}

impl TokenRateLimiter {
    /// Create a limiter with the given per-minute budget.
    pub fn new(tokens_per_minute: u64) -> Self {
        Self {
            tokens_per_minute,
            state: Mutex::new(WindowState {
                period_start: Instant::now(),
                tokens_this_period: 0,
            }),
        }
    }

    /// Reserve `tokens` for the current period, waiting for a rollover when
    /// the budget is exhausted. Returns the number of one-second waits taken.
    ///
    /// A reservation larger than the whole budget is admitted on a fresh
    /// period; blocking it forever would livelock oversized batches.
    pub async fn reserve(&self, tokens: u64) -> u32 {
        let mut waits = 0u32;
        loop {
            let admitted = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now.duration_since(state.period_start) >= Duration::from_secs(60) {
                    state.period_start = now;
                    state.tokens_this_period = 0;
                }

                let fresh_period = state.tokens_this_period == 0;
                let fits = state.tokens_this_period + tokens <= self.tokens_per_minute;
                if fits || fresh_period || waits >= MAX_WAITS {
                    state.tokens_this_period += tokens;
                    true
                } else {
                    false
                }
            };

            if admitted {
                if waits >= MAX_WAITS {
                    warn!(
                        tokens,
                        waits, "token budget never freed; proceeding with reservation anyway"
                    );
                } else if waits > 0 {
                    debug!(tokens, waits, "token reservation admitted after waiting");
                }
                return waits;
            }

            waits += 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Tokens reserved in the current period, for observability.
    pub fn tokens_this_period(&self) -> u64 {
        self.state.lock().tokens_this_period
    }
}
