use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::{sleep_until, Instant};

/// Spaces out unit starts so that no more than a fixed number begin per second.
///
/// Slots are handed out in the order callers arrive, each one `1 / rate` after the previous.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `per_second` starts per second. Zero, negative, or non-finite rates are unlimited.
    pub fn per_second(per_second: f64) -> Self {
        let interval = (per_second.is_finite() && per_second > 0.0).then(|| Duration::from_secs_f64(1.0 / per_second));
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_none()
    }

    /// Waits until the caller may start a unit.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };

        let slot = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + interval);
            slot
        };

        sleep_until(slot).await;
    }
}
