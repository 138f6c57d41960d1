use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Paces outbound generator calls so no two call starts are closer together
/// than the configured interval, across any number of concurrent workers.
///
/// The last-call timestamp is the only state shared between workers; it lives
/// behind a single async mutex. Sleeping while holding the lock is deliberate:
/// it serializes acquirers so consecutive releases are spaced by the interval.
pub struct Throttle {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    /// A non-positive interval disables throttling entirely.
    pub fn new(interval_secs: f64) -> Self {
        let interval = if interval_secs > 0.0 {
            Duration::from_secs_f64(interval_secs)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
