use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use once_cell::sync::Lazy;
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::debug;

/// Minimum-interval gate. Callers serialize on the inner lock, so the
/// interval holds across tasks as well as within one.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                debug!(source = self.name, wait_ms = remaining.as_millis() as u64, "rate limit wait");
                sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
    }
}

static SHARED_LIMITERS: Lazy<StdMutex<HashMap<&'static str, Arc<RateLimiter>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

/// Process-wide limiter for `source`. The first caller fixes the interval.
pub fn shared_limiter(source: &'static str, min_interval: Duration) -> Arc<RateLimiter> {
    let mut limiters = SHARED_LIMITERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(
        limiters
            .entry(source)
            .or_insert_with(|| Arc::new(RateLimiter::new(source, min_interval))),
    )
}
