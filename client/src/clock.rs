use std::time::Duration;

use futures::future::LocalBoxFuture;

/// Millisecond wall clock used for update timestamps and debounce decisions.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Timer injected into the long-running loops: `gloo-timers` in the browser,
/// `tokio::time::sleep` or an immediate future in tests.
pub type SleepFn = dyn Fn(Duration) -> LocalBoxFuture<'static, ()>;
