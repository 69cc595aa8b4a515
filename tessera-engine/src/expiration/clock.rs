use std::{future::Future, pin::Pin, time::Duration};

use chrono::{DateTime, Utc};

/// Provides time information. Gives us deterministic time in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: Duration)
        -> Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>>;
}

pub struct SystemClock {}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(
        &self,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
pub mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tessera_types::acquisition::from_millis;
    use tokio::sync::Notify;

    use super::*;

    /// Manually driven clock. `sleep` futures resolve once the clock has
    /// been advanced past their deadline.
    #[derive(Clone)]
    pub struct TestClock {
        inner: Arc<Inner>,
    }

    struct Inner {
        now_ms: Mutex<i64>,
        changed: Notify,
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Inner {
                    now_ms: Mutex::new(0),
                    changed: Notify::new(),
                }),
            }
        }

        pub fn set(&self, millis: i64) {
            *self.inner.now_ms.lock() = millis;
            self.inner.changed.notify_waiters();
        }

        pub fn advance(&self, millis: i64) {
            let mut now_ms = self.inner.now_ms.lock();
            *now_ms += millis;
            drop(now_ms);
            self.inner.changed.notify_waiters();
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            from_millis(*self.inner.now_ms.lock())
        }

        fn sleep(
            &self,
            duration: Duration,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>> {
            let clock = self.clone();
            let deadline = clock.now()
                + chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX));
            Box::pin(async move {
                loop {
                    if clock.now() >= deadline {
                        return;
                    }
                    clock.inner.changed.notified().await;
                }
            })
        }
    }
}
