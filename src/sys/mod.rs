pub mod mock;
pub mod process;
pub mod zfs;

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag. Honored at every filesystem suspension
/// point; effects already flushed are not rolled back.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn ensure(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("operation cancelled");
        }
        Ok(())
    }
}

pub mod clock {
    use chrono::{DateTime, Utc};

    /// Time source capability. Operations stamping `last-used` or computing
    /// GC buckets take it instead of reading the wall clock directly.
    pub trait Clock {
        fn now(&self) -> DateTime<Utc>;
    }

    #[derive(Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Fixed clock for tests.
    pub struct FakeClock(DateTime<Utc>);

    impl FakeClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            Self(now)
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }
}
