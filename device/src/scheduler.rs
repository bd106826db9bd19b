use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Periodic tick source that can be armed, re-armed and cancelled.
/// Unarmed, `next()` never completes, so it can sit in a `select!` loop.
#[derive(Debug, Default)]
pub struct Ticker {
    interval: Option<Interval>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the ticker so the first tick lands one `period` from now. The
    /// caller runs the immediate tick itself.
    pub fn arm(&mut self, period: Duration) {
        let mut interval = time::interval_at(Instant::now() + period, period);
        // a slow tick pushes the schedule back instead of bursting
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn cancel(&mut self) {
        self.interval = None;
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn next(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
