//! Cancellable timers
//!
//! A [`Timer`] is a spawned sleep that posts an event into a channel when it
//! fires. Dropping the timer aborts it, so whoever owns the timer owns its
//! cancellation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Post `event` once after `delay`
    pub fn once<E: Send + 'static>(
        delay: Duration,
        tx: mpsc::UnboundedSender<E>,
        event: E,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        Self { handle }
    }

    /// Post `make()` every `period`, first after one full period
    pub fn every<E, F>(period: Duration, tx: mpsc::UnboundedSender<E>, make: F) -> Self
    where
        E: Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::once(Duration::from_secs(5), tx, 7u32);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::once(Duration::from_secs(1), tx, ());
        drop(timer);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_each_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = Timer::every(Duration::from_secs(30), tx, || "tick");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(rx.try_recv().unwrap(), "tick");
        assert_eq!(rx.try_recv().unwrap(), "tick");
        assert_eq!(rx.try_recv().unwrap(), "tick");
        assert!(rx.try_recv().is_err());
    }
}
