//! Cancellable session timers
//!
//! Each timer is a task tied to a child of the session's cancellation token,
//! so cancelling the session stops every timer it owns.

use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Nobody answered, or accepting took too long
    Ringing,
    /// Negotiating must reach Active before this fires
    Negotiation,
    /// Duration clock
    DurationTick,
    /// Disconnected transport did not recover
    DisconnectGrace,
}

/// Handle to a running timer. Dropping it cancels the timer.
pub(crate) struct Timer {
    token: CancellationToken,
}

impl Timer {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `fire` once after `after` unless cancelled first
pub(crate) fn once<F>(parent: &CancellationToken, after: Duration, fire: F) -> Timer
where
    F: FnOnce() + Send + 'static,
{
    let token = parent.child_token();
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            _ = sleep(after) => fire(),
        }
    });

    Timer { token }
}

/// Run `tick` every `period`, first after one full period, until cancelled
/// or until `tick` returns `false`
pub(crate) fn repeating<F>(parent: &CancellationToken, period: Duration, mut tick: F) -> Timer
where
    F: FnMut() -> bool + Send + 'static,
{
    let token = parent.child_token();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = interval.tick() => {
                    if !tick() {
                        break;
                    }
                }
            }
        }
    });

    Timer { token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let parent = CancellationToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let _timer = once(&parent, Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        settle().await;
        tokio::time::advance(Duration::from_millis(29_900)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_parent_stops_timers() {
        let parent = CancellationToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let _timer = once(&parent, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        settle().await;
        parent.cancel();
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_ticks_each_period_until_dropped() {
        let parent = CancellationToken::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let timer = repeating(&parent, Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        settle().await;
        tokio::time::advance(Duration::from_millis(3_500)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(timer);
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
