//! Periodic tasks and in-flight markers shared by the engine and its handles.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A spawned periodic task, aborted when dropped.
#[derive(Debug)]
pub(crate) struct TimerTask {
    handle: JoinHandle<()>,
    period: Duration,
}

impl TimerTask {
    pub(crate) fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `tick` every `period`, first after one full period. Each tick is awaited
/// before the next is considered; ticks missed meanwhile are skipped. The task ends
/// when `tick` resolves to `false`.
///
/// Returns `None` outside a tokio runtime.
pub(crate) fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> Option<TimerTask>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let runtime = match Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("No tokio runtime available; periodic updates are disabled");
            return None;
        }
    };

    let period = period.max(MIN_PERIOD);
    let handle = runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !tick().await {
                break;
            }
        }
    });

    Some(TimerTask { handle, period })
}

/// Marks a queue as having a request outstanding; cleared on drop.
pub(crate) struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_in_flight_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = InFlight::acquire(&flag);
        assert!(first.is_some());
        assert!(InFlight::acquire(&flag).is_none());
        drop(first);
        assert!(InFlight::acquire(&flag).is_some());
    }

    #[test]
    fn test_no_runtime_means_no_timer() {
        assert!(spawn_periodic(Duration::from_secs(1), || async { true }).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let _timer = spawn_periodic(Duration::from_secs(10), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { n < 3 }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_timer_aborts() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let timer = spawn_periodic(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { true }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(timer);
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert_eq!(seen, 2);
    }
}
