//! Background flushing of dirty regions.
//!
//! Each open region owns one [`FlushTask`]: a named worker thread that wakes
//! every [`FlushContext::interval`], and flushes its region when the region is
//! dirty and a [`FlushPermit`] is available. Permits come from a shared
//! [`FlushContext`], which caps how many flushes execute at once across every
//! region using it.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use strata_config::StorageConfig;

use crate::error::RegionError;

/// Shared flush settings and the process-wide count of executing flushes.
#[derive(Debug)]
pub struct FlushContext {
    interval: Duration,
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

impl FlushContext {
    /// Creates a context polling every `interval` and allowing `max_in_flight`
    /// simultaneous flushes (at least one).
    pub fn new(interval: Duration, max_in_flight: usize) -> Self {
        Self {
            interval,
            max_in_flight: max_in_flight.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Builds a context from the storage settings.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            Duration::from_millis(config.flush_interval_ms),
            config.max_concurrent_flushes,
        )
    }

    /// Time between dirty checks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Maximum simultaneous flushes.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Flushes executing right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claims a flush slot, or `None` if the cap is reached.
    pub fn try_acquire(&self) -> Option<FlushPermit<'_>> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()
            .map(|_| FlushPermit { context: self })
    }
}

impl Default for FlushContext {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

/// A claimed flush slot; released on drop, whether the flush succeeded or not.
#[derive(Debug)]
pub struct FlushPermit<'a> {
    context: &'a FlushContext,
}

impl Drop for FlushPermit<'_> {
    fn drop(&mut self) {
        self.context.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Something a [`FlushTask`] can persist.
pub(crate) trait FlushTarget: Send + Sync + 'static {
    /// Whether there are unsaved changes.
    fn needs_flush(&self) -> bool;

    /// Persists unsaved changes; `Ok(true)` if anything was written.
    ///
    /// On failure the target must stay dirty so the next poll retries.
    fn flush(&self) -> Result<bool, RegionError>;
}

/// A running flush worker.
#[derive(Debug)]
pub(crate) struct FlushTask {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTask {
    /// Starts a worker named `name` that flushes `target` until stopped or
    /// until the target is dropped.
    pub(crate) fn spawn<T: FlushTarget>(
        name: String,
        target: Weak<T>,
        context: Arc<FlushContext>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(target, context, stop_rx))?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the worker and waits for it to finish any flush in progress.
    pub(crate) fn stop(mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            // The worker may itself drop the last region handle and end up here.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("flush worker panicked");
            }
        }
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        // Disconnecting the channel ends the worker at its next wake-up.
        self.stop.take();
    }
}

fn run<T: FlushTarget>(target: Weak<T>, context: Arc<FlushContext>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(context.interval()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(target) = target.upgrade() else {
            break;
        };
        if !target.needs_flush() {
            continue;
        }
        let Some(_permit) = context.try_acquire() else {
            tracing::trace!(
                in_flight = context.in_flight(),
                "flush deferred, concurrency cap reached"
            );
            continue;
        };
        if let Err(e) = target.flush() {
            tracing::warn!(error = %e, "background flush failed, retrying next interval");
        }
    }
    tracing::trace!("flush worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeTarget {
        dirty: AtomicBool,
        flushes: AtomicUsize,
        fail_next: AtomicBool,
        delay: Duration,
        context: Option<Arc<FlushContext>>,
        peak: Arc<AtomicUsize>,
    }

    impl FlushTarget for FakeTarget {
        fn needs_flush(&self) -> bool {
            self.dirty.load(Ordering::Acquire)
        }

        fn flush(&self) -> Result<bool, RegionError> {
            if let Some(context) = &self.context {
                self.peak.fetch_max(context.in_flight(), Ordering::AcqRel);
            }
            thread::sleep(self.delay);
            if self.fail_next.swap(false, Ordering::AcqRel) {
                return Err(RegionError::io(
                    "writing",
                    "fake",
                    io::Error::new(io::ErrorKind::StorageFull, "disk full"),
                ));
            }
            self.dirty.store(false, Ordering::Release);
            self.flushes.fetch_add(1, Ordering::AcqRel);
            Ok(true)
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_permits_respect_cap() {
        let context = FlushContext::new(Duration::from_millis(10), 2);
        let a = context.try_acquire().expect("first permit");
        let b = context.try_acquire().expect("second permit");
        assert!(context.try_acquire().is_none());
        assert_eq!(context.in_flight(), 2);
        drop(a);
        assert_eq!(context.in_flight(), 1);
        let c = context.try_acquire();
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(context.in_flight(), 0);
    }

    #[test]
    fn test_zero_cap_is_raised_to_one() {
        let context = FlushContext::new(Duration::from_millis(10), 0);
        assert_eq!(context.max_in_flight(), 1);
        assert!(context.try_acquire().is_some());
    }

    #[test]
    fn test_worker_flushes_dirty_target() {
        let context = Arc::new(FlushContext::new(Duration::from_millis(5), 4));
        let target = Arc::new(FakeTarget::default());
        let task =
            FlushTask::spawn("test-flush".into(), Arc::downgrade(&target), context).unwrap();

        target.dirty.store(true, Ordering::Release);
        assert!(wait_until(Duration::from_secs(5), || {
            target.flushes.load(Ordering::Acquire) == 1
        }));
        task.stop();
    }

    #[test]
    fn test_worker_retries_after_failure() {
        let context = Arc::new(FlushContext::new(Duration::from_millis(5), 4));
        let target = Arc::new(FakeTarget::default());
        target.fail_next.store(true, Ordering::Release);
        target.dirty.store(true, Ordering::Release);
        let task =
            FlushTask::spawn("test-retry".into(), Arc::downgrade(&target), context).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            target.flushes.load(Ordering::Acquire) == 1
        }));
        assert!(!target.needs_flush());
        task.stop();
    }

    #[test]
    fn test_stop_prevents_further_flushes() {
        let context = Arc::new(FlushContext::new(Duration::from_millis(5), 4));
        let target = Arc::new(FakeTarget::default());
        let task =
            FlushTask::spawn("test-stop".into(), Arc::downgrade(&target), context).unwrap();
        task.stop();

        target.dirty.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.flushes.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_worker_exits_when_target_dropped() {
        let context = Arc::new(FlushContext::new(Duration::from_millis(5), 4));
        let target = Arc::new(FakeTarget::default());
        let task =
            FlushTask::spawn("test-drop".into(), Arc::downgrade(&target), context).unwrap();
        drop(target);
        // Join returns once the worker notices the target is gone.
        task.stop();
    }

    #[test]
    fn test_concurrency_cap_across_workers() {
        let context = Arc::new(FlushContext::new(Duration::from_millis(2), 1));
        let peak = Arc::new(AtomicUsize::new(0));

        let targets: Vec<_> = (0..4)
            .map(|_| {
                Arc::new(FakeTarget {
                    delay: Duration::from_millis(20),
                    context: Some(Arc::clone(&context)),
                    peak: Arc::clone(&peak),
                    ..FakeTarget::default()
                })
            })
            .collect();
        let tasks: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                FlushTask::spawn(format!("cap-{i}"), Arc::downgrade(t), Arc::clone(&context))
                    .unwrap()
            })
            .collect();

        for target in &targets {
            target.dirty.store(true, Ordering::Release);
        }
        assert!(wait_until(Duration::from_secs(10), || {
            targets.iter().all(|t| t.flushes.load(Ordering::Acquire) >= 1)
        }));
        for task in tasks {
            task.stop();
        }

        assert_eq!(peak.load(Ordering::Acquire), 1);
        assert_eq!(context.in_flight(), 0);
    }
}
