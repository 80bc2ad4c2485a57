//! Fixed-interval job triggering and cooperative shutdown
//!
//! The scheduler awaits each invocation before it waits for the next tick,
//! so one process never runs two invocations of the same job at once. Ticks
//! that pass while an invocation is still running are skipped, not queued.
//! Overlap between processes is left to the job's lock and dedup guard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Work triggered on every scheduler tick
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    /// Run one invocation; failures are the job's to log
    async fn tick(&self);
}

pub struct Scheduler {
    interval: Duration,
    shutdown: Shutdown,
}

impl Scheduler {
    pub fn new(interval: Duration, shutdown: Shutdown) -> Self {
        Self { interval, shutdown }
    }

    /// Tick `job` every interval until shutdown is requested. The first tick
    /// comes one interval after start; no tick starts once shutdown is set.
    pub async fn run(&self, job: Arc<dyn PeriodicJob>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = %job.name(), interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.requested() => break,

                _ = ticker.tick() => {
                    let _running = self.shutdown.track();
                    let started = Instant::now();
                    job.tick().await;
                    debug!(job = %job.name(), elapsed_ms = started.elapsed().as_millis() as u64, "tick finished");
                }
            }
        }

        info!(job = %job.name(), "scheduler stopped");
    }
}

/// Stop signal for the scheduler and the HTTP server, plus the number of job
/// invocations still running
#[derive(Clone)]
pub struct Shutdown {
    stop: Arc<watch::Sender<bool>>,
    running: Arc<watch::Sender<usize>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (running, _) = watch::channel(0);
        Self {
            stop: Arc::new(stop),
            running: Arc::new(running),
        }
    }

    pub fn request(&self) {
        info!("shutdown requested");
        self.stop.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`Shutdown::request`] was called, immediately if it already was
    pub async fn requested(&self) {
        let mut stop = self.stop.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    /// Count an invocation as running until the returned guard drops
    pub fn track(&self) -> Running {
        self.running.send_modify(|n| *n += 1);
        Running {
            running: self.running.clone(),
        }
    }

    pub fn running(&self) -> usize {
        *self.running.borrow()
    }

    /// Wait until no invocation is running; `false` if `timeout` passed first
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut running = self.running.subscribe();
        let drained = tokio::time::timeout(timeout, running.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            warn!(running = self.running(), "drain timed out");
        }
        drained
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one running invocation
pub struct Running {
    running: Arc<watch::Sender<usize>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        work: Duration,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn tick(&self) {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let shutdown = Shutdown::new();
        let job = Arc::new(CountingJob::default());
        let scheduler = Scheduler::new(Duration::from_secs(60), shutdown.clone());

        let handle = {
            let job = job.clone();
            tokio::spawn(async move { scheduler.run(job).await })
        };

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(122)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);

        shutdown.request();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_invocations_never_overlap() {
        let shutdown = Shutdown::new();
        let job = Arc::new(CountingJob {
            work: Duration::from_secs(150),
            ..Default::default()
        });
        let scheduler = Scheduler::new(Duration::from_secs(60), shutdown.clone());

        let handle = {
            let job = job.clone();
            tokio::spawn(async move { scheduler.run(job).await })
        };

        tokio::time::sleep(Duration::from_secs(400)).await;
        shutdown.request();
        handle.await.unwrap();

        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }

    /// Requests shutdown from inside its first invocation, then outlasts
    /// several intervals so the next tick is already due when it returns
    struct StoppingJob {
        shutdown: Shutdown,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for StoppingJob {
        fn name(&self) -> &str {
            "stopping"
        }

        async fn tick(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.shutdown.request();
            tokio::time::sleep(Duration::from_secs(150)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_shutdown_request() {
        for _ in 0..16 {
            let shutdown = Shutdown::new();
            let job = Arc::new(StoppingJob {
                shutdown: shutdown.clone(),
                runs: AtomicUsize::new(0),
            });
            let scheduler = Scheduler::new(Duration::from_secs(60), shutdown.clone());

            scheduler.run(job.clone()).await;

            assert_eq!(job.runs.load(Ordering::SeqCst), 1);
            assert_eq!(shutdown.running(), 0);
        }
    }

    #[tokio::test]
    async fn test_request_before_wait_returns() {
        let shutdown = Shutdown::new();
        shutdown.request();
        shutdown.requested().await;
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_drain() {
        let shutdown = Shutdown::new();
        {
            let _running = shutdown.track();
            assert_eq!(shutdown.running(), 1);
        }
        assert!(shutdown.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let shutdown = Shutdown::new();
        let _running = shutdown.track();
        assert!(!shutdown.drain(Duration::from_secs(5)).await);
        assert_eq!(shutdown.running(), 1);
    }
}
