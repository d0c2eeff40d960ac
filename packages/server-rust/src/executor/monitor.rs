//! Background monitoring for the executor.
//!
//! Provides a generic `BackgroundWorker<R>` that processes commands from an
//! mpsc channel via a `BackgroundRunnable` implementation, with periodic tick
//! callbacks. The executor uses it to drive [`SlowOperationDetector`], which
//! reports runners stuck on one item for longer than a threshold.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::runner::{RunnerKind, RunnerSnapshot, Runners};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Handler driven by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The command type this runnable processes.
    type Task: Send + 'static;

    /// Process a single command.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Background worker running on the ambient tokio runtime.
///
/// The spawned task:
/// 1. Listens for commands on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each command
/// 3. Calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker. Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submits a command to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("monitor channel closed")),
            None => Err(anyhow::anyhow!("monitor not running")),
        }
    }

    /// Stops the worker and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// SlowOperationDetector
// ---------------------------------------------------------------------------

/// Commands accepted by the slow-operation monitor.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Scan immediately instead of waiting for the next tick.
    ScanNow,
    /// Change the threshold for subsequent scans.
    SetThreshold(Duration),
}

/// Reports runners that have been busy with one item for too long.
///
/// Each stuck item is reported once, no matter how many scans see it.
pub struct SlowOperationDetector {
    runners: Arc<Runners>,
    threshold: Duration,
    reported: HashSet<(RunnerKind, Instant)>,
    detected: Arc<AtomicU64>,
}

impl SlowOperationDetector {
    pub(crate) fn new(runners: Arc<Runners>, threshold: Duration) -> Self {
        Self {
            runners,
            threshold,
            reported: HashSet::new(),
            detected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of slow items detected so far.
    #[must_use]
    pub fn detected_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.detected)
    }

    /// Scans all runners once. Returns the items newly reported by this scan.
    pub fn scan(&mut self) -> Vec<RunnerSnapshot> {
        let busy = self.runners.snapshots();
        // Forget items that finished so the set does not grow without bound.
        let live: HashSet<_> = busy.iter().map(task_key).collect();
        self.reported.retain(|key| live.contains(key));

        let mut newly_slow = Vec::new();
        for snapshot in busy {
            let elapsed = snapshot.task.elapsed();
            if elapsed < self.threshold || !self.reported.insert(task_key(&snapshot)) {
                continue;
            }
            tracing::warn!(
                runner = ?snapshot.runner,
                operation = %snapshot.task.description,
                partition_id = ?snapshot.task.partition_id,
                call_id = ?snapshot.task.call_id,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "slow operation detected"
            );
            metrics::counter!("gridline_slow_operations_total").increment(1);
            self.detected.fetch_add(1, Ordering::Relaxed);
            newly_slow.push(snapshot);
        }
        newly_slow
    }
}

fn task_key(snapshot: &RunnerSnapshot) -> (RunnerKind, Instant) {
    (snapshot.runner, snapshot.task.started_at)
}

#[async_trait]
impl BackgroundRunnable for SlowOperationDetector {
    type Task = MonitorCommand;

    async fn run(&mut self, task: MonitorCommand) {
        match task {
            MonitorCommand::ScanNow => {
                self.scan();
            }
            MonitorCommand::SetThreshold(threshold) => {
                tracing::debug!(?threshold, "slow operation threshold changed");
                self.threshold = threshold;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.scan();
    }

    async fn shutdown(&mut self) {
        tracing::debug!(
            detected = self.detected.load(Ordering::Relaxed),
            "slow operation monitor stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::executor::task::Task;
    use crate::invocation::{DefaultResponseHandler, InvocationRegistry, ResponseHandler};
    use crate::operation::OperationCodec;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (CountingRunnable, [Arc<AtomicU32>; 3]) {
        let counters = [
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        ];
        let runnable = CountingRunnable {
            run_count: Arc::clone(&counters[0]),
            tick_count: Arc::clone(&counters[1]),
            shutdown_called: Arc::clone(&counters[2]),
        };
        (runnable, counters)
    }

    fn runners() -> Arc<Runners> {
        let registry = Arc::new(InvocationRegistry::new());
        let responses: Arc<dyn ResponseHandler> =
            Arc::new(DefaultResponseHandler::new(registry));
        let codec = Arc::new(OperationCodec::new());
        Arc::new(Runners::new(2, 1, &responses, &codec))
    }

    /// Occupies partition runner 0 until the returned sender is dropped.
    fn block_partition_zero(
        runners: &Arc<Runners>,
    ) -> (std_mpsc::Sender<()>, std::thread::JoinHandle<()>) {
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        let runner = Arc::clone(runners.partition(0).unwrap());
        let handle = std::thread::spawn(move || {
            runner.run_task(Task::for_partition(0, move || {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                Ok(())
            }));
        });
        started_rx.recv().unwrap();
        (release_tx, handle)
    }

    #[tokio::test]
    async fn start_submit_and_stop() {
        let (runnable, [runs, _, shutdowns]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));

        worker.submit("a".to_string()).await.unwrap();
        worker.submit("b".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(worker.submit("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let (runnable, [_, ticks, _]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(110)).await;
        worker.stop().await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn idle_runners_are_never_slow() {
        let mut detector = SlowOperationDetector::new(runners(), Duration::ZERO);
        assert!(detector.scan().is_empty());
    }

    #[test]
    fn stuck_runner_is_reported_once() {
        let runners = runners();
        let (release, handle) = block_partition_zero(&runners);

        let mut detector =
            SlowOperationDetector::new(Arc::clone(&runners), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));

        let slow = detector.scan();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].runner, crate::executor::RunnerKind::Partition(0));
        assert_eq!(slow[0].task.description, "task");
        assert!(detector.scan().is_empty());
        assert_eq!(detector.detected_handle().load(Ordering::SeqCst), 1);

        drop(release);
        handle.join().unwrap();
        assert!(detector.scan().is_empty());
    }

    #[test]
    fn back_to_back_stuck_items_are_each_reported() {
        let runners = runners();
        let mut detector =
            SlowOperationDetector::new(Arc::clone(&runners), Duration::from_millis(10));

        let (release, handle) = block_partition_zero(&runners);
        std::thread::sleep(Duration::from_millis(30));
        let first = detector.scan();
        assert_eq!(first.len(), 1);
        drop(release);
        handle.join().unwrap();

        // No scan in between, so the first item is still remembered.
        let (release, handle) = block_partition_zero(&runners);
        std::thread::sleep(Duration::from_millis(30));
        let second = detector.scan();
        assert_eq!(second.len(), 1);
        assert!(second[0].task.started_at > first[0].task.started_at);
        assert_eq!(detector.detected_handle().load(Ordering::SeqCst), 2);

        drop(release);
        handle.join().unwrap();
    }

    #[test]
    fn fast_items_below_threshold_are_ignored() {
        let runners = runners();
        let (release, handle) = block_partition_zero(&runners);
        let mut detector =
            SlowOperationDetector::new(Arc::clone(&runners), Duration::from_secs(60));
        assert!(detector.scan().is_empty());
        drop(release);
        handle.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detector_runs_on_tick_and_on_command() {
        let runners = runners();
        let (release, handle) = block_partition_zero(&runners);

        let detector = SlowOperationDetector::new(Arc::clone(&runners), Duration::from_secs(60));
        let detected = detector.detected_handle();
        let mut worker = BackgroundWorker::start(detector, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(detected.load(Ordering::SeqCst), 0);

        worker
            .submit(MonitorCommand::SetThreshold(Duration::ZERO))
            .await
            .unwrap();
        worker.submit(MonitorCommand::ScanNow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(detected.load(Ordering::SeqCst), 1);

        worker.stop().await;
        drop(release);
        handle.join().unwrap();
    }
}
