// crates/tapecut-core/src/queue.rs
//
// ExportQueue: runs a batch of ExportTasks on a bounded worker pool.
//
// Dispatch:
//   run_all() moves every pending task into the in-flight set and submits all
//   of them to a rayon pool of min(tasks, cores, max_workers) threads at once.
//   The pool schedules them; nothing is refilled by hand.
//
// Accounting:
//   • progress map: task id → fraction, present only while the task is in
//     flight. Values never decrease; a terminal task (either outcome) is 1.0.
//   • overall: arithmetic mean of the batch's progress map.
//   • completed: lifetime count of terminal tasks. Failed tasks count as
//     completed; succeeded/failed are tracked separately beside it.
//   When the last task of a batch is terminal the batch watcher clears the
//   in-flight set, adds the batch size to `completed`, and sends exactly one
//   BatchComplete. progress_fraction() therefore reaches 1.0 only then.
//
// Containment:
//   An exporter error or panic marks that one task Failed. It never reaches
//   the caller of run_all() and never stops sibling tasks.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::task::ExportTask;

/// Runs one task's decode → encode work. Implemented by the FFmpeg trim
/// exporter; tests substitute fakes.
pub trait Exporter: Send + Sync {
    /// Export `task` into `output_dir`, calling `progress` with values in
    /// `[0, 1]`. Must poll `cancel` and give up once it trips.
    fn export(
        &self,
        task:       &ExportTask,
        output_dir: &Path,
        progress:   &dyn Fn(f64),
        cancel:     &CancelToken,
    ) -> Result<PathBuf>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Succeeded(PathBuf),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub total:      usize,
    pub succeeded:  usize,
    pub failed:     usize,
    pub output_dir: PathBuf,
}

/// Events sent from the worker pool to whoever holds the BatchHandle.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    TaskStarted  { task: Uuid },
    Progress     { task: Uuid, task_progress: f64, overall: f64 },
    TaskFinished { task: Uuid, outcome: TaskOutcome },
    BatchComplete(BatchSummary),
}

#[derive(Default)]
struct QueueState {
    pending:    Vec<ExportTask>,
    in_flight:  Vec<ExportTask>,
    progress:   HashMap<Uuid, f64>,
    completed:  usize,
    succeeded:  usize,
    failed:     usize,
    output_dir: Option<PathBuf>,
}

impl QueueState {
    fn overall(&self, batch: &[Uuid]) -> f64 {
        if batch.is_empty() {
            return 1.0;
        }
        let sum: f64 = batch.iter().map(|id| self.progress.get(id).copied().unwrap_or(0.0)).sum();
        sum / batch.len() as f64
    }
}

pub struct ExportQueue {
    config: QueueConfig,
    state:  Arc<Mutex<QueueState>>,
}

impl Default for ExportQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl ExportQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self { config, state: Arc::default() }
    }

    /// Append a task. No de-duplication.
    pub fn add(&self, task: ExportTask) {
        tracing::debug!(%task, "queued");
        self.state.lock().pending.push(task);
    }

    /// Snapshot of tasks waiting for the next batch, in insertion order.
    pub fn pending(&self) -> Vec<ExportTask> {
        self.state.lock().pending.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drop a task that has not been dispatched yet.
    pub fn remove(&self, id: Uuid) -> Option<ExportTask> {
        let mut state = self.state.lock();
        let idx = state.pending.iter().position(|t| t.id() == id)?;
        Some(state.pending.remove(idx))
    }

    /// Rename a task that has not been dispatched yet.
    pub fn rename_pending(&self, id: Uuid, name: &str) -> bool {
        let mut state = self.state.lock();
        state
            .pending
            .iter_mut()
            .find(|t| t.id() == id)
            .is_some_and(|t| t.rename(name))
    }

    pub fn is_in_progress(&self) -> bool {
        !self.state.lock().in_flight.is_empty()
    }

    /// Lifetime count of tasks that reached a terminal state.
    pub fn completed(&self) -> usize { self.state.lock().completed }
    pub fn succeeded(&self) -> usize { self.state.lock().succeeded }
    pub fn failed(&self) -> usize { self.state.lock().failed }

    /// Output directory of the current (or last) batch.
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.state.lock().output_dir.clone()
    }

    /// Progress of one in-flight task.
    pub fn task_progress(&self, id: Uuid) -> Option<f64> {
        self.state.lock().progress.get(&id).copied()
    }

    /// `completed / (completed + not yet terminal)`, 1.0 when nothing has
    /// ever been queued.
    pub fn progress_fraction(&self) -> f64 {
        let state = self.state.lock();
        let total = state.completed + state.pending.len() + state.in_flight.len();
        if total == 0 {
            return 1.0;
        }
        state.completed as f64 / total as f64
    }

    /// Dispatch every pending task. Returns immediately; follow the batch
    /// through the returned handle.
    pub fn run_all<E>(&self, exporter: Arc<E>, output_dir: impl Into<PathBuf>) -> Result<BatchHandle>
    where
        E: Exporter + 'static,
    {
        let output_dir = output_dir.into();

        let mut state = self.state.lock();
        if !state.in_flight.is_empty() {
            return Err(EngineError::BatchInProgress);
        }
        if state.pending.is_empty() {
            return Err(EngineError::NothingToExport);
        }

        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let workers = worker_count(state.pending.len(), parallelism, self.config.max_workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tapecut-export-{i}"))
            .build()
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

        let batch: Vec<ExportTask> = std::mem::take(&mut state.pending);
        let ids: Arc<Vec<Uuid>> = Arc::new(batch.iter().map(ExportTask::id).collect());
        for id in ids.iter() {
            state.progress.insert(*id, 0.0);
        }
        state.in_flight = batch.clone();
        state.output_dir = Some(output_dir.clone());
        drop(state);

        tracing::info!(tasks = batch.len(), workers, dir = %output_dir.display(), "export batch started");

        let (events_tx, events_rx) = unbounded::<QueueEvent>();
        let (done_tx, done_rx)     = unbounded::<TaskOutcome>();
        let cancel   = CancelToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let timeout  = self.config.task_timeout();

        for task in batch {
            let ctx = WorkerCtx {
                exporter:   Arc::clone(&exporter),
                output_dir: output_dir.clone(),
                state:      Arc::clone(&self.state),
                batch:      Arc::clone(&ids),
                events:     events_tx.clone(),
                done:       done_tx.clone(),
                cancel:     cancel.clone(),
                timeout,
            };
            pool.spawn(move || ctx.run(task));
        }
        drop(done_tx);

        let watcher = {
            let state    = Arc::clone(&self.state);
            let ids      = Arc::clone(&ids);
            let finished = Arc::clone(&finished);
            thread::Builder::new()
                .name("tapecut-batch".into())
                .spawn(move || {
                    // Keep the pool alive until every spawned task has reported.
                    let _pool = pool;
                    let mut summary = BatchSummary { total: ids.len(), output_dir, ..Default::default() };
                    for outcome in done_rx.iter().take(ids.len()) {
                        if outcome.is_success() {
                            summary.succeeded += 1;
                        } else {
                            summary.failed += 1;
                        }
                    }

                    let mut state = state.lock();
                    state.in_flight.clear();
                    for id in ids.iter() {
                        state.progress.remove(id);
                    }
                    state.completed += summary.total;
                    state.succeeded += summary.succeeded;
                    state.failed    += summary.failed;
                    finished.store(true, Ordering::Release);
                    let _ = events_tx.send(QueueEvent::BatchComplete(summary.clone()));
                    drop(state);

                    tracing::info!(
                        total = summary.total,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "export batch complete"
                    );
                    summary
                })?
        };

        Ok(BatchHandle {
            events: events_rx,
            watcher: Some(watcher),
            state: Arc::clone(&self.state),
            batch: ids,
            cancel,
            finished,
        })
    }
}

/// `min(pending, parallelism, max_workers)`, at least one.
pub fn worker_count(pending: usize, parallelism: usize, max_workers: Option<usize>) -> usize {
    pending
        .min(parallelism)
        .min(max_workers.unwrap_or(usize::MAX))
        .max(1)
}

struct WorkerCtx<E: Exporter> {
    exporter:   Arc<E>,
    output_dir: PathBuf,
    state:      Arc<Mutex<QueueState>>,
    batch:      Arc<Vec<Uuid>>,
    events:     Sender<QueueEvent>,
    done:       Sender<TaskOutcome>,
    /// Batch token. The per-task deadline is derived from it once the task starts.
    cancel:     CancelToken,
    timeout:    Option<Duration>,
}

impl<E: Exporter> WorkerCtx<E> {
    fn run(self, task: ExportTask) {
        let id = task.id();

        let outcome = match task.begin() {
            Err(e) => TaskOutcome::Failed(e.to_string()),
            Ok(()) => {
                let _ = self.events.send(QueueEvent::TaskStarted { task: id });
                let progress = |p: f64| self.record_progress(id, p);
                let cancel = self.cancel.child(self.timeout);
                let result = catch_unwind(AssertUnwindSafe(|| {
                    self.exporter.export(&task, &self.output_dir, &progress, &cancel)
                }));
                let outcome = match result {
                    Ok(Ok(path)) => TaskOutcome::Succeeded(path),
                    Ok(Err(e))   => TaskOutcome::Failed(e.to_string()),
                    Err(_)       => TaskOutcome::Failed("exporter panicked".to_string()),
                };
                let _ = match &outcome {
                    TaskOutcome::Succeeded(path) => task.succeed(path.clone()),
                    TaskOutcome::Failed(reason)  => task.fail(reason.clone()),
                };
                outcome
            }
        };

        match &outcome {
            TaskOutcome::Succeeded(path) => tracing::info!(%task, output = %path.display(), "export succeeded"),
            TaskOutcome::Failed(reason)  => tracing::warn!(%task, %reason, "export failed"),
        }

        self.record_progress(id, 1.0);
        let _ = self.events.send(QueueEvent::TaskFinished { task: id, outcome: outcome.clone() });
        let _ = self.done.send(outcome);
    }

    /// Raise (never lower) the task's entry and publish the new mean. The event
    /// is sent under the lock so observers see `overall` in order.
    fn record_progress(&self, id: Uuid, p: f64) {
        let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let mut state = self.state.lock();
        let entry = state.progress.entry(id).or_insert(0.0);
        if p > *entry {
            *entry = p;
        }
        let task_progress = *entry;
        let overall = state.overall(&self.batch);
        let _ = self.events.send(QueueEvent::Progress { task: id, task_progress, overall });
    }
}

/// Follows one running batch.
pub struct BatchHandle {
    events:   Receiver<QueueEvent>,
    watcher:  Option<JoinHandle<BatchSummary>>,
    state:    Arc<Mutex<QueueState>>,
    batch:    Arc<Vec<Uuid>>,
    cancel:   CancelToken,
    finished: Arc<AtomicBool>,
}

impl BatchHandle {
    pub fn events(&self) -> &Receiver<QueueEvent> {
        &self.events
    }

    pub fn task_ids(&self) -> &[Uuid] {
        &self.batch
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mean progress of the batch's tasks; 1.0 once the batch is complete.
    pub fn overall_progress(&self) -> f64 {
        // The watcher clears the batch's progress entries and sets `finished`
        // under the same lock, so check the flag while holding it.
        let state = self.state.lock();
        if self.is_finished() {
            return 1.0;
        }
        state.overall(&self.batch)
    }

    /// Ask every task of this batch to stop at its next packet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until every task is terminal.
    pub fn wait(mut self) -> BatchSummary {
        self.watcher
            .take()
            .and_then(|w| w.join().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::bounded;

    use crate::task::TaskState;

    /// Reports ten progress steps, fails for names starting with "bad".
    struct FakeExporter {
        step: Duration,
    }

    impl Exporter for FakeExporter {
        fn export(
            &self,
            task:       &ExportTask,
            output_dir: &Path,
            progress:   &dyn Fn(f64),
            cancel:     &CancelToken,
        ) -> Result<PathBuf> {
            for i in 1..=10 {
                if let Some(reason) = cancel.check() {
                    return Err(EngineError::export_failed(output_dir, reason.as_str()));
                }
                thread::sleep(self.step);
                progress(i as f64 / 10.0);
                if task.output_name().starts_with("bad") && i == 5 {
                    return Err(EngineError::export_failed(output_dir, "decode error"));
                }
            }
            Ok(output_dir.join(task.normalized_output_name()))
        }
    }

    /// Blocks every export until the gate is opened (by dropping the sender).
    struct GatedExporter {
        gate: Receiver<()>,
    }

    impl Exporter for GatedExporter {
        fn export(
            &self,
            task:       &ExportTask,
            output_dir: &Path,
            progress:   &dyn Fn(f64),
            _cancel:    &CancelToken,
        ) -> Result<PathBuf> {
            progress(0.5);
            let _ = self.gate.recv();
            Ok(output_dir.join(task.normalized_output_name()))
        }
    }

    struct PanickingExporter;

    impl Exporter for PanickingExporter {
        fn export(&self, _: &ExportTask, _: &Path, _: &dyn Fn(f64), _: &CancelToken) -> Result<PathBuf> {
            panic!("codec blew up");
        }
    }

    fn task(name: &str) -> ExportTask {
        ExportTask::new(format!("/tapes/{name}.avi"), name, 0.0, 10.0, None).unwrap()
    }

    fn queue(max_workers: usize) -> ExportQueue {
        ExportQueue::new(QueueConfig { max_workers: Some(max_workers), ..Default::default() })
    }

    #[test]
    fn worker_count_is_bounded() {
        assert_eq!(worker_count(3, 8, None), 3);
        assert_eq!(worker_count(3, 8, Some(2)), 2);
        assert_eq!(worker_count(10, 4, None), 4);
        assert_eq!(worker_count(0, 4, None), 1);
    }

    #[test]
    fn fraction_is_one_when_nothing_queued() {
        let q = ExportQueue::default();
        assert_eq!(q.progress_fraction(), 1.0);
        q.add(task("a"));
        assert_eq!(q.progress_fraction(), 0.0);
    }

    #[test]
    fn empty_queue_is_rejected() {
        let q = ExportQueue::default();
        let err = q.run_all(Arc::new(FakeExporter { step: Duration::ZERO }), "/out").err().unwrap();
        assert!(matches!(err, EngineError::NothingToExport));
    }

    #[test]
    fn three_tasks_on_two_workers_all_finish() {
        let q = queue(2);
        let tasks: Vec<ExportTask> = ["a", "b", "c"].into_iter().map(task).collect();
        for t in &tasks {
            q.add(t.clone());
        }

        let handle = q.run_all(Arc::new(FakeExporter { step: Duration::from_millis(2) }), "/out").unwrap();
        let events: Vec<QueueEvent> = handle.events().clone().iter()
            .take_while(|e| !matches!(e, QueueEvent::BatchComplete(_)))
            .collect();
        let summary = handle.wait();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 3);
        assert!(tasks.iter().all(|t| t.state() == TaskState::Succeeded));
        assert_eq!(tasks[0].output_path(), Some(PathBuf::from("/out/a.mp4")));

        let overall: Vec<f64> = events.iter().filter_map(|e| match e {
            QueueEvent::Progress { overall, .. } => Some(*overall),
            _ => None,
        }).collect();
        assert!(overall.windows(2).all(|w| w[1] >= w[0]), "overall progress went backwards");
        assert_eq!(overall.last().copied(), Some(1.0));

        assert_eq!(q.completed(), 3);
        assert_eq!(q.pending_count(), 0);
        assert!(!q.is_in_progress());
        assert_eq!(q.progress_fraction(), 1.0);
    }

    #[test]
    fn failure_is_contained_and_still_counted() {
        let q = queue(4);
        let good = task("good");
        let bad = task("bad-tape");
        q.add(good.clone());
        q.add(bad.clone());

        let summary = q.run_all(Arc::new(FakeExporter { step: Duration::ZERO }), "/out").unwrap().wait();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(good.is_succeeded());
        assert!(bad.is_failed());
        assert!(bad.failure().unwrap().contains("decode error"));
        assert_eq!(q.completed(), 2);
        assert_eq!(q.failed(), 1);
        assert_eq!(q.succeeded(), 1);
    }

    #[test]
    fn panics_become_failed_tasks() {
        let q = queue(1);
        let t = task("boom");
        q.add(t.clone());
        let summary = q.run_all(Arc::new(PanickingExporter), "/out").unwrap().wait();
        assert_eq!(summary.failed, 1);
        assert_eq!(t.failure().as_deref(), Some("exporter panicked"));
    }

    #[test]
    fn fraction_reaches_one_only_after_last_task() {
        let q = queue(2);
        q.add(task("a"));
        q.add(task("b"));
        let (open, gate) = bounded::<()>(0);

        let handle = q.run_all(Arc::new(GatedExporter { gate }), "/out").unwrap();
        assert!(q.is_in_progress());
        assert!(q.progress_fraction() < 1.0);
        assert!(matches!(
            q.run_all(Arc::new(FakeExporter { step: Duration::ZERO }), "/out"),
            Err(EngineError::BatchInProgress)
        ));

        // The first running task reports 0.5 before blocking on the gate.
        let first = handle.events().iter().find(|e| {
            matches!(e, QueueEvent::Progress { task_progress, .. } if *task_progress == 0.5)
        });
        assert!(first.is_some());
        let overall = handle.overall_progress();
        assert!(overall > 0.0 && overall < 1.0);
        assert!(q.progress_fraction() < 1.0);

        drop(open);
        let summary = handle.wait();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(q.progress_fraction(), 1.0);
    }

    #[test]
    fn tasks_added_during_a_batch_wait_for_the_next() {
        let q = queue(1);
        q.add(task("first"));
        let (open, gate) = bounded::<()>(0);
        let handle = q.run_all(Arc::new(GatedExporter { gate }), "/out").unwrap();

        let late = task("late");
        q.add(late.clone());
        assert_eq!(q.pending_count(), 1);
        assert_eq!(q.in_flight_count(), 1);
        assert!((q.progress_fraction() - 0.0).abs() < 1e-9);

        drop(open);
        handle.wait();
        assert!(late.is_pending());
        assert!((q.progress_fraction() - 0.5).abs() < 1e-9);

        let summary = q.run_all(Arc::new(FakeExporter { step: Duration::ZERO }), "/out").unwrap().wait();
        assert_eq!(summary.total, 1);
        assert!(late.is_succeeded());
        assert_eq!(q.completed(), 2);
    }

    #[test]
    fn cancel_fails_running_tasks() {
        let q = queue(2);
        let t = task("slow");
        q.add(t.clone());
        let handle = q.run_all(Arc::new(FakeExporter { step: Duration::from_millis(50) }), "/out").unwrap();
        handle.cancel();
        let summary = handle.wait();
        assert_eq!(summary.failed, 1);
        assert!(t.failure().unwrap().contains("cancelled"));
    }

    #[test]
    fn task_timeout_trips_the_token() {
        let q = ExportQueue::new(QueueConfig { max_workers: Some(1), task_timeout_secs: Some(1) });
        let t = task("glacial");
        q.add(t.clone());
        let summary = q
            .run_all(Arc::new(FakeExporter { step: Duration::from_millis(300) }), "/out")
            .unwrap()
            .wait();
        assert_eq!(summary.failed, 1);
        assert!(t.failure().unwrap().contains("timed out"));
    }

    #[test]
    fn timeout_starts_when_the_task_starts() {
        // Each task needs ~0.6s; the second waits ~0.6s for the single worker.
        let q = ExportQueue::new(QueueConfig { max_workers: Some(1), task_timeout_secs: Some(1) });
        let a = task("first");
        let b = task("second");
        q.add(a.clone());
        q.add(b.clone());
        let summary = q
            .run_all(Arc::new(FakeExporter { step: Duration::from_millis(60) }), "/out")
            .unwrap()
            .wait();
        assert_eq!((summary.succeeded, summary.failed), (2, 0));
        assert!(a.is_succeeded());
        assert!(b.is_succeeded(), "{:?}", b.failure());
    }

    #[test]
    fn overall_progress_is_one_after_the_batch() {
        let q = ExportQueue::default();
        q.add(task("a"));
        let handle = q
            .run_all(Arc::new(FakeExporter { step: Duration::from_millis(1) }), "/out")
            .unwrap();
        let mut last = 0.0;
        while !handle.is_finished() {
            let now = handle.overall_progress();
            assert!(now >= last, "{now} < {last}");
            last = now;
        }
        assert_eq!(handle.overall_progress(), 1.0);
        handle.wait();
    }

    #[test]
    fn remove_and_rename_pending() {
        let q = ExportQueue::default();
        let a = task("a");
        let b = task("b");
        q.add(a.clone());
        q.add(b.clone());
        assert!(q.rename_pending(b.id(), "renamed"));
        assert!(!q.rename_pending(b.id(), ""));
        assert_eq!(q.pending()[1].normalized_output_name(), "renamed.mp4");
        assert_eq!(q.remove(a.id()).map(|t| t.id()), Some(a.id()));
        assert!(q.remove(a.id()).is_none());
        assert_eq!(q.pending_count(), 1);
    }
}
