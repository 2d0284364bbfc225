//! Component D: worker pool manager. Submits tasks to a fixed-size thread
//! pool, reconstructs ascending-index order on completion, and enforces
//! cooperative cancellation with a grace period (§4.D, §5).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::progress::ProgressTracker;
use crate::worker::{run_task, GrayBuffer, TaskSpec, WorkerOutcome};
use crate::{ProgressEvent, ProgressSink};

/// Transient, per-level state: the result map keyed by `output_index`, the
/// completion counter, and collected task errors. Owned exclusively by the
/// pool manager for the lifetime of one level (§3 "Ownership").
pub struct LevelRun {
    level: u32,
    results: Arc<Mutex<HashMap<u64, WorkerOutcome>>>,
    submitted: Arc<Mutex<HashSet<u64>>>,
    completed: Arc<AtomicU64>,
    errors: Arc<Mutex<Vec<TaskError>>>,
}

impl LevelRun {
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> std::io::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .build()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(WorkerPool {
            pool,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn begin_level(&self, level: u32) -> LevelRun {
        LevelRun {
            level,
            results: Arc::new(Mutex::new(HashMap::new())),
            submitted: Arc::new(Mutex::new(HashSet::new())),
            completed: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Push one task into the pool. Idempotent w.r.t. duplicate
    /// `output_index`: a second submission for an index already queued or
    /// completed is ignored and logged (§4.D).
    pub fn submit(
        &self,
        run: &LevelRun,
        task: TaskSpec,
        level_weight: f64,
        gc_interval_tasks: u64,
        total: u64,
        tracker: Arc<Mutex<ProgressTracker>>,
        sink: Option<Arc<dyn ProgressSink>>,
    ) {
        {
            let mut submitted = run.submitted.lock();
            if !submitted.insert(task.output_index) {
                warn!(output_index = task.output_index, "duplicate task submission ignored");
                return;
            }
        }

        let cancel = Arc::clone(&self.cancel);
        let results = Arc::clone(&run.results);
        let completed = Arc::clone(&run.completed);
        let errors = Arc::clone(&run.errors);
        let level = run.level;

        self.pool.spawn(move || {
            let output_index = task.output_index;
            let outcome = run_task(&task, &cancel, gc_interval_tasks.max(1));

            let mut first_insertion = true;
            {
                let mut r = results.lock();
                if r.contains_key(&output_index) {
                    first_insertion = false;
                } else {
                    if let Some(err) = &outcome.error {
                        errors.lock().push(TaskError {
                            level,
                            output_index,
                            source: err.clone(),
                        });
                    }
                    r.insert(output_index, outcome);
                }
            }
            if !first_insertion {
                warn!(output_index, "duplicate result for task, first result wins");
                completed.fetch_add(1, Ordering::SeqCst);
                return;
            }

            let was_generated_ok = {
                let r = results.lock();
                r.get(&output_index).map(|o| o.error.is_none() && o.was_generated).unwrap_or(false)
            };

            let stage_report = tracker.lock().record_completion(was_generated_ok, level_weight);
            if let Some(report) = &stage_report {
                info!(stage = report.stage, "{}", report.message);
            }

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some(sink) = &sink {
                let force_emit = stage_report.is_some() || done == total;
                let mut t = tracker.lock();
                if force_emit || t.should_emit() {
                    let event = build_event(&t, level, done, total, stage_report.as_ref().map(|r| r.stage));
                    drop(t);
                    sink.on_progress(event);
                }
            }
        });
    }

    /// Block until `total` tasks for this level have completed or
    /// cancellation is observed. Periodically polls `sink.is_cancelled()`
    /// (the caller's responsibility to pump any UI event queue) and logs
    /// heartbeats / stall warnings (§4.D).
    pub fn wait_for_completion(
        &self,
        run: &LevelRun,
        total: u64,
        stall_threshold: Duration,
        sink: Option<&dyn ProgressSink>,
    ) -> bool {
        let start = Instant::now();
        let mut last_heartbeat = Instant::now();
        let mut last_stall_log = Instant::now();
        let mut last_completed = run.completed_count();
        let mut stalled_since: Option<Instant> = None;

        loop {
            if run.completed_count() >= total {
                break;
            }
            if let Some(sink) = sink {
                if sink.is_cancelled() {
                    self.request_cancel();
                }
            }
            if self.is_cancelled() {
                break;
            }

            let now = Instant::now();
            if now.duration_since(last_heartbeat) > Duration::from_secs(5) {
                debug!(
                    completed = run.completed_count(),
                    total,
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    "waiting for level workers"
                );
                last_heartbeat = now;

                let completed_now = run.completed_count();
                if completed_now == last_completed {
                    let since = stalled_since.get_or_insert(now);
                    if now.duration_since(*since) >= stall_threshold {
                        warn!(completed = completed_now, total, "no progress for {:?}; workers may be stalled", stall_threshold);
                        if now.duration_since(last_stall_log) >= stall_threshold {
                            info!("check disk I/O performance or storage space");
                            last_stall_log = now;
                        }
                    }
                } else {
                    stalled_since = None;
                    last_completed = completed_now;
                }
            }

            thread::sleep(Duration::from_millis(10));
        }

        if self.is_cancelled() {
            info!("build cancelled; waiting up to 2s for in-flight workers");
            let grace_start = Instant::now();
            while run.completed_count() < total && grace_start.elapsed() < Duration::from_secs(2) {
                thread::sleep(Duration::from_millis(50));
            }
            if run.completed_count() < total {
                warn!("some workers may still be running after cancellation grace period");
            }
            return true;
        }

        false
    }

    /// Collect arrays in strictly ascending `output_index` order, skipping
    /// indices with no array (gap from a task-local error or a non-final
    /// level that didn't request one) (§4.D, §8 invariants).
    pub fn get_ordered_results(&self, run: &LevelRun, total: u64) -> Vec<(u32, u32, GrayBuffer)> {
        let results = run.results.lock();
        let mut out = Vec::new();
        for idx in 0..total {
            if let Some(outcome) = results.get(&idx) {
                if let Some(array) = &outcome.array {
                    out.push(array.clone());
                }
            }
        }
        out
    }

    pub fn take_errors(&self, run: &LevelRun) -> Vec<TaskError> {
        std::mem::take(&mut run.errors.lock())
    }
}

fn build_event(
    tracker: &ProgressTracker,
    level: u32,
    current: u64,
    total: u64,
    stage: Option<u8>,
) -> ProgressEvent {
    let eta = tracker.eta_seconds();
    ProgressEvent {
        level,
        current,
        total,
        percent: tracker.percent_complete(),
        elapsed_secs: tracker.elapsed_secs(),
        speed_weighted_units_per_sec: tracker.images_per_second(),
        eta_secs: eta,
        eta_formatted: eta.map(crate::progress::format_duration),
        stage,
        storage_class: Some(tracker.storage_class().to_string()),
    }
}
