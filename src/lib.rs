//! Pyramidal thumbnail builder for CT reconstruction slice stacks.
//!
//! Given a directory of reconstructed CT slices and the reconstruction log
//! that describes them, [`build_pyramid`] builds a multi-resolution
//! thumbnail pyramid (`.thumbnail/1`, `.thumbnail/2`, ...), each level half
//! the linear size of the one below, down to a level small enough to hold
//! entirely in memory as a 3D volume.

mod error;
mod logging;
mod manifest;
mod orchestrator;
mod pool;
mod progress;
mod worker;

pub use error::{ManifestError, PyramidError, TaskError, WorkerError};
pub use logging::init_logging;
pub use manifest::{is_recognised_image_extension, BitDepth, DatasetManifest, SliceDescriptor};
pub use progress::{format_duration, StorageClass};

use std::path::Path;
use std::sync::Arc;

/// Tunable build parameters (§6). All fields have defaults matching the
/// source tool's own defaults; callers normally only override a handful.
#[derive(Debug, Clone)]
pub struct PyramidConfig {
    /// Stop building further levels once `max(width, height)` for a level
    /// drops below this value.
    pub max_thumbnail_size: u32,
    /// Hard cap on the number of levels built, regardless of size.
    pub max_pyramid_levels: u32,
    /// Number of *generated* level-0 tasks per sampling stage (§4.C). Set to
    /// 0 to disable sampling entirely (every level starts uncalibrated).
    pub sample_size: u64,
    /// Rayon thread pool size.
    pub worker_threads: usize,
    /// Seconds with zero observed completions before a stall warning fires.
    pub stall_threshold_seconds: u64,
    /// Cadence, in tasks, of the buffer-drop checkpoint log line.
    pub gc_interval_tasks: u64,
    /// Stage-3 estimate is revised upward only once it exceeds
    /// `trend_threshold * stage1_total`.
    pub trend_threshold: f64,
    /// Weight applied to the trend-vs-stage1 ratio when revising the estimate.
    pub trend_coefficient: f64,
    /// Per-level progress weight multiplier: `level_weight(L) = factor^L`.
    pub level_reduction_factor: f64,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        PyramidConfig {
            max_thumbnail_size: 512,
            max_pyramid_levels: 10,
            sample_size: 5,
            worker_threads: num_cpus(),
            stall_threshold_seconds: 60,
            gc_interval_tasks: 100,
            trend_threshold: 1.5,
            trend_coefficient: 0.3,
            level_reduction_factor: 0.25,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// One progress callback, delivered from a worker thread (§6). Implementors
/// must be cheap and non-blocking; `on_progress` is called from inside the
/// pool's task closures.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
    /// Polled periodically by the orchestrator; return `true` to request
    /// cooperative cancellation (§4.D, §5).
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A single progress update, rate-limited internally to roughly one per
/// percentage point of overall (weighted) progress, plus every stage
/// transition and the final task of each level (§4.C, §6).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub level: u32,
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    pub elapsed_secs: f64,
    pub speed_weighted_units_per_sec: Option<f64>,
    pub eta_secs: Option<f64>,
    pub eta_formatted: Option<String>,
    pub stage: Option<u8>,
    pub storage_class: Option<String>,
}

/// The final, in-memory volume for the smallest built level, as a flat
/// depth-major buffer of either 8- or 16-bit grayscale samples (§4.E).
#[derive(Debug, Clone)]
pub enum VolumeData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub depth: u32,
    pub width: u32,
    pub height: u32,
    pub data: VolumeData,
}

/// Outcome of a build. `cancelled` and `volume` are mutually significant:
/// a cancelled build never carries a volume, even if the final level had
/// already finished when cancellation was observed (§4.D, §7).
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub cancelled: bool,
    pub last_completed_level: Option<u32>,
    pub volume: Option<Volume>,
    pub errors: Vec<TaskError>,
    pub generated_count: u64,
    pub loaded_count: u64,
}

/// Build the full pyramid for `input_dir`. See [`PyramidConfig`] for tuning
/// knobs and [`ProgressSink`] for progress/cancellation wiring.
pub fn build_pyramid(
    input_dir: &Path,
    config: &PyramidConfig,
    sink: Option<Arc<dyn ProgressSink>>,
) -> Result<BuildResult, PyramidError> {
    orchestrator::build_pyramid(input_dir, config, sink)
}
