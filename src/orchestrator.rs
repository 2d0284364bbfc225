//! Component E: pyramid orchestrator. Drives levels 0..N, wiring the slice
//! inventory (A), pixel workers (B), progress tracker (C) and worker pool
//! (D) together, and assembles the final in-memory volume (§4.E).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::error::{PyramidError, TaskError};
use crate::manifest::{self, DatasetManifest};
use crate::pool::WorkerPool;
use crate::progress::ProgressTracker;
use crate::worker::{GrayBuffer, TaskSpec};
use crate::{BuildResult, ProgressSink, PyramidConfig, Volume, VolumeData};

/// Precomputed, static description of one pyramid level. The whole plan is
/// computed up front because `output_count(L) = ceil(n/2)` is a pure
/// function of the initial slice count and does not depend on which source
/// files are actually present on disk (§8 invariant).
#[derive(Debug, Clone)]
struct LevelPlan {
    level_index: u32,
    source_seq_begin: u32,
    source_seq_end: u32,
    output_count: u64,
    /// This level's own width/height: `floor(source/2)` (§3).
    out_width: u32,
    out_height: u32,
    level_weight: f64,
    is_final: bool,
}

fn compute_plan(manifest: &DatasetManifest, cfg: &PyramidConfig) -> Vec<LevelPlan> {
    let mut plans = Vec::new();

    let mut level_index = 0u32;
    let mut input_count = manifest.slice_count() as u64;
    let mut seq_begin = manifest.seq_begin;
    let mut seq_end = manifest.seq_end;
    let mut source_width = manifest.image_width;
    let mut source_height = manifest.image_height;

    loop {
        let output_count = (input_count + 1) / 2;
        let out_width = source_width / 2;
        let out_height = source_height / 2;
        let level_weight = cfg.level_reduction_factor.powi(level_index as i32);

        let is_final = output_count == 0
            || out_width.max(out_height) < cfg.max_thumbnail_size
            || level_index + 1 >= cfg.max_pyramid_levels;

        plans.push(LevelPlan {
            level_index,
            source_seq_begin: seq_begin,
            source_seq_end: seq_end,
            output_count,
            out_width,
            out_height,
            level_weight,
            is_final,
        });

        if is_final {
            break;
        }

        level_index += 1;
        input_count = output_count;
        seq_begin = 0;
        seq_end = (output_count.saturating_sub(1)) as u32;
        source_width = out_width;
        source_height = out_height;
    }

    plans
}

fn level_dir(base_out: &Path, level_index: u32) -> std::path::PathBuf {
    // Directories are 1-based (`.thumbnail/1` is level_index 0) per §6.
    base_out.join((level_index + 1).to_string())
}

fn assemble_volume(mut arrays: Vec<(u32, u32, GrayBuffer)>, width: u32, height: u32) -> Volume {
    if arrays.is_empty() {
        return Volume {
            depth: 0,
            width,
            height,
            data: VolumeData::U8(Vec::new()),
        };
    }

    let is_16bit = matches!(arrays[0].2, GrayBuffer::Sixteen(_));
    let depth = arrays.len() as u32;

    if is_16bit {
        let mut data = Vec::with_capacity((width as usize) * (height as usize) * arrays.len());
        for (_, _, buf) in arrays.drain(..) {
            match buf {
                GrayBuffer::Sixteen(v) => data.extend(v),
                GrayBuffer::Eight(v) => data.extend(v.into_iter().map(|x| (x as u16) << 8)),
            }
        }
        Volume {
            depth,
            width,
            height,
            data: VolumeData::U16(data),
        }
    } else {
        let mut data = Vec::with_capacity((width as usize) * (height as usize) * arrays.len());
        for (_, _, buf) in arrays.drain(..) {
            match buf {
                GrayBuffer::Eight(v) => data.extend(v),
                GrayBuffer::Sixteen(v) => data.extend(v.into_iter().map(|x| (x >> 8) as u8)),
            }
        }
        Volume {
            depth,
            width,
            height,
            data: VolumeData::U8(data),
        }
    }
}

/// Run the full pyramid build over `input_dir`. Fatal (manifest) errors
/// abort before any work; task-local errors are collected into
/// `BuildResult::errors` instead (§7).
pub fn build_pyramid(
    input_dir: &Path,
    cfg: &PyramidConfig,
    sink: Option<Arc<dyn ProgressSink>>,
) -> Result<BuildResult, PyramidError> {
    let dataset_manifest = manifest::parse_manifest(input_dir)?;
    let bit_depth = manifest::probe_bit_depth(&dataset_manifest, input_dir)?;
    info!(
        prefix = %dataset_manifest.prefix,
        slices = dataset_manifest.slice_count(),
        ?bit_depth,
        "parsed slice inventory"
    );

    let plan = compute_plan(&dataset_manifest, cfg);
    let total_weighted_units: f64 = plan.iter().map(|p| p.output_count as f64 * p.level_weight).sum();

    let tracker = Arc::new(Mutex::new(
        ProgressTracker::new(cfg.sample_size, total_weighted_units, None)
            .with_trend_constants(cfg.trend_threshold, cfg.trend_coefficient),
    ));

    let pool = WorkerPool::new(cfg.worker_threads).map_err(|e| PyramidError::ThreadPool(e.to_string()))?;

    let base_out = input_dir.join(".thumbnail");
    std::fs::create_dir_all(&base_out).map_err(|e| PyramidError::Directory(base_out.clone(), e))?;

    let mut errors: Vec<TaskError> = Vec::new();
    let mut last_completed_level: Option<u32> = None;
    let mut volume: Option<Volume> = None;

    for lvl in &plan {
        let target_dir = level_dir(&base_out, lvl.level_index);
        std::fs::create_dir_all(&target_dir).map_err(|e| PyramidError::Directory(target_dir.clone(), e))?;

        let source_dir = if lvl.level_index == 0 {
            input_dir.to_path_buf()
        } else {
            level_dir(&base_out, lvl.level_index - 1)
        };

        tracker.lock().start_level(lvl.level_index, lvl.level_weight);
        info!(
            level = lvl.level_index,
            outputs = lvl.output_count,
            width = lvl.out_width,
            height = lvl.out_height,
            "building pyramid level"
        );

        let run = pool.begin_level(lvl.level_index);

        for out_idx in 0..lvl.output_count {
            let source_seq = lvl.source_seq_begin + 2 * (out_idx as u32);
            let task = TaskSpec {
                output_index: out_idx,
                source_seq,
                source_seq_begin: lvl.source_seq_begin,
                source_seq_end: lvl.source_seq_end,
                level_index: lvl.level_index,
                source_dir: source_dir.clone(),
                target_dir: target_dir.clone(),
                level0_manifest: if lvl.level_index == 0 {
                    Some(dataset_manifest.clone())
                } else {
                    None
                },
                want_array: lvl.is_final,
            };
            pool.submit(
                &run,
                task,
                lvl.level_weight,
                cfg.gc_interval_tasks,
                lvl.output_count,
                Arc::clone(&tracker),
                sink.clone(),
            );
        }

        let cancelled = pool.wait_for_completion(
            &run,
            lvl.output_count,
            Duration::from_secs(cfg.stall_threshold_seconds),
            sink.as_deref().map(|s| s as &dyn ProgressSink),
        );
        errors.extend(pool.take_errors(&run));

        if cancelled {
            let t = tracker.lock();
            return Ok(BuildResult {
                cancelled: true,
                last_completed_level,
                volume: None,
                errors,
                generated_count: t.generated_count(),
                loaded_count: t.loaded_count(),
            });
        }

        last_completed_level = Some(lvl.level_index);

        if lvl.is_final {
            let arrays = pool.get_ordered_results(&run, lvl.output_count);
            volume = Some(assemble_volume(arrays, lvl.out_width, lvl.out_height));
        }
    }

    let t = tracker.lock();
    Ok(BuildResult {
        cancelled: false,
        last_completed_level,
        volume,
        errors,
        generated_count: t.generated_count(),
        loaded_count: t.loaded_count(),
    })
}
