//! Component C: progress tracking, three-stage throughput sampling, and ETA
//! calibration (§4.C).

use std::time::Instant;

use tracing::info;

/// Coarse storage speed classification, for display/diagnostics only (§3, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Ssd,
    Hdd,
    NetworkSlow,
    Unknown,
}

impl StorageClass {
    fn from_speed(weighted_units_per_sec: f64) -> Self {
        if weighted_units_per_sec > 10.0 {
            StorageClass::Ssd
        } else if weighted_units_per_sec > 2.0 {
            StorageClass::Hdd
        } else {
            StorageClass::NetworkSlow
        }
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageClass::Ssd => "SSD",
            StorageClass::Hdd => "HDD",
            StorageClass::NetworkSlow => "Network/Slow",
            StorageClass::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One of the three sampling checkpoints, reached after `k * sample_size`
/// *generated* (not loaded) level-0 tasks complete (§4.C).
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: u8,
    pub elapsed_secs: f64,
    pub time_per_image_secs: f64,
    pub total_estimate_secs: f64,
    pub weighted_speed: Option<f64>,
    pub storage_class: Option<StorageClass>,
    pub message: String,
}

/// Tracks progress across an entire pyramid build and runs the three-stage
/// sampling strategy during level 0.
pub struct ProgressTracker {
    sample_size: u64,
    trend_threshold: f64,
    trend_coefficient: f64,

    total_weighted_units: f64,
    completed_weighted_units: f64,

    current_level: u32,
    current_level_weight: f64,
    is_sampling: bool,
    sample_start: Option<Instant>,
    generated_count_this_level: u64,

    stage1_total: Option<f64>,
    stage2_total: Option<f64>,

    /// Weighted units/sec. `None` until calibrated; inherited from a prior
    /// level when the caller passes `initial_speed` (§4.E step 4).
    images_per_second: Option<f64>,
    latest_stage_estimate: Option<f64>,
    storage_class: StorageClass,

    generated_count_total: u64,
    loaded_count_total: u64,

    build_start: Instant,
    last_emitted_percent: f64,
}

impl ProgressTracker {
    pub fn new(sample_size: u64, total_weighted_units: f64, initial_speed: Option<f64>) -> Self {
        ProgressTracker {
            sample_size,
            trend_threshold: 1.5,
            trend_coefficient: 0.3,
            total_weighted_units,
            completed_weighted_units: 0.0,
            current_level: 0,
            current_level_weight: 1.0,
            is_sampling: false,
            sample_start: None,
            generated_count_this_level: 0,
            stage1_total: None,
            stage2_total: None,
            images_per_second: initial_speed,
            latest_stage_estimate: None,
            storage_class: StorageClass::Unknown,
            generated_count_total: 0,
            loaded_count_total: 0,
            build_start: Instant::now(),
            last_emitted_percent: -1.0,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.build_start.elapsed().as_secs_f64()
    }

    /// Rate-limits UI callbacks: emit when progress has moved by more than
    /// 1 percentage point since the last emission (§6 "rate-limited
    /// internally to avoid UI flooding").
    pub fn should_emit(&mut self) -> bool {
        let pct = self.percent_complete();
        if (pct - self.last_emitted_percent).abs() > 1.0 {
            self.last_emitted_percent = pct;
            true
        } else {
            false
        }
    }

    pub fn with_trend_constants(mut self, threshold: f64, coefficient: f64) -> Self {
        self.trend_threshold = threshold;
        self.trend_coefficient = coefficient;
        self
    }

    /// Begin a new level. Levels >= 1 start already calibrated (§4.C state machine).
    pub fn start_level(&mut self, level: u32, level_weight: f64) {
        self.current_level = level;
        self.current_level_weight = level_weight;
        self.generated_count_this_level = 0;

        if level == 0 && self.sample_size > 0 {
            self.is_sampling = true;
            self.sample_start = Some(Instant::now());
            info!(sample_size = self.sample_size, "starting 3-stage performance sampling on level 0");
        } else {
            self.is_sampling = false;
        }
    }

    pub fn completed_weighted_units(&self) -> f64 {
        self.completed_weighted_units
    }

    pub fn generated_count(&self) -> u64 {
        self.generated_count_total
    }

    pub fn loaded_count(&self) -> u64 {
        self.loaded_count_total
    }

    pub fn images_per_second(&self) -> Option<f64> {
        self.images_per_second
    }

    pub fn storage_class(&self) -> StorageClass {
        self.storage_class
    }

    /// Record a single task completion. `weight` is that task's level weight;
    /// all completions advance `completed_weighted_units` (the progress bar),
    /// but only `was_generated` tasks advance the sampling-stage counters —
    /// loaded-from-disk thumbnails don't measure fresh throughput (§4.C
    /// "Sample filter").
    pub fn record_completion(&mut self, was_generated: bool, weight: f64) -> Option<StageReport> {
        self.completed_weighted_units += weight;

        if was_generated {
            self.generated_count_total += 1;
        } else {
            self.loaded_count_total += 1;
        }

        if !self.is_sampling || self.current_level != 0 || !was_generated {
            return None;
        }

        self.generated_count_this_level += 1;
        let n = self.generated_count_this_level;

        let stage = if n == self.sample_size {
            1
        } else if n == self.sample_size * 2 {
            2
        } else if n == self.sample_size * 3 {
            3
        } else {
            return None;
        };

        Some(self.compute_stage(stage))
    }

    fn compute_stage(&mut self, stage: u8) -> StageReport {
        let elapsed = self
            .sample_start
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
            .max(f64::EPSILON);
        let sample_count = self.sample_size * stage as u64;
        let time_per_image = elapsed / sample_count as f64;

        let mut total_estimate = self.total_weighted_units * time_per_image;

        let mut weighted_speed = None;
        let mut storage_class = None;

        match stage {
            1 => {
                self.stage1_total = Some(total_estimate);
                self.latest_stage_estimate = Some(total_estimate);
            }
            2 => {
                self.stage2_total = Some(total_estimate);
                self.latest_stage_estimate = Some(total_estimate);
            }
            3 => {
                let speed = (sample_count as f64 * self.current_level_weight) / elapsed;
                self.images_per_second = Some(speed);
                weighted_speed = Some(speed);

                if let Some(stage1) = self.stage1_total {
                    if total_estimate > self.trend_threshold * stage1 {
                        let trend_factor = total_estimate / stage1;
                        total_estimate *= 1.0 + (trend_factor - 1.0) * self.trend_coefficient;
                    }
                }

                self.storage_class = StorageClass::from_speed(speed);
                storage_class = Some(self.storage_class);
                self.latest_stage_estimate = Some(total_estimate);
                self.is_sampling = false;
            }
            _ => unreachable!("sampling only has 3 stages"),
        }

        let message = match stage {
            1 => format!(
                "stage 1 sampling: {sample_count} images in {elapsed:.2}s, {time_per_image:.3}s/image, initial estimate {total_estimate:.1}s"
            ),
            2 => format!(
                "stage 2 sampling: {sample_count} images in {elapsed:.2}s, {time_per_image:.3}s/image, revised estimate {total_estimate:.1}s"
            ),
            3 => format!(
                "stage 3 sampling complete: {:.1} weighted units/sec, storage class {}, final estimate {:.1}s",
                weighted_speed.unwrap_or(0.0),
                storage_class.unwrap_or(StorageClass::Unknown),
                total_estimate
            ),
            _ => unreachable!(),
        };
        info!("{message}");

        StageReport {
            stage,
            elapsed_secs: elapsed,
            time_per_image_secs: time_per_image,
            total_estimate_secs: total_estimate,
            weighted_speed,
            storage_class,
            message,
        }
    }

    /// ETA in seconds: a stage placeholder before calibration, otherwise the
    /// calibrated `(remaining weighted units) / (weighted units per second)`
    /// (§4.C "ETA delivery").
    pub fn eta_seconds(&self) -> Option<f64> {
        match self.images_per_second {
            Some(speed) if speed > 0.0 => {
                let remaining = (self.total_weighted_units - self.completed_weighted_units).max(0.0);
                Some(remaining / speed)
            }
            _ => self.latest_stage_estimate,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_weighted_units <= 0.0 {
            100.0
        } else {
            (self.completed_weighted_units / self.total_weighted_units * 100.0).min(100.0)
        }
    }
}

/// Human-readable duration: `Xh Ym` / `Xm Ys` / `Xs`.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "unknown".to_string();
    }
    let secs = seconds as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
