//! Command-line front end for the pyramid builder.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use ct_pyramid::{build_pyramid, init_logging, ProgressEvent, ProgressSink, PyramidConfig};

/// Build a pyramidal thumbnail set from a directory of CT reconstruction slices.
#[derive(Parser, Debug)]
#[command(name = "ct_pyramid", version, about)]
struct Cli {
    /// Directory containing the reconstruction log and source slices.
    input_dir: PathBuf,

    /// Stop building further levels once max(width, height) drops below this.
    #[arg(long, default_value_t = 512)]
    max_thumbnail_size: u32,

    /// Hard cap on the number of levels built.
    #[arg(long, default_value_t = 10)]
    max_pyramid_levels: u32,

    /// Generated-task sample size per sampling stage (0 disables sampling).
    #[arg(long, default_value_t = 5)]
    sample_size: u64,

    /// Worker thread count. Defaults to available parallelism.
    #[arg(long)]
    threads: Option<usize>,

    /// Seconds with no observed completions before a stall warning fires.
    #[arg(long, default_value_t = 60)]
    stall_threshold_seconds: u64,
}

struct ConsoleSink {
    cancelled: AtomicBool,
}

impl ProgressSink for ConsoleSink {
    fn on_progress(&self, event: ProgressEvent) {
        let eta = event.eta_formatted.as_deref().unwrap_or("calculating...");
        info!(
            "level {} [{}/{}] {:.1}% eta {} {}",
            event.level,
            event.current,
            event.total,
            event.percent,
            eta,
            event.storage_class.as_deref().unwrap_or(""),
        );
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let mut config = PyramidConfig {
        max_thumbnail_size: cli.max_thumbnail_size,
        max_pyramid_levels: cli.max_pyramid_levels,
        sample_size: cli.sample_size,
        stall_threshold_seconds: cli.stall_threshold_seconds,
        ..PyramidConfig::default()
    };
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }

    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink {
        cancelled: AtomicBool::new(false),
    });

    match build_pyramid(&cli.input_dir, &config, Some(Arc::clone(&sink))) {
        Ok(result) => {
            if result.cancelled {
                warn!(
                    last_completed_level = ?result.last_completed_level,
                    "build cancelled"
                );
                return ExitCode::from(2);
            }
            info!(
                generated = result.generated_count,
                loaded = result.loaded_count,
                errors = result.errors.len(),
                "build complete"
            );
            for task_error in &result.errors {
                warn!("{task_error}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
