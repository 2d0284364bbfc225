//! Integration tests against small synthetic slice stacks.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::{ImageBuffer, ImageReader, Luma};
use tempfile::TempDir;

use ct_pyramid::{build_pyramid, ProgressEvent, ProgressSink, PyramidConfig, VolumeData};

fn write_log(
    dir: &Path,
    prefix: &str,
    index_length: usize,
    file_type: &str,
    width: u32,
    height: u32,
    seq_begin: u32,
    seq_end: u32,
) {
    let content = format!(
        "[File name convention]\nFilename Prefix = {prefix}\nFilename Index Length = {index_length}\n\n\
         [Reconstruction]\nResult File Type = {file_type}\nResult Image Width (pixels) = {width}\n\
         Result Image Height (pixels) = {height}\nFirst Section = {seq_begin}\nLast Section = {seq_end}\n"
    );
    fs::write(dir.join("recon.log"), content).unwrap();
}

fn write_u8_slice(dir: &Path, prefix: &str, index_length: usize, seq: u32, w: u32, h: u32, value: u8) {
    let path = dir.join(format!("{prefix}{:0width$}.tif", seq, width = index_length));
    let img = ImageBuffer::<Luma<u8>, _>::from_pixel(w, h, Luma([value]));
    img.save(path).unwrap();
}

fn write_u16_slice(dir: &Path, prefix: &str, index_length: usize, seq: u32, w: u32, h: u32, value: u16) {
    let path = dir.join(format!("{prefix}{:0width$}.tif", seq, width = index_length));
    let img = ImageBuffer::<Luma<u16>, _>::from_pixel(w, h, Luma([value]));
    img.save(path).unwrap();
}

fn read_u8_slice(path: &Path) -> (u32, u32, Vec<u8>) {
    let img = ImageReader::open(path).unwrap().decode().unwrap().to_luma8();
    let (w, h) = img.dimensions();
    (w, h, img.into_raw())
}

struct NullSink;
impl ProgressSink for NullSink {
    fn on_progress(&self, _event: ProgressEvent) {}
}

#[test]
fn power_of_two_stack_builds_two_levels_and_stops() {
    let dir = TempDir::new().unwrap();
    let prefix = "slice_";
    write_log(dir.path(), prefix, 4, "tif", 256, 256, 0, 7);
    for seq in 0..8 {
        write_u8_slice(dir.path(), prefix, 4, seq, 256, 256, 100);
    }

    let config = PyramidConfig {
        max_thumbnail_size: 128,
        worker_threads: 2,
        ..PyramidConfig::default()
    };
    let result = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!result.cancelled);
    assert_eq!(result.last_completed_level, Some(1));
    assert!(result.errors.is_empty());

    let level1_dir = dir.path().join(".thumbnail").join("1");
    let entries: Vec<_> = fs::read_dir(&level1_dir).unwrap().collect();
    assert_eq!(entries.len(), 4);
    let (w, h, px) = read_u8_slice(&level1_dir.join("000000.tif"));
    assert_eq!((w, h), (128, 128));
    assert!(px.iter().all(|&v| v == 100));

    let level2_dir = dir.path().join(".thumbnail").join("2");
    let entries: Vec<_> = fs::read_dir(&level2_dir).unwrap().collect();
    assert_eq!(entries.len(), 2);
    let (w, h, px) = read_u8_slice(&level2_dir.join("000001.tif"));
    assert_eq!((w, h), (64, 64));
    assert!(px.iter().all(|&v| v == 100));

    let volume = result.volume.expect("final level volume");
    assert_eq!(volume.depth, 2);
    assert_eq!((volume.width, volume.height), (64, 64));
    match volume.data {
        VolumeData::U8(data) => assert!(data.iter().all(|&v| v == 100)),
        VolumeData::U16(_) => panic!("expected 8-bit volume"),
    }
}

#[test]
fn odd_count_tail_task_downsamples_lone_survivor() {
    let dir = TempDir::new().unwrap();
    let prefix = "s_";
    write_log(dir.path(), prefix, 3, "tif", 4, 4, 0, 4);
    let values = [10u8, 20, 30, 40, 50];
    for (seq, &v) in values.iter().enumerate() {
        write_u8_slice(dir.path(), prefix, 3, seq as u32, 4, 4, v);
    }

    // Force level 0 to be the only (and therefore final) level so we can
    // inspect its outputs directly.
    let config = PyramidConfig {
        max_pyramid_levels: 1,
        worker_threads: 2,
        ..PyramidConfig::default()
    };
    let result = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!result.cancelled);

    let level_dir = dir.path().join(".thumbnail").join("1");
    let (_, _, px0) = read_u8_slice(&level_dir.join("000000.tif"));
    let (_, _, px1) = read_u8_slice(&level_dir.join("000001.tif"));
    let (_, _, px2) = read_u8_slice(&level_dir.join("000002.tif"));
    assert!(px0.iter().all(|&v| v == 15));
    assert!(px1.iter().all(|&v| v == 35));
    assert!(px2.iter().all(|&v| v == 50));
}

#[test]
fn mixed_bit_depth_pair_promotes_then_averages() {
    let dir = TempDir::new().unwrap();
    let prefix = "m_";
    write_log(dir.path(), prefix, 2, "tif", 2, 2, 0, 1);
    write_u8_slice(dir.path(), prefix, 2, 0, 2, 2, 100);
    write_u16_slice(dir.path(), prefix, 2, 1, 2, 2, 25600);

    let config = PyramidConfig {
        max_pyramid_levels: 1,
        worker_threads: 1,
        ..PyramidConfig::default()
    };
    let result = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!result.cancelled);
    assert!(result.errors.is_empty());

    let volume = result.volume.expect("volume");
    assert_eq!(volume.depth, 1);
    match volume.data {
        VolumeData::U16(data) => assert!(data.iter().all(|&v| v == 25600)),
        VolumeData::U8(_) => panic!("expected 16-bit volume after promotion"),
    }
}

#[test]
fn missing_paired_source_file_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let prefix = "g_";
    write_log(dir.path(), prefix, 2, "tif", 4, 4, 0, 7);
    for seq in 0..8u32 {
        if seq == 3 {
            continue; // the 4th file (1-indexed), second member of pair (2, 3)
        }
        write_u8_slice(dir.path(), prefix, 2, seq, 4, 4, 100);
    }

    let config = PyramidConfig {
        max_pyramid_levels: 1,
        worker_threads: 1,
        ..PyramidConfig::default()
    };
    let result = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!result.cancelled);
    assert!(result.errors.is_empty(), "a tolerated missing pair member is not a task failure");

    let level_dir = dir.path().join(".thumbnail").join("1");
    let entries: Vec<_> = fs::read_dir(&level_dir).unwrap().collect();
    assert_eq!(entries.len(), 4);
    let (_, _, px1) = read_u8_slice(&level_dir.join("000001.tif"));
    assert!(px1.iter().all(|&v| v == 100));
}

#[test]
fn missing_first_pair_member_is_tolerated_symmetrically() {
    let dir = TempDir::new().unwrap();
    let prefix = "h_";
    write_log(dir.path(), prefix, 2, "tif", 4, 4, 0, 7);
    for seq in 0..8u32 {
        if seq == 2 {
            continue; // the first member of pair (2, 3); only the second survives
        }
        let value = if seq == 3 { 60 } else { 100 };
        write_u8_slice(dir.path(), prefix, 2, seq, 4, 4, value);
    }

    let config = PyramidConfig {
        max_pyramid_levels: 1,
        worker_threads: 1,
        ..PyramidConfig::default()
    };
    let result = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!result.cancelled);
    assert!(
        result.errors.is_empty(),
        "a tolerated missing pair member is not a task failure, regardless of pair position"
    );

    let level_dir = dir.path().join(".thumbnail").join("1");
    let entries: Vec<_> = fs::read_dir(&level_dir).unwrap().collect();
    assert_eq!(entries.len(), 4);
    // Output index 1 pairs source seq 2 (missing) and 3 (value 60); the
    // surviving source 3 must be downsampled on its own, not skipped.
    let (_, _, px1) = read_u8_slice(&level_dir.join("000001.tif"));
    assert!(px1.iter().all(|&v| v == 60));
}

struct CancelAfterN {
    threshold: u64,
    seen: AtomicU64,
    cancelled: AtomicBool,
}

impl ProgressSink for CancelAfterN {
    fn on_progress(&self, _event: ProgressEvent) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[test]
fn resume_after_cancellation_reuses_existing_outputs() {
    let dir = TempDir::new().unwrap();
    let prefix = "r_";
    write_log(dir.path(), prefix, 2, "tif", 4, 4, 0, 9);
    for seq in 0..10u32 {
        write_u8_slice(dir.path(), prefix, 2, seq, 4, 4, 100);
    }

    let config = PyramidConfig {
        max_pyramid_levels: 1,
        worker_threads: 1,
        ..PyramidConfig::default()
    };

    let cancel_sink = Arc::new(CancelAfterN {
        threshold: 3,
        seen: AtomicU64::new(0),
        cancelled: AtomicBool::new(false),
    });
    let first = build_pyramid(dir.path(), &config, Some(cancel_sink)).unwrap();
    assert!(first.cancelled);
    assert_eq!(first.last_completed_level, None);

    let level_dir = dir.path().join(".thumbnail").join("1");
    let partial_count = fs::read_dir(&level_dir).unwrap().count();
    assert!(partial_count >= 3 && partial_count < 5, "expected a partial level, got {partial_count}");

    let second = build_pyramid(dir.path(), &config, Some(Arc::new(NullSink))).unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.last_completed_level, Some(0));

    let final_count = fs::read_dir(&level_dir).unwrap().count();
    assert_eq!(final_count, 5);
    for idx in 0..5 {
        let (_, _, px) = read_u8_slice(&level_dir.join(format!("{:06}.tif", idx)));
        assert!(px.iter().all(|&v| v == 100));
    }
}

struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for CollectingSink {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[test]
fn eta_calibration_reaches_stage_three() {
    let dir = TempDir::new().unwrap();
    let prefix = "e_";
    write_log(dir.path(), prefix, 3, "tif", 2, 2, 0, 59);
    for seq in 0..60u32 {
        write_u8_slice(dir.path(), prefix, 3, seq, 2, 2, 7);
    }

    let config = PyramidConfig {
        max_pyramid_levels: 1,
        sample_size: 5,
        worker_threads: 1,
        ..PyramidConfig::default()
    };
    let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
    let result = build_pyramid(dir.path(), &config, Some(Arc::clone(&sink) as Arc<dyn ProgressSink>)).unwrap();
    assert!(!result.cancelled);

    let events = sink.events.lock().unwrap();
    let stage3_index = events.iter().position(|e| e.stage == Some(3));
    assert!(events.iter().any(|e| e.stage == Some(1)));
    assert!(events.iter().any(|e| e.stage == Some(2)));
    let stage3_index = stage3_index.expect("stage 3 must be reached within 30 level-0 outputs");

    for event in &events[stage3_index..] {
        let eta = event.eta_secs.expect("eta must be calibrated after stage 3");
        assert!(eta.is_finite() && eta >= 0.0);
    }
}
