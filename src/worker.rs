//! Component B: pixel worker. Loads one or two source images, averages them,
//! downsamples 2x, and persists one thumbnail — or confirms an existing one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageBuffer, ImageReader, Luma};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::manifest::DatasetManifest;

/// A decoded grayscale buffer that remembers its own bit depth (§9: replaces
/// the source's dynamic pixel-mode checks with a tagged variant).
#[derive(Debug, Clone)]
pub enum GrayBuffer {
    Eight(Vec<u8>),
    Sixteen(Vec<u16>),
}

impl GrayBuffer {
    pub fn is_16bit(&self) -> bool {
        matches!(self, GrayBuffer::Sixteen(_))
    }
}

/// One unit of work within a level: pair (or tail single) source -> one output (§3).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub output_index: u64,
    pub source_seq: u32,
    pub source_seq_begin: u32,
    pub source_seq_end: u32,
    pub level_index: u32,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Only present for level 0, where filenames follow the manifest's
    /// prefix/index-length/file-type convention rather than plain `%06d.tif`.
    pub level0_manifest: Option<DatasetManifest>,
    pub want_array: bool,
}

impl TaskSpec {
    fn input_filename(&self, seq: u32) -> String {
        match &self.level0_manifest {
            Some(manifest) => manifest.filename_for(seq),
            None => format!("{:06}.tif", seq - self.source_seq_begin),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.target_dir.join(format!("{:06}.tif", self.output_index))
    }

    fn first_input_path(&self) -> PathBuf {
        self.source_dir.join(self.input_filename(self.source_seq))
    }

    /// `None` when this task is the tail of an odd-count level (§4.B).
    fn second_input_path(&self) -> Option<PathBuf> {
        if self.source_seq + 1 <= self.source_seq_end {
            Some(self.source_dir.join(self.input_filename(self.source_seq + 1)))
        } else {
            None
        }
    }
}

/// Outcome of running one task. Errors are carried, not propagated, so the
/// pool can isolate a single failure without aborting the level (§7).
#[derive(Debug)]
pub struct WorkerOutcome {
    pub output_index: u64,
    pub was_generated: bool,
    pub array: Option<(u32, u32, GrayBuffer)>,
    pub error: Option<WorkerError>,
    pub elapsed: Duration,
}

fn to_gray_preserve_depth(img: DynamicImage) -> (GrayBuffer, u32, u32) {
    match img {
        DynamicImage::ImageLuma8(g) => {
            let (w, h) = g.dimensions();
            (GrayBuffer::Eight(g.into_raw()), w, h)
        }
        DynamicImage::ImageLuma16(g) => {
            let (w, h) = g.dimensions();
            (GrayBuffer::Sixteen(g.into_raw()), w, h)
        }
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
            let g = img.to_luma16();
            let (w, h) = g.dimensions();
            (GrayBuffer::Sixteen(g.into_raw()), w, h)
        }
        other => {
            let g = other.to_luma8();
            let (w, h) = g.dimensions();
            (GrayBuffer::Eight(g.into_raw()), w, h)
        }
    }
}

fn decode_slice(path: &Path) -> Result<(u32, u32, GrayBuffer), WorkerError> {
    let reader = ImageReader::open(path)
        .map_err(|e| WorkerError::Decode(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| WorkerError::Decode(path.to_path_buf(), e.to_string()))?;
    let img = reader
        .decode()
        .map_err(|e| WorkerError::Decode(path.to_path_buf(), e.to_string()))?;
    let (buf, w, h) = to_gray_preserve_depth(img);
    Ok((w, h, buf))
}

fn write_tiff(path: &Path, w: u32, h: u32, buf: &GrayBuffer) -> Result<(), WorkerError> {
    match buf {
        GrayBuffer::Eight(data) => {
            let img = ImageBuffer::<Luma<u8>, _>::from_raw(w, h, data.clone())
                .ok_or_else(|| WorkerError::Write(path.to_path_buf(), "buffer/dimension mismatch".into()))?;
            img.save(path)
                .map_err(|e| WorkerError::Write(path.to_path_buf(), e.to_string()))
        }
        GrayBuffer::Sixteen(data) => {
            let img = ImageBuffer::<Luma<u16>, _>::from_raw(w, h, data.clone())
                .ok_or_else(|| WorkerError::Write(path.to_path_buf(), "buffer/dimension mismatch".into()))?;
            img.save(path)
                .map_err(|e| WorkerError::Write(path.to_path_buf(), e.to_string()))
        }
    }
}

/// `(a + b) / 2`, truncating toward zero — no rounding (§4.B normative semantics).
fn average_u8(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.par_iter()
        .zip(b.par_iter())
        .map(|(&x, &y)| (((x as u16) + (y as u16)) / 2) as u8)
        .collect()
}

fn average_u16(a: &[u16], b: &[u16]) -> Vec<u16> {
    a.par_iter()
        .zip(b.par_iter())
        .map(|(&x, &y)| (((x as u32) + (y as u32)) / 2) as u16)
        .collect()
}

fn promote_8_to_16(buf: &[u8]) -> Vec<u16> {
    buf.par_iter().map(|&x| (x as u16) << 8).collect()
}

/// 2x2 box-filter downsample: `(p00+p01+p10+p11)/4`, truncating toward zero.
/// Output dimensions are `floor(w/2)`, `floor(h/2)` (§4.B step 6).
fn downsample_half_u8(src: &[u8], w: usize, _h: usize) -> (Vec<u8>, usize, usize) {
    let dw = w / 2;
    let dh = src.len() / w / 2;
    let mut dst = vec![0u8; dw * dh];
    dst.par_chunks_mut(dw).enumerate().for_each(|(y, row)| {
        let base0 = (2 * y) * w;
        let base1 = (2 * y + 1) * w;
        for (x, out) in row.iter_mut().enumerate() {
            let a = src[base0 + 2 * x] as u32;
            let b = src[base0 + 2 * x + 1] as u32;
            let c = src[base1 + 2 * x] as u32;
            let d = src[base1 + 2 * x + 1] as u32;
            *out = ((a + b + c + d) / 4) as u8;
        }
    });
    (dst, dw, dh)
}

fn downsample_half_u16(src: &[u16], w: usize, _h: usize) -> (Vec<u16>, usize, usize) {
    let dw = w / 2;
    let dh = src.len() / w / 2;
    let mut dst = vec![0u16; dw * dh];
    dst.par_chunks_mut(dw).enumerate().for_each(|(y, row)| {
        let base0 = (2 * y) * w;
        let base1 = (2 * y + 1) * w;
        for (x, out) in row.iter_mut().enumerate() {
            let a = src[base0 + 2 * x] as u32;
            let b = src[base0 + 2 * x + 1] as u32;
            let c = src[base1 + 2 * x] as u32;
            let d = src[base1 + 2 * x + 1] as u32;
            *out = ((a + b + c + d) / 4) as u16;
        }
    });
    (dst, dw, dh)
}

fn downsample_half(buf: &GrayBuffer, w: usize, h: usize) -> (GrayBuffer, usize, usize) {
    match buf {
        GrayBuffer::Eight(src) => {
            let (d, dw, dh) = downsample_half_u8(src, w, h);
            (GrayBuffer::Eight(d), dw, dh)
        }
        GrayBuffer::Sixteen(src) => {
            let (d, dw, dh) = downsample_half_u16(src, w, h);
            (GrayBuffer::Sixteen(d), dw, dh)
        }
    }
}

/// Average two same-dimension buffers, promoting an 8-bit input to 16-bit by
/// left-shifting 8 when paired with a 16-bit input (§4.B step 5).
fn average_pair(a: GrayBuffer, b: GrayBuffer) -> GrayBuffer {
    match (a, b) {
        (GrayBuffer::Eight(a), GrayBuffer::Eight(b)) => GrayBuffer::Eight(average_u8(&a, &b)),
        (GrayBuffer::Sixteen(a), GrayBuffer::Sixteen(b)) => GrayBuffer::Sixteen(average_u16(&a, &b)),
        (GrayBuffer::Eight(a), GrayBuffer::Sixteen(b)) => {
            GrayBuffer::Sixteen(average_u16(&promote_8_to_16(&a), &b))
        }
        (GrayBuffer::Sixteen(a), GrayBuffer::Eight(b)) => {
            GrayBuffer::Sixteen(average_u16(&a, &promote_8_to_16(&b)))
        }
    }
}

/// Run one task to completion. Never panics on a missing/corrupt source —
/// failures are carried in `WorkerOutcome::error` (§7).
pub fn run_task(spec: &TaskSpec, cancel: &AtomicBool, gc_interval: u64) -> WorkerOutcome {
    let start = Instant::now();

    if cancel.load(Ordering::Relaxed) {
        return WorkerOutcome {
            output_index: spec.output_index,
            was_generated: false,
            array: None,
            error: Some(WorkerError::Cancelled),
            elapsed: start.elapsed(),
        };
    }

    let output_path = spec.output_path();

    let result = if output_path.exists() {
        debug!(path = %output_path.display(), "reusing existing thumbnail");
        if spec.want_array {
            match decode_slice(&output_path) {
                Ok((w, h, buf)) => Ok((false, Some((w, h, buf)))),
                Err(e) => Err(e),
            }
        } else {
            Ok((false, None))
        }
    } else {
        generate(spec).map(|array| (true, array))
    };

    if spec.output_index % gc_interval == 0 {
        // Buffers are already dropped at scope exit; this just marks the cadence.
        debug!(output_index = spec.output_index, "buffer-drop checkpoint");
    }

    let elapsed = start.elapsed();
    if elapsed > Duration::from_secs(5) {
        warn!(output_index = spec.output_index, ms = elapsed.as_millis(), "slow thumbnail task");
    } else if elapsed > Duration::from_secs(3) {
        debug!(output_index = spec.output_index, ms = elapsed.as_millis(), "notable thumbnail task");
    }

    match result {
        Ok((was_generated, array)) => WorkerOutcome {
            output_index: spec.output_index,
            was_generated,
            array,
            error: None,
            elapsed,
        },
        Err(e) => WorkerOutcome {
            output_index: spec.output_index,
            was_generated: false,
            array: None,
            error: Some(e),
            elapsed,
        },
    }
}

/// Decode a source slice that is expected to exist. Either pair member may be
/// absent at generation time (§4.B, §8 scenario 5): the caller treats a
/// missing member as `None` rather than failing outright, so the task can
/// fall back to downsampling whichever member survives.
fn load_if_present(path: &Path) -> Result<Option<(u32, u32, GrayBuffer)>, WorkerError> {
    if !path.exists() {
        warn!(path = %path.display(), "expected pair member missing, downsampling lone survivor");
        return Ok(None);
    }
    decode_slice(path).map(Some)
}

fn generate(spec: &TaskSpec) -> Result<Option<(u32, u32, GrayBuffer)>, WorkerError> {
    let first_path = spec.first_input_path();
    let first = load_if_present(&first_path)?;

    let second_path = spec.second_input_path();
    let second = match second_path {
        Some(p) => load_if_present(&p)?,
        // No second member expected at all: this is the odd-count tail, not
        // a missing file, so it is never logged as one.
        None => None,
    };

    let (avg, w, h) = match (first, second) {
        (Some((w1, h1, buf1)), Some((w2, h2, buf2))) => {
            debug_assert_eq!((w1, h1), (w2, h2), "paired slices must share dimensions");
            (average_pair(buf1, buf2), w1, h1)
        }
        (Some((w1, h1, buf1)), None) => (buf1, w1, h1),
        (None, Some((w2, h2, buf2))) => (buf2, w2, h2),
        (None, None) => return Err(WorkerError::Missing(first_path)),
    };

    let (downsampled, dw, dh) = downsample_half(&avg, w as usize, h as usize);

    std::fs::create_dir_all(&spec.target_dir)
        .map_err(|e| WorkerError::Write(spec.target_dir.clone(), e.to_string()))?;
    write_tiff(&spec.output_path(), dw as u32, dh as u32, &downsampled)?;

    if spec.want_array {
        Ok(Some((dw as u32, dh as u32, downsampled)))
    } else {
        Ok(None)
    }
}
