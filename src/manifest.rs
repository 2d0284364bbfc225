//! Component A: slice inventory. Parses the reconstruction log (an INI-like
//! file written by the CT reconstruction software) and enumerates the
//! source slice files it describes.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ManifestError;

/// Bit depth of a decoded grayscale slice (§3: 8 or 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    pub fn bits(self) -> u32 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }
}

/// Dataset manifest parsed from the reconstruction log (§3, immutable after load).
#[derive(Debug, Clone)]
pub struct DatasetManifest {
    pub prefix: String,
    pub index_length: usize,
    pub file_type: String,
    pub seq_begin: u32,
    pub seq_end: u32,
    pub image_width: u32,
    pub image_height: u32,
}

impl DatasetManifest {
    /// Filename for a level-0 slice at the given sequence number (§4.B).
    pub fn filename_for(&self, seq: u32) -> String {
        format!(
            "{}{:0width$}.{}",
            self.prefix,
            seq,
            self.file_type,
            width = self.index_length
        )
    }

    pub fn slice_count(&self) -> u32 {
        self.seq_end - self.seq_begin + 1
    }
}

/// One source slice file (§3, immutable, one per source file).
#[derive(Debug, Clone)]
pub struct SliceDescriptor {
    pub sequence_number: u32,
    pub path: PathBuf,
    pub bit_depth: BitDepth,
    pub width: u32,
    pub height: u32,
}

const RECOGNISED_EXTENSIONS: &[&str] = &["tif", "tiff", "bmp", "jpg", "jpeg", "png"];

fn find_log_file(dir: &Path) -> Result<PathBuf, ManifestError> {
    let mut candidates: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .filter(|p| p.extension().map(|e| e.eq_ignore_ascii_case("log")).unwrap_or(false))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ManifestError::MissingLog(dir.to_path_buf()))
}

fn get_key<'a>(
    conf: &'a ini::Ini,
    log_path: &Path,
    section: &str,
    key: &'static str,
) -> Result<&'a str, ManifestError> {
    conf.get_from(Some(section), key)
        .ok_or_else(|| ManifestError::MissingKey(log_path.to_path_buf(), key))
}

fn get_int(log_path: &Path, key: &'static str, raw: &str) -> Result<i64, ManifestError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ManifestError::InvalidInteger(log_path.to_path_buf(), key, raw.to_string()))
}

/// Parse the reconstruction log in `dir` into a `DatasetManifest`.
///
/// Recognised keys live in two INI sections: `[File name convention]`
/// (`Filename Prefix`, `Filename Index Length`) and `[Reconstruction]`
/// (`Result File Type`, `Result Image Width (pixels)`,
/// `Result Image Height (pixels)`, `First Section`, `Last Section`) — see §6.
pub fn parse_manifest(dir: &Path) -> Result<DatasetManifest, ManifestError> {
    let log_path = find_log_file(dir)?;
    info!(log = %log_path.display(), "parsing reconstruction log");

    let conf = ini::Ini::load_from_file(&log_path)
        .map_err(|e| ManifestError::Unreadable(log_path.clone(), std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;

    let prefix = get_key(&conf, &log_path, "File name convention", "Filename Prefix")?.to_string();
    let index_length_raw = get_key(&conf, &log_path, "File name convention", "Filename Index Length")?;
    let index_length = get_int(&log_path, "Filename Index Length", index_length_raw)? as usize;

    let file_type = get_key(&conf, &log_path, "Reconstruction", "Result File Type")?
        .trim()
        .trim_start_matches('.')
        .to_lowercase();
    let width_raw = get_key(&conf, &log_path, "Reconstruction", "Result Image Width (pixels)")?;
    let height_raw = get_key(&conf, &log_path, "Reconstruction", "Result Image Height (pixels)")?;
    let seq_begin_raw = get_key(&conf, &log_path, "Reconstruction", "First Section")?;
    let seq_end_raw = get_key(&conf, &log_path, "Reconstruction", "Last Section")?;

    let image_width = get_int(&log_path, "Result Image Width (pixels)", width_raw)? as u32;
    let image_height = get_int(&log_path, "Result Image Height (pixels)", height_raw)? as u32;
    let seq_begin = get_int(&log_path, "First Section", seq_begin_raw)?;
    let seq_end = get_int(&log_path, "Last Section", seq_end_raw)?;

    if seq_end < seq_begin {
        return Err(ManifestError::InvalidRange(log_path, seq_begin, seq_end));
    }

    Ok(DatasetManifest {
        prefix,
        index_length,
        file_type,
        seq_begin: seq_begin as u32,
        seq_end: seq_end as u32,
        image_width,
        image_height,
    })
}

/// Probe the first referenced slice to determine its bit depth (§4.A).
pub fn probe_bit_depth(manifest: &DatasetManifest, dir: &Path) -> Result<BitDepth, ManifestError> {
    let first_path = dir.join(manifest.filename_for(manifest.seq_begin));
    let img = image::ImageReader::open(&first_path)
        .map_err(|e| ManifestError::FirstImageUnreadable(first_path.clone(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| ManifestError::FirstImageUnreadable(first_path.clone(), e.to_string()))?
        .decode()
        .map_err(|e| ManifestError::FirstImageUnreadable(first_path.clone(), e.to_string()))?;

    let bit_depth = match img {
        image::DynamicImage::ImageLuma16(_)
        | image::DynamicImage::ImageRgb16(_)
        | image::DynamicImage::ImageRgba16(_)
        | image::DynamicImage::ImageRgb32F(_)
        | image::DynamicImage::ImageRgba32F(_) => BitDepth::Sixteen,
        _ => BitDepth::Eight,
    };
    debug!(?bit_depth, path = %first_path.display(), "probed first slice bit depth");
    Ok(bit_depth)
}

/// Enumerate the slices named by the manifest, tolerating missing files
/// (§4.E / §8 scenario 5: a missing file is not fatal at inventory time).
pub fn enumerate_slices(
    manifest: &DatasetManifest,
    dir: &Path,
    bit_depth: BitDepth,
) -> Vec<SliceDescriptor> {
    let mut slices = Vec::with_capacity(manifest.slice_count() as usize);
    for seq in manifest.seq_begin..=manifest.seq_end {
        let path = dir.join(manifest.filename_for(seq));
        if path.exists() {
            slices.push(SliceDescriptor {
                sequence_number: seq,
                path,
                bit_depth,
                width: manifest.image_width,
                height: manifest.image_height,
            });
        }
    }
    slices
}

pub fn is_recognised_image_extension(ext: &str) -> bool {
    RECOGNISED_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}
