//! Extract phase: resolve a source path to raw frames.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::capture::{is_capture_file, read_capture_file, RawFrame};
use crate::etl::EtlError;

/// Frames read from every capture file of a source
#[derive(Debug, Default)]
pub struct Extracted {
    pub files: Vec<PathBuf>,
    pub frames: Vec<RawFrame>,
}

/// Capture files named by `source`: the file itself, or every capture file
/// directly inside the directory, in file-name order.
pub fn capture_files(source: &Path) -> Result<Vec<PathBuf>, EtlError> {
    if source.is_file() {
        if !is_capture_file(source) {
            return Err(EtlError::UnsupportedFormat(source.to_path_buf()));
        }
        return Ok(vec![source.to_path_buf()]);
    }

    if source.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(source)? {
            let path = entry?.path();
            if path.is_file() && is_capture_file(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(EtlError::NoCaptureFiles(source.to_path_buf()));
        }
        files.sort();
        return Ok(files);
    }

    Err(EtlError::SourceNotFound(source.to_path_buf()))
}

/// Read every frame of `source`. Any unreadable file aborts the extraction.
pub fn extract(source: &Path) -> Result<Extracted, EtlError> {
    let files = capture_files(source)?;
    let mut frames = Vec::new();

    for file in &files {
        let file_frames = read_capture_file(file)?;
        info!("[EXTRACT] {} frames from {}", file_frames.len(), file.display());
        frames.extend(file_frames);
    }

    info!("[EXTRACT] {} frames from {} files", frames.len(), files.len());
    Ok(Extracted { files, frames })
}
