//! Disk capture of delivered scans.
//!
//! A capture file is a headerless stream of little-endian `f32` samples,
//! row-major across the acquired channels, in exactly the order the scans were
//! handed to the consumer.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File extension of capture files.
pub const CAPTURE_EXTENSION: &str = "dat";

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Default capture name for a run started at `at`, `YYYYMMDD-HHMMSS`.
pub fn run_name(at: DateTime<Local>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// Path of the capture file called `name` inside `directory`.
pub fn capture_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.{CAPTURE_EXTENSION}"))
}

/// Open capture file.
///
/// The handle lives exactly as long as the sink; [`CaptureSink::finish`]
/// flushes and reports the row count.
#[derive(Debug)]
pub struct CaptureSink {
    path: PathBuf,
    writer: BufWriter<File>,
    channels: usize,
    rows_written: u64,
    scratch: Vec<u8>,
}

impl CaptureSink {
    /// Create (or truncate) the capture file at `path`.
    pub fn create(path: impl Into<PathBuf>, channels: usize) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        info!(path = %path.display(), channels, "capture opened");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            channels,
            rows_written: 0,
            scratch: Vec::new(),
        })
    }

    /// Append row-major scans, narrowing each sample to `f32`.
    pub fn write_rows(&mut self, samples: &[f64]) -> AppResult<()> {
        if self.channels == 0 || samples.is_empty() {
            return Ok(());
        }
        if samples.len() % self.channels != 0 {
            return Err(DaqError::State(format!(
                "capture expects whole scans of {} samples, got {}",
                self.channels,
                samples.len()
            )));
        }
        self.scratch.clear();
        self.scratch.reserve(samples.len() * SAMPLE_BYTES);
        for &v in samples {
            self.scratch.extend_from_slice(&(v as f32).to_le_bytes());
        }
        self.writer.write_all(&self.scratch)?;
        self.rows_written += (samples.len() / self.channels) as u64;
        Ok(())
    }

    /// Flush and close the file, returning the number of scans written.
    pub fn finish(mut self) -> AppResult<u64> {
        self.writer.flush()?;
        info!(path = %self.path.display(), rows = self.rows_written, "capture closed");
        Ok(self.rows_written)
    }

    /// Location of the capture file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

/// Read a capture file back as row-major `f32` samples.
///
/// A trailing partial scan (e.g. from an interrupted run) is dropped.
pub fn read_capture(path: &Path, channels: usize) -> AppResult<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    let mut samples: Vec<f32> = bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    if channels > 0 {
        let whole = samples.len() - samples.len() % channels;
        if whole != samples.len() || bytes.len() % SAMPLE_BYTES != 0 {
            warn!(
                path = %path.display(),
                dropped_samples = samples.len() - whole,
                "capture ends with a partial scan"
            );
        }
        samples.truncate(whole);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_run_name_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(run_name(at), "20240305-140709");
        assert_eq!(
            capture_path(Path::new("/data"), "20240305-140709"),
            PathBuf::from("/data/20240305-140709.dat")
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = capture_path(dir.path(), "run");
        let mut sink = CaptureSink::create(&path, 2).unwrap();
        sink.write_rows(&[0.5, -1.25, 3.0, 4.0]).unwrap();
        sink.write_rows(&[]).unwrap();
        sink.write_rows(&[1e-3, 7.0]).unwrap();
        assert_eq!(sink.rows_written(), 3);
        assert_eq!(sink.finish().unwrap(), 3);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 6 * 4);
        assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());

        let samples = read_capture(&path, 2).unwrap();
        assert_eq!(samples, vec![0.5, -1.25, 3.0, 4.0, 1e-3f64 as f32, 7.0]);
    }

    #[test]
    fn test_partial_scan_rejected_and_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("odd.dat");
        let mut sink = CaptureSink::create(&path, 3).unwrap();
        assert!(matches!(
            sink.write_rows(&[1.0, 2.0]),
            Err(DaqError::State(_))
        ));
        sink.write_rows(&[1.0, 2.0, 3.0]).unwrap();
        sink.finish().unwrap();

        // a reader assuming two channels sees one whole scan
        assert_eq!(read_capture(&path, 2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_capture_is_io_error() {
        let dir = tempdir().unwrap();
        let err = read_capture(&dir.path().join("absent.dat"), 1).unwrap_err();
        assert!(matches!(err, DaqError::Io(_)));
    }
}
