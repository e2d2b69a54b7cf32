//! Capture file sink
//!
//! Sequential append of raw 16-bit PCM, in capture order, with begin markers
//! already interleaved by the driver. The file is opened once per session and
//! flushed when the session ends.
//!
//! Write failures are best-effort by default: the bytes are dropped and
//! counted, and capture keeps going. In strict mode the first failure is
//! returned to the caller.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Write buffer in front of the capture file
const SINK_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to create output file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write capture data: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to flush capture data: {0}")]
    Flush(#[source] std::io::Error),
}

/// Byte accounting for a sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub bytes_written: u64,
    pub bytes_dropped: u64,
    pub write_errors: u64,
}

/// Append-only capture writer
pub struct CaptureSink<W: Write = BufWriter<File>> {
    writer: W,
    strict: bool,
    stats: SinkStats,
}

impl CaptureSink<BufWriter<File>> {
    /// Create (truncate) the output file
    pub fn create(path: &Path, strict: bool) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), strict, "Opened capture file");
        Ok(Self::from_writer(
            BufWriter::with_capacity(SINK_BUFFER_BYTES, file),
            strict,
        ))
    }
}

impl<W: Write> CaptureSink<W> {
    pub fn from_writer(writer: W, strict: bool) -> Self {
        Self {
            writer,
            strict,
            stats: SinkStats::default(),
        }
    }

    /// Append bytes
    ///
    /// Empty slices are a no-op. In best-effort mode errors are logged and
    /// the bytes counted as dropped.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.writer.write_all(bytes) {
            Ok(()) => {
                self.stats.bytes_written += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.write_errors += 1;
                self.stats.bytes_dropped += bytes.len() as u64;
                if self.strict {
                    return Err(SinkError::Write(e));
                }
                // First failure is loud, repeats would flood the log
                if self.stats.write_errors == 1 {
                    tracing::error!(error = %e, len = bytes.len(), "Capture write failed, dropping bytes");
                } else {
                    tracing::debug!(error = %e, len = bytes.len(), "Capture write failed");
                }
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Flush and hand back the final accounting
    pub fn finish(mut self) -> Result<SinkStats, SinkError> {
        self.writer.flush().map_err(SinkError::Flush)?;
        Ok(self.stats)
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Writer that fails every call
    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_appends_in_order() {
        let mut sink = CaptureSink::from_writer(Vec::new(), false);
        sink.write(&[1, 2]).unwrap();
        sink.write(&[]).unwrap();
        sink.write(&[3, 4, 5, 6]).unwrap();
        assert_eq!(sink.get_ref(), &vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sink.stats().bytes_written, 6);
    }

    #[test]
    fn test_best_effort_drops_bytes() {
        let mut sink = CaptureSink::from_writer(BrokenWriter, false);
        assert!(sink.write(&[0; 8]).is_ok());
        assert!(sink.write(&[0; 4]).is_ok());
        let stats = sink.finish().unwrap();
        assert_eq!(stats.bytes_dropped, 12);
        assert_eq!(stats.write_errors, 2);
        assert_eq!(stats.bytes_written, 0);
    }

    #[test]
    fn test_strict_mode_fails() {
        let mut sink = CaptureSink::from_writer(BrokenWriter, true);
        assert!(matches!(sink.write(&[0; 2]), Err(SinkError::Write(_))));
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.raw");
        let mut sink = CaptureSink::create(&path, false).unwrap();
        sink.write(&[7, 8]).unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_create_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("capture.raw");
        assert!(matches!(
            CaptureSink::create(&path, false),
            Err(SinkError::Open { .. })
        ));
    }
}
