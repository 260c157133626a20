//! Chunked byte streaming with progress, cancellation and partial-file
//! cleanup. Shared by download, upload and the copy fallback.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProgressFn;
use crate::logging::LogThrottle;

/// Buffer size for a single read/write round.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Why a stream copy stopped early.
#[derive(Debug)]
pub enum StreamFailure {
    Cancelled,
    /// Reading the source failed.
    Source(io::Error),
    /// Writing the sink failed.
    Sink(io::Error),
}

impl std::fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "transfer cancelled"),
            Self::Source(e) => write!(f, "read failed: {}", e),
            Self::Sink(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Copy `reader` into `writer` chunk by chunk, invoking `on_progress` with the
/// cumulative byte count after every chunk. Cancellation is checked between
/// chunks.
pub fn copy_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    on_progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> Result<u64, StreamFailure> {
    let throttle = LogThrottle::new(std::time::Duration::from_secs(2));
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StreamFailure::Cancelled);
        }

        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamFailure::Source(e)),
        };

        writer
            .write_all(&buffer[..n])
            .map_err(StreamFailure::Sink)?;
        copied += n as u64;

        if let Some(cb) = on_progress {
            cb(copied, total);
        }
        if throttle.should_log() {
            debug!(bytes = copied, total = ?total, "Transfer progress");
        }
    }

    writer.flush().map_err(StreamFailure::Sink)?;
    Ok(copied)
}

/// Stream `reader` into a new file at `local_path`. On cancellation or any
/// failure the partially written file is removed.
pub fn copy_to_file<R: Read>(
    reader: &mut R,
    local_path: &Path,
    total: Option<u64>,
    on_progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> Result<u64, StreamFailure> {
    let file = File::create(local_path).map_err(StreamFailure::Sink)?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);

    let result = copy_stream(reader, &mut writer, total, on_progress, cancel).and_then(|n| {
        let file = writer
            .into_inner()
            .map_err(|e| StreamFailure::Sink(io::Error::other(e.to_string())))?;
        file.sync_all().map_err(StreamFailure::Sink)?;
        Ok(n)
    });

    if result.is_err() {
        remove_partial(local_path);
    }
    result
}

pub(crate) fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

/// Progress for the first half of a two-leg transfer (download leg).
///
/// Both legs report against a doubled denominator so observers see one
/// continuous 0..100% progression.
pub fn first_half(cb: ProgressFn) -> ProgressFn {
    Arc::new(move |bytes, total| cb(bytes, total.map(|t| t.saturating_mul(2))))
}

/// Progress for the second half (upload leg); `first_leg_bytes` is what the
/// download leg moved.
pub fn second_half(cb: ProgressFn, first_leg_bytes: u64) -> ProgressFn {
    Arc::new(move |bytes, total| {
        let leg_total = total.unwrap_or(first_leg_bytes);
        cb(
            first_leg_bytes.saturating_add(bytes),
            Some(first_leg_bytes.saturating_add(leg_total)),
        )
    })
}

/// Integer percentage helper shared by reporters.
pub fn percent(bytes: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(0) => Some(100),
        Some(t) => Some(((bytes.min(t) as f64 / t as f64) * 100.0) as u8),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Reader that cancels the token after handing out `cancel_after` bytes.
    struct CancellingReader {
        inner: Cursor<Vec<u8>>,
        served: usize,
        cancel_after: usize,
        token: CancellationToken,
    }

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let limit = buf.len().min(1024);
            let n = self.inner.read(&mut buf[..limit])?;
            self.served += n;
            if self.served >= self.cancel_after {
                self.token.cancel();
            }
            Ok(n)
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn copies_and_reports_cumulative_progress() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: ProgressFn = Arc::new(move |b, t| seen_cb.lock().unwrap().push((b, t)));

        let mut out = Vec::new();
        let copied = copy_stream(
            &mut Cursor::new(data.clone()),
            &mut out,
            Some(data.len() as u64),
            Some(&cb),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen.last().unwrap().0, data.len() as u64);
    }

    #[test]
    fn cancelled_download_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.db");
        let token = CancellationToken::new();
        let mut reader = CancellingReader {
            inner: Cursor::new(vec![1u8; 100_000]),
            served: 0,
            cancel_after: 4096,
            token: token.clone(),
        };

        let result = copy_to_file(&mut reader, &target, Some(100_000), None, &token);

        assert!(matches!(result, Err(StreamFailure::Cancelled)));
        assert!(!target.exists());
    }

    #[test]
    fn failed_read_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.db");

        let result = copy_to_file(
            &mut FailingReader,
            &target,
            None,
            None,
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(StreamFailure::Source(_))));
        assert!(!target.exists());
    }

    #[test]
    fn completed_download_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.db");
        let copied = copy_to_file(
            &mut Cursor::new(b"SQLite format 3\0".to_vec()),
            &target,
            Some(16),
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(copied, 16);
        assert_eq!(fs::read(&target).unwrap(), b"SQLite format 3\0");
    }

    #[test]
    fn two_halves_form_one_monotonic_progression() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: ProgressFn = Arc::new(move |b, t| {
            seen_cb.lock().unwrap().push(percent(b, t).unwrap());
        });

        let down = first_half(cb.clone());
        for b in [250u64, 500, 1000] {
            down(b, Some(1000));
        }
        let up = second_half(cb, 1000);
        for b in [100u64, 600, 1000] {
            up(b, Some(1000));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![12, 25, 50, 55, 80, 100]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn percent_handles_unknown_and_empty_totals() {
        assert_eq!(percent(10, None), None);
        assert_eq!(percent(0, Some(0)), Some(100));
        assert_eq!(percent(50, Some(200)), Some(25));
    }
}
