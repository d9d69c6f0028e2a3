//! Readiness detection from container output.
//!
//! A new desktop is ready once its startup output contains the readiness
//! marker. The wait is a blocking read over the log stream bounded by a
//! deadline; nothing sleeps between reads.

use std::time::Duration;

use futures::{Stream, StreamExt};
use log::info;
use thiserror::Error;

/// Output line printed by the desktop image once its VNC server is starting.
pub const DEFAULT_READY_MARKER: &str = "Starting VNC server";

/// Default bound on the readiness wait.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a container did not become ready.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The output stream closed before the marker appeared.
    #[error("container output ended after {lines_read} lines without the readiness marker")]
    StreamEnded { lines_read: usize },

    /// Reading the output stream failed.
    #[error("reading container output after {lines_read} lines: {source}")]
    Stream {
        lines_read: usize,
        source: std::io::Error,
    },

    /// The marker did not appear before the deadline.
    #[error("readiness marker not seen within {}s ({lines_read} lines read)", .timeout.as_secs())]
    TimedOut { timeout: Duration, lines_read: usize },
}

/// The marker was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Lines consumed, including the marker line.
    pub lines_read: usize,
}

/// Read `lines` until one contains `marker`, the stream ends, or `timeout`
/// elapses. Every line is logged under `label`.
pub async fn await_ready<S>(
    lines: S,
    marker: &str,
    timeout: Duration,
    label: &str,
) -> Result<Ready, ReadinessError>
where
    S: Stream<Item = std::io::Result<String>> + Unpin,
{
    let mut lines = lines;
    let mut lines_read = 0usize;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let next = tokio::time::timeout_at(deadline, lines.next())
            .await
            .map_err(|_| ReadinessError::TimedOut {
                timeout,
                lines_read,
            })?;

        let Some(line) = next else {
            return Err(ReadinessError::StreamEnded { lines_read });
        };
        let line = line.map_err(|source| ReadinessError::Stream { lines_read, source })?;
        lines_read += 1;
        info!("[{label}] {line}");

        if line.contains(marker) {
            return Ok(Ready { lines_read });
        }
    }
}
