// src/runtime/output.rs
//! Bounded stdout/stderr capture
//!
//! Each stream is drained until EOF so a chatty child never blocks on a
//! full pipe. Bytes up to the cap are kept and streamed to the event bus;
//! anything past the cap is discarded and flags the capture as truncated.

use crate::events::{EventPublisher, StreamKind};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8 * 1024;

/// Result of draining one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,

    /// Everything the child wrote, kept or not
    pub total_bytes: u64,
}

/// Drain `reader`, keeping at most `limit` bytes.
///
/// `overflow` is cancelled the first time the cap is exceeded. Cancelling
/// `stop` ends the capture early with whatever was read so far.
pub async fn capture_stream<R>(
    mut reader: R,
    stream: StreamKind,
    limit: usize,
    events: EventPublisher,
    overflow: CancellationToken,
    stop: CancellationToken,
) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedStream::default();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break,
            result = reader.read(&mut chunk) => match result {
                Ok(0) => break,
                Ok(n) => n,
                // A broken pipe after kill is the normal end of the stream.
                Err(_) => break,
            },
        };
        captured.total_bytes += read as u64;

        let room = limit.saturating_sub(captured.bytes.len());
        let keep = read.min(room);
        if keep > 0 {
            captured.bytes.extend_from_slice(&chunk[..keep]);
            events.output(stream, &chunk[..keep]);
        }
        if keep < read && !captured.truncated {
            captured.truncated = true;
            overflow.cancel();
        }
    }

    captured
}
