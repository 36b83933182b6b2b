//! An unbounded buffered pipe that spills to disk past a threshold.
//!
//! Single-producer, single-consumer. Exists because a worker can produce
//! faster than a client can consume (or vice versa); without spill-to-disk
//! the pool would either block the worker or buffer unbounded in memory.

use crate::error::ChannelError;
use std::{
    collections::VecDeque,
    io::{Seek, SeekFrom},
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Notify,
};

/// Bytes buffered in memory before the channel spills to a temp file.
pub const SPILL_THRESHOLD: usize = 128 * 1024;
/// Hard cap on in-memory buffering; beyond this is a caller bug.
pub const MAX_MEMORY_BUFFERING: usize = 32 * 1024 * 1024 - 1;
/// Chunk size used when reading the spill file back out.
const MBUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    InMemory,
    InFile,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Inactive,
    CreatingFile,
    Moving,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Inactive,
    Feeding,
    FeedingEof,
    WaitingForSinkIdle,
    ReadingFromFile,
    Terminated,
}

/// Whether the downstream sink accepted the fed bytes or is applying backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    Accepted,
    NotAcceptingNow,
}

/// An unbounded, disk-spilling buffered pipe.
///
/// The queue holds pending in-memory buffers; a zero-length buffer in the
/// queue marks end-of-stream. Truncation of the spill file is done by
/// closing and recreating it, never `ftruncate`, so in-flight I/O against
/// the old file descriptor stays harmless.
pub struct FileBufferedChannel {
    mode: Mode,
    queue: VecDeque<Vec<u8>>,
    bytes_buffered: usize,

    file: Option<tokio::fs::File>,
    writer_state: WriterState,
    reader_state: ReaderState,

    /// bytes in `file` not yet read back out; may go negative (tracked via
    /// `written_negative`) when in-memory buffers were fed past the file
    /// extent while the writer hadn't caught up.
    written: i64,
    read_offset: u64,

    sink_idle: Arc<Notify>,
    error: Option<ChannelError>,
}

impl FileBufferedChannel {
    pub fn new() -> Self {
        Self {
            mode: Mode::InMemory,
            queue: VecDeque::new(),
            bytes_buffered: 0,
            file: None,
            writer_state: WriterState::Inactive,
            reader_state: ReaderState::Inactive,
            written: 0,
            read_offset: 0,
            sink_idle: Arc::new(Notify::new()),
            error: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    /// A handle the downstream sink can use to signal "consumed, idle".
    pub fn sink_idle_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.sink_idle)
    }

    /// Pushes `buf` onto the queue. An empty `buf` marks EOF.
    ///
    /// Beyond the 32 MiB hard cap this panics in debug builds and returns
    /// [`ChannelError::CapacityExceeded`] in release, per the documented
    /// caller-bug boundary.
    pub fn feed(&mut self, buf: Vec<u8>) -> Result<(), ChannelError> {
        if self.mode == Mode::Error {
            return Err(self
                .error
                .as_ref()
                .map(|e| ChannelError::Io(std::io::Error::other(e.to_string())))
                .unwrap_or(ChannelError::Io(std::io::Error::other("channel errored"))));
        }

        let attempted = self.bytes_buffered + buf.len();
        if attempted > MAX_MEMORY_BUFFERING {
            debug_assert!(
                false,
                "feed() would push bytes_buffered to {attempted}, cap is {MAX_MEMORY_BUFFERING}"
            );
            return Err(ChannelError::CapacityExceeded {
                attempted,
                cap: MAX_MEMORY_BUFFERING,
            });
        }

        self.bytes_buffered += buf.len();
        self.queue.push_back(buf);

        if self.mode == Mode::InMemory && self.bytes_buffered >= SPILL_THRESHOLD {
            self.begin_spill();
        }

        Ok(())
    }

    fn begin_spill(&mut self) {
        self.mode = Mode::InFile;
        self.writer_state = WriterState::CreatingFile;
        tracing::debug!(bytes_buffered = self.bytes_buffered, "spilling to disk");
    }

    /// Opens the anonymous spill file. Must run off the async reactor thread
    /// in a real deployment (`tempfile::tempfile()` is a blocking syscall);
    /// callers drive this via `spawn_blocking`.
    pub(crate) fn install_spill_file(&mut self, file: std::fs::File) -> Result<(), ChannelError> {
        self.file = Some(tokio::fs::File::from_std(file));
        self.writer_state = WriterState::Moving;
        Ok(())
    }

    /// Writer-side pump: appends queued buffers to the spill file. No-op in
    /// `IN_MEMORY` mode. Lazily creates the spill file (off-thread, since
    /// `tempfile::tempfile()` is a blocking syscall) the first time it's needed.
    pub async fn pump_writer(&mut self) -> Result<(), ChannelError> {
        if self.mode != Mode::InFile || self.writer_state == WriterState::Terminated {
            return Ok(());
        }

        if self.writer_state == WriterState::CreatingFile {
            let joined = tokio::task::spawn_blocking(tempfile::tempfile).await;
            let file = match joined {
                Ok(Ok(file)) => file,
                Ok(Err(e)) => return Err(self.fail(e)),
                Err(e) => return Err(self.fail(std::io::Error::other(e))),
            };
            self.install_spill_file(file)?;
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        while let Some(buf) = self.queue.pop_front() {
            if buf.is_empty() {
                self.writer_state = WriterState::Terminated;
                break;
            }
            let offset = self.read_offset as i64 + self.written;
            file.seek(SeekFrom::Start(offset.max(0) as u64))
                .await
                .map_err(|e| self.fail(e))?;
            file.write_all(&buf).await.map_err(|e| self.fail(e))?;
            self.bytes_buffered -= buf.len();
            self.written += buf.len() as i64;
        }
        Ok(())
    }

    /// Reader-side pump: feeds bytes to `sink` until it applies backpressure
    /// or the stream ends. Returns `true` once EOF has been fed.
    pub async fn pump_reader<F>(&mut self, mut sink: F) -> Result<bool, ChannelError>
    where
        F: FnMut(&[u8]) -> SinkResult,
    {
        loop {
            match self.mode {
                Mode::Error => {
                    return Err(self
                        .error
                        .take()
                        .unwrap_or(ChannelError::Io(std::io::Error::other("channel errored"))))
                }
                Mode::InMemory => {
                    let Some(buf) = self.queue.front().cloned() else {
                        return Ok(false);
                    };
                    if buf.is_empty() {
                        self.queue.pop_front();
                        self.reader_state = ReaderState::Terminated;
                        return Ok(true);
                    }
                    match sink(&buf) {
                        SinkResult::Accepted => {
                            self.queue.pop_front();
                            self.bytes_buffered -= buf.len();
                        }
                        SinkResult::NotAcceptingNow => {
                            self.reader_state = ReaderState::WaitingForSinkIdle;
                            self.sink_idle.notified().await;
                        }
                    }
                }
                Mode::InFile => {
                    if self.written > 0 {
                        let Some(file) = self.file.as_mut() else {
                            return Ok(false);
                        };
                        let to_read = self.written.min(MBUF_SIZE as i64) as usize;
                        let mut chunk = vec![0u8; to_read];
                        file.seek(SeekFrom::Start(self.read_offset))
                            .await
                            .map_err(|e| self.fail(e))?;
                        let n = file.read(&mut chunk).await.map_err(|e| self.fail(e))?;
                        chunk.truncate(n);
                        if n == 0 {
                            return Ok(false);
                        }
                        match sink(&chunk) {
                            SinkResult::Accepted => {
                                self.read_offset += n as u64;
                                self.written -= n as i64;
                                self.maybe_return_to_memory();
                            }
                            SinkResult::NotAcceptingNow => {
                                self.reader_state = ReaderState::WaitingForSinkIdle;
                                self.sink_idle.notified().await;
                            }
                        }
                    } else if let Some(buf) = self.queue.front().cloned() {
                        if buf.is_empty() {
                            self.queue.pop_front();
                            self.reader_state = ReaderState::Terminated;
                            return Ok(true);
                        }
                        match sink(&buf) {
                            SinkResult::Accepted => {
                                self.queue.pop_front();
                                self.bytes_buffered -= buf.len();
                                // writer hasn't caught up to this buffer yet
                                self.written -= buf.len() as i64;
                            }
                            SinkResult::NotAcceptingNow => {
                                self.reader_state = ReaderState::WaitingForSinkIdle;
                                self.sink_idle.notified().await;
                            }
                        }
                    } else {
                        // The writer consumes the EOF marker itself (it never
                        // re-queues it), so once the file is fully drained
                        // this is the only place left to notice end-of-stream.
                        let writer_terminated = self.writer_state == WriterState::Terminated;
                        self.maybe_return_to_memory();
                        if writer_terminated {
                            self.reader_state = ReaderState::Terminated;
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn maybe_return_to_memory(&mut self) {
        if self.written == 0
            && self.queue.is_empty()
            && self.writer_state != WriterState::CreatingFile
        {
            self.file = None;
            self.read_offset = 0;
            self.written = 0;
            self.mode = Mode::InMemory;
            self.writer_state = WriterState::Inactive;
            tracing::debug!("spill file drained, back to in-memory mode");
        }
    }

    fn fail(&mut self, source: std::io::Error) -> ChannelError {
        self.mode = Mode::Error;
        let kind = source.kind();
        let message = source.to_string();
        self.error = Some(ChannelError::Io(std::io::Error::new(kind, message.clone())));
        ChannelError::Io(std::io::Error::new(kind, message))
    }
}

impl Default for FileBufferedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_in_memory_below_threshold() {
        let mut ch = FileBufferedChannel::new();
        ch.feed(vec![0u8; 1024]).unwrap();
        assert_eq!(ch.mode(), Mode::InMemory);
        assert_eq!(ch.bytes_buffered(), 1024);
    }

    #[tokio::test]
    async fn spills_past_threshold() {
        let mut ch = FileBufferedChannel::new();
        ch.feed(vec![0u8; SPILL_THRESHOLD]).unwrap();
        assert_eq!(ch.mode(), Mode::InFile);
    }

    #[tokio::test]
    async fn rejects_over_hard_cap() {
        let mut ch = FileBufferedChannel::new();
        let err = ch.feed(vec![0u8; MAX_MEMORY_BUFFERING + 1]);
        assert!(matches!(err, Err(ChannelError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn in_memory_round_trip() {
        let mut ch = FileBufferedChannel::new();
        ch.feed(b"hello".to_vec()).unwrap();
        ch.feed(Vec::new()).unwrap();

        let mut received = Vec::new();
        loop {
            let eof = ch
                .pump_reader(|chunk| {
                    received.extend_from_slice(chunk);
                    SinkResult::Accepted
                })
                .await
                .unwrap();
            if eof {
                break;
            }
        }
        assert_eq!(received, b"hello");
    }
}
