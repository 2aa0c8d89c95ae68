/// Byte sources feeding the relay
///
/// A [`ByteSource`] is a point-to-point byte channel that can be opened, read
/// and reopened after the producer goes away. [`FifoSource`] reads a named
/// pipe; [`MemorySource`] is an in-process channel driven by a
/// [`MemoryProducer`].

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a pending FIFO open is poked while the source is being closed
const RELEASE_ATTEMPTS: usize = 50;
const RELEASE_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source is not open")]
    NotOpen,

    #[error("Failed to create transport {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("{0} exists but is not a named pipe")]
    NotAFifo(PathBuf),

    #[error("Failed to open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Background open failed: {0}")]
    Task(String),
}

/// Connection state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Closed,
    Open,
}

/// External byte channel the engine relays from
#[async_trait]
pub trait ByteSource: Send {
    /// Create the transport if needed; called once before the engine starts
    fn prepare(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Open the transport, waiting for a producer if the transport requires one
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Read into `buf`; `Ok(0)` means the producer hung up
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;

    fn close(&mut self);

    fn state(&self) -> SourceState;

    /// Close and open again after a stall
    async fn reopen(&mut self) -> Result<(), SourceError> {
        self.close();
        self.open().await
    }

    /// Human readable identity for logs
    fn describe(&self) -> String;
}

/// Named pipe source
///
/// Opening blocks until a producer opens the pipe for writing. The blocking
/// open runs on the blocking pool and is released on `close`, so a detector
/// can shut down while nobody is producing.
pub struct FifoSource {
    path: PathBuf,
    receiver: Option<pipe::Receiver>,
    pending_open: Option<JoinHandle<io::Result<File>>>,
}

impl FifoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            receiver: None,
            pending_open: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unblock a reader stuck in `open(2)` by briefly connecting as a writer
    fn release_pending_open(&self, handle: JoinHandle<io::Result<File>>) {
        for _ in 0..RELEASE_ATTEMPTS {
            if handle.is_finished() {
                break;
            }

            // ENXIO until the blocked reader is registered on the pipe
            let _ = OpenOptions::new()
                .write(true)
                .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
                .open(&self.path);

            std::thread::sleep(RELEASE_INTERVAL);
        }

        if !handle.is_finished() {
            warn!("Pending open of {} did not release", self.path.display());
        }
        handle.abort();
    }
}

#[async_trait]
impl ByteSource for FifoSource {
    fn prepare(&mut self) -> Result<(), SourceError> {
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;

        match mkfifo(&self.path, mode) {
            Ok(()) => {
                info!("Created named pipe {}", self.path.display());
                Ok(())
            }
            Err(Errno::EEXIST) => {
                let is_fifo = std::fs::metadata(&self.path)
                    .map(|m| m.file_type().is_fifo())
                    .unwrap_or(false);

                if !is_fifo {
                    return Err(SourceError::NotAFifo(self.path.clone()));
                }

                debug!("Named pipe {} already exists", self.path.display());
                Ok(())
            }
            Err(source) => Err(SourceError::Create {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        if self.receiver.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let handle = self
            .pending_open
            .get_or_insert_with(|| tokio::task::spawn_blocking(move || File::open(path)));

        // Survives cancellation: a dropped future leaves the handle for the next open or close
        let joined = handle.await;
        self.pending_open = None;

        let file = joined
            .map_err(|e| SourceError::Task(e.to_string()))?
            .map_err(|source| SourceError::Open {
                target: self.describe(),
                source,
            })?;

        let receiver = pipe::Receiver::from_file(file).map_err(|source| SourceError::Open {
            target: self.describe(),
            source,
        })?;

        self.receiver = Some(receiver);
        info!("Opened named pipe {} for reading", self.path.display());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let receiver = self.receiver.as_mut().ok_or(SourceError::NotOpen)?;
        let n = receiver.read(buf).await.map_err(SourceError::Read)?;

        if n == 0 {
            self.receiver = None;
        }
        Ok(n)
    }

    fn close(&mut self) {
        if self.receiver.take().is_some() {
            debug!("Closed named pipe {}", self.path.display());
        }

        if let Some(handle) = self.pending_open.take() {
            self.release_pending_open(handle);
        }
    }

    fn state(&self) -> SourceState {
        if self.receiver.is_some() {
            SourceState::Open
        } else {
            SourceState::Closed
        }
    }

    fn describe(&self) -> String {
        format!("fifo:{}", self.path.display())
    }
}

impl Drop for FifoSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
enum Feed {
    Data(Vec<u8>),
    HangUp,
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
struct MemoryCounters {
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
}

/// In-process byte source
///
/// Reads block until the paired [`MemoryProducer`] feeds data. Once every
/// producer is dropped, reads block forever.
pub struct MemorySource {
    feed: mpsc::UnboundedReceiver<Feed>,
    pending: VecDeque<u8>,
    state: SourceState,
    counters: Arc<MemoryCounters>,
}

/// Feeding half of a [`MemorySource`]
#[derive(Debug, Clone)]
pub struct MemoryProducer {
    feed: mpsc::UnboundedSender<Feed>,
    counters: Arc<MemoryCounters>,
}

impl MemorySource {
    /// Create a connected source/producer pair
    pub fn channel() -> (MemorySource, MemoryProducer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(MemoryCounters::default());

        let source = MemorySource {
            feed: rx,
            pending: VecDeque::new(),
            state: SourceState::Closed,
            counters: Arc::clone(&counters),
        };
        let producer = MemoryProducer { feed: tx, counters };

        (source, producer)
    }
}

impl MemoryProducer {
    /// Queue bytes for the source; returns false if the source is gone
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.feed.send(Feed::Data(bytes.into())).is_ok()
    }

    /// Queue an end-of-stream, as if the producer disconnected
    pub fn hang_up(&self) -> bool {
        self.feed.send(Feed::HangUp).is_ok()
    }

    /// Queue a read error
    pub fn fail_read(&self, kind: io::ErrorKind) -> bool {
        self.feed.send(Feed::Fail(kind)).is_ok()
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.counters.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Number of successful opens so far
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn open(&mut self) -> Result<(), SourceError> {
        let failing = self.counters.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.counters.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(SourceError::Open {
                target: self.describe(),
                source: io::Error::new(io::ErrorKind::NotFound, "injected open failure"),
            });
        }

        self.state = SourceState::Open;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if self.state == SourceState::Closed {
            return Err(SourceError::NotOpen);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending.is_empty() {
            match self.feed.recv().await {
                Some(Feed::Data(bytes)) => self.pending.extend(bytes),
                Some(Feed::HangUp) => {
                    self.state = SourceState::Closed;
                    return Ok(0);
                }
                Some(Feed::Fail(kind)) => {
                    return Err(SourceError::Read(io::Error::new(kind, "injected read failure")));
                }
                None => std::future::pending::<()>().await,
            }
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.state = SourceState::Closed;
        self.pending.clear();
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_source_reads_in_order() {
        let (mut source, producer) = MemorySource::channel();
        source.open().await.unwrap();

        producer.send(vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(source.read(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);

        assert_eq!(source.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[tokio::test]
    async fn test_memory_source_hang_up_closes() {
        let (mut source, producer) = MemorySource::channel();
        source.open().await.unwrap();
        producer.hang_up();

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).await.unwrap(), 0);
        assert_eq!(source.state(), SourceState::Closed);
        assert!(matches!(source.read(&mut buf).await, Err(SourceError::NotOpen)));

        source.reopen().await.unwrap();
        assert_eq!(source.state(), SourceState::Open);
        assert_eq!(producer.opens(), 2);
    }

    #[tokio::test]
    async fn test_memory_source_injected_failures() {
        let (mut source, producer) = MemorySource::channel();
        producer.fail_next_opens(1);

        assert!(matches!(source.open().await, Err(SourceError::Open { .. })));
        source.open().await.unwrap();

        producer.fail_read(io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 8];
        match source.read(&mut buf).await {
            Err(SourceError::Read(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected read failure, got {:?}", other),
        }
        assert_eq!(source.state(), SourceState::Open);
    }

    #[tokio::test]
    async fn test_memory_source_blocks_without_producer() {
        let (mut source, producer) = MemorySource::channel();
        source.open().await.unwrap();
        drop(producer);

        let mut buf = [0u8; 8];
        let result = tokio::time::timeout(Duration::from_millis(50), source.read(&mut buf)).await;
        assert!(result.is_err(), "read should still be pending");
    }

    #[test]
    fn test_prepare_creates_fifo_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.fifo");

        let mut source = FifoSource::new(&path);
        source.prepare().unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        // Second create reports "already exists" and is not an error
        let mut again = FifoSource::new(&path);
        again.prepare().unwrap();
    }

    #[test]
    fn test_prepare_rejects_regular_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pipe").unwrap();

        let mut source = FifoSource::new(file.path());
        assert!(matches!(source.prepare(), Err(SourceError::NotAFifo(_))));
    }

    #[tokio::test]
    async fn test_fifo_relays_until_writer_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.fifo");

        let mut source = FifoSource::new(&path);
        source.prepare().unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            let mut fifo = OpenOptions::new().write(true).open(writer_path).unwrap();
            fifo.write_all(&[9u8; 16]).unwrap();
        });

        source.open().await.unwrap();
        assert_eq!(source.state(), SourceState::Open);

        let mut total = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = source.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        writer.join().unwrap();
        assert_eq!(total, 16);
        assert_eq!(source.state(), SourceState::Closed);
    }

    #[tokio::test]
    async fn test_fifo_close_releases_pending_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idle.fifo");

        let mut source = FifoSource::new(&path);
        source.prepare().unwrap();

        // Nobody writes, so the open stays pending until the timeout drops it
        let attempt = tokio::time::timeout(Duration::from_millis(50), source.open()).await;
        assert!(attempt.is_err());

        source.close();
        assert_eq!(source.state(), SourceState::Closed);
    }
}
