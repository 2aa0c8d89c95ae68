/// Shared audio stream module
///
/// Defines the writer/reader contract the relay uses and an in-memory
/// multi-reader ring implementation. Samples are addressed by absolute index
/// so every reader keeps its own cursor while a single writer appends.

use cache_padded::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Bytes per relayed sample
pub const SAMPLE_WORD_SIZE: usize = std::mem::size_of::<AudioSample>();

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("A writer is already attached to this stream")]
    WriterExists,

    #[error("Requested {requested} samples but only {available} whole samples were supplied")]
    InvalidLength { requested: usize, available: usize },

    #[error("Reader overrun: index {requested} is older than the oldest retained sample {oldest}")]
    Overrun { requested: u64, oldest: u64 },

    #[error("Index {requested} is ahead of the write cursor {cursor}")]
    AheadOfWriter { requested: u64, cursor: u64 },

    #[error("Timed out waiting for audio")]
    Timeout,

    #[error("Handle is closed")]
    Closed,

    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),
}

/// How a reader waits for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPolicy {
    /// Wait up to the supplied timeout for new samples
    Blocking,

    /// Return immediately with whatever is available
    NonBlocking,
}

/// How a writer treats slow readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPolicy {
    /// Never wait for readers; the oldest samples are overwritten
    NonBlockable,
}

/// Writer half of a shared stream
pub trait StreamWriter: Send {
    /// Write `sample_count` samples taken from the front of `bytes`.
    ///
    /// Returns the number of samples written.
    fn write(&mut self, bytes: &[u8], sample_count: usize) -> Result<usize, StreamError>;

    /// Absolute index of the next sample to be written
    fn tell(&self) -> u64;

    /// Detach the writer
    fn close(&mut self);
}

/// Reader half of a shared stream
pub trait StreamReader: Send {
    /// Read up to `out.len()` samples, waiting at most `timeout` when blocking
    fn read(&mut self, out: &mut [AudioSample], timeout: Duration) -> Result<usize, StreamError>;

    /// Absolute index of the next sample this reader returns
    fn tell(&self) -> u64;

    /// Move the reader to an absolute index still held by the stream
    fn seek_to(&mut self, index: u64) -> Result<(), StreamError>;

    fn close(&mut self);
}

/// A stream that hands out one writer and any number of readers
pub trait AudioStream: Send + Sync + fmt::Debug {
    fn create_reader(&self, policy: ReaderPolicy) -> Result<Box<dyn StreamReader>, StreamError>;

    fn create_writer(&self, policy: WriterPolicy) -> Result<Box<dyn StreamWriter>, StreamError>;
}

struct BufferInner {
    samples: Mutex<Vec<AudioSample>>,
    capacity: usize,
    write_cursor: CachePadded<AtomicU64>,
    writer_attached: AtomicBool,
    data_ready: Condvar,
}

impl BufferInner {
    fn cursor(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    fn oldest(&self, cursor: u64) -> u64 {
        cursor.saturating_sub(self.capacity as u64)
    }
}

/// In-memory shared audio buffer
///
/// Cheap to clone; clones refer to the same storage.
#[derive(Clone)]
pub struct SharedAudioBuffer {
    inner: Arc<BufferInner>,
}

impl SharedAudioBuffer {
    /// Create a buffer holding `capacity` samples
    pub fn with_capacity(capacity: usize) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::InvalidCapacity(capacity));
        }

        debug!("Creating shared audio buffer with capacity: {} samples", capacity);

        Ok(Self {
            inner: Arc::new(BufferInner {
                samples: Mutex::new(vec![0; capacity]),
                capacity,
                write_cursor: CachePadded::new(AtomicU64::new(0)),
                writer_attached: AtomicBool::new(false),
                data_ready: Condvar::new(),
            }),
        })
    }

    /// Get buffer capacity in samples
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Absolute index of the next sample to be written
    pub fn tell(&self) -> u64 {
        self.inner.cursor()
    }

    /// Absolute index of the oldest sample still retained
    pub fn oldest_index(&self) -> u64 {
        self.inner.oldest(self.inner.cursor())
    }

    /// Whether a writer is currently attached
    pub fn has_writer(&self) -> bool {
        self.inner.writer_attached.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SharedAudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAudioBuffer")
            .field("capacity", &self.inner.capacity)
            .field("write_cursor", &self.inner.cursor())
            .field("writer_attached", &self.has_writer())
            .finish()
    }
}

impl AudioStream for SharedAudioBuffer {
    fn create_reader(&self, policy: ReaderPolicy) -> Result<Box<dyn StreamReader>, StreamError> {
        let position = self.inner.cursor();
        debug!(?policy, position, "Creating stream reader");

        Ok(Box::new(BufferReader {
            inner: Arc::clone(&self.inner),
            policy,
            position,
            closed: false,
        }))
    }

    fn create_writer(&self, policy: WriterPolicy) -> Result<Box<dyn StreamWriter>, StreamError> {
        if self
            .inner
            .writer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejecting second writer on shared audio buffer");
            return Err(StreamError::WriterExists);
        }

        debug!(?policy, "Creating stream writer");

        Ok(Box::new(BufferWriter {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct BufferWriter {
    inner: Arc<BufferInner>,
    closed: bool,
}

impl StreamWriter for BufferWriter {
    fn write(&mut self, bytes: &[u8], sample_count: usize) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        let available = bytes.len() / SAMPLE_WORD_SIZE;
        if sample_count > available {
            return Err(StreamError::InvalidLength {
                requested: sample_count,
                available,
            });
        }

        if sample_count == 0 {
            return Ok(0);
        }

        let mut samples = self.inner.samples.lock();
        let start = self.inner.cursor();
        let capacity = self.inner.capacity as u64;

        for (offset, word) in bytes
            .chunks_exact(SAMPLE_WORD_SIZE)
            .take(sample_count)
            .enumerate()
        {
            let slot = ((start + offset as u64) % capacity) as usize;
            samples[slot] = AudioSample::from_ne_bytes([word[0], word[1]]);
        }

        // Publish while holding the lock so readers never see a cursor ahead of the data
        self.inner
            .write_cursor
            .store(start + sample_count as u64, Ordering::Release);
        drop(samples);

        self.inner.data_ready.notify_all();
        trace!("Wrote {} samples at index {}", sample_count, start);

        Ok(sample_count)
    }

    fn tell(&self) -> u64 {
        self.inner.cursor()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.writer_attached.store(false, Ordering::Release);
            self.inner.data_ready.notify_all();
            debug!("Stream writer closed at index {}", self.inner.cursor());
        }
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.close();
    }
}

struct BufferReader {
    inner: Arc<BufferInner>,
    policy: ReaderPolicy,
    position: u64,
    closed: bool,
}

impl StreamReader for BufferReader {
    fn read(&mut self, out: &mut [AudioSample], timeout: Duration) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }

        if out.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let mut samples = self.inner.samples.lock();

        loop {
            let cursor = self.inner.cursor();
            let oldest = self.inner.oldest(cursor);

            if self.position < oldest {
                return Err(StreamError::Overrun {
                    requested: self.position,
                    oldest,
                });
            }

            let available = (cursor - self.position) as usize;
            if available > 0 {
                let to_read = available.min(out.len());
                let capacity = self.inner.capacity as u64;

                for (i, slot) in out.iter_mut().take(to_read).enumerate() {
                    *slot = samples[((self.position + i as u64) % capacity) as usize];
                }

                self.position += to_read as u64;
                return Ok(to_read);
            }

            if self.policy == ReaderPolicy::NonBlocking {
                return Ok(0);
            }

            if self
                .inner
                .data_ready
                .wait_until(&mut samples, deadline)
                .timed_out()
            {
                return Err(StreamError::Timeout);
            }
        }
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek_to(&mut self, index: u64) -> Result<(), StreamError> {
        let cursor = self.inner.cursor();
        let oldest = self.inner.oldest(cursor);

        if index < oldest {
            return Err(StreamError::Overrun {
                requested: index,
                oldest,
            });
        }

        if index > cursor {
            return Err(StreamError::AheadOfWriter {
                requested: index,
                cursor,
            });
        }

        self.position = index;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Stream reader closed at index {}", self.position);
        }
    }
}
