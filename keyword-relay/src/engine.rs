/// Detection engine
///
/// Pulls bytes from a [`ByteSource`], relays them into the shared stream and
/// asks the [`DetectionStrategy`] whether the chunk warrants a notification.
/// Steady-state failures never leave the loop: they are logged, counted and
/// retried with bounded backoff.

use crate::config::RelayConfig;
use crate::observer::{DetectionNotifier, KeywordDetectorState, KeywordEvent};
use crate::source::{ByteSource, SourceError, SourceState};
use crate::strategy::DetectionStrategy;
use crate::stream::{AudioStream, StreamError, StreamReader, StreamWriter, SAMPLE_WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Failure recorded during one iteration
#[derive(Error, Debug)]
enum RelayFault {
    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("stream: {0}")]
    Stream(#[from] StreamError),
}

/// Relay counters, updated by the engine and read from any thread
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    bytes_read: AtomicU64,
    samples_written: AtomicU64,
    keep_alive_samples: AtomicU64,
    stalls: AtomicU64,
    detections: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    open_failures: AtomicU64,
}

impl EngineCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DetectorStats {
        DetectorStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            keep_alive_samples: self.keep_alive_samples.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
        }
    }
}

/// Detector statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    /// Bytes received from the source
    pub bytes_read: u64,

    /// Relayed audio samples (keep-alive silence excluded)
    pub samples_written: u64,

    /// Silence samples injected during stalls
    pub keep_alive_samples: u64,

    /// End-of-stream events seen
    pub stalls: u64,

    /// Keyword notifications sent
    pub detections: u64,

    /// Failed source reads
    pub read_errors: u64,

    /// Failed writes to the shared stream, keep-alive silence included
    pub write_errors: u64,

    /// Failed open and reopen attempts
    pub open_failures: u64,
}

/// The relay loop and everything it owns
pub struct DetectionEngine {
    source: Box<dyn ByteSource>,
    stream: Arc<dyn AudioStream>,
    writer: Box<dyn StreamWriter>,
    reader: Box<dyn StreamReader>,
    notifier: Arc<dyn DetectionNotifier>,
    strategy: Box<dyn DetectionStrategy>,
    config: RelayConfig,
    counters: Arc<EngineCounters>,
    fault: Option<RelayFault>,
    consecutive_failures: u32,
    rearm_on_open: bool,
}

impl DetectionEngine {
    /// Assemble an engine from already-validated parts
    pub fn new(
        source: Box<dyn ByteSource>,
        stream: Arc<dyn AudioStream>,
        writer: Box<dyn StreamWriter>,
        reader: Box<dyn StreamReader>,
        notifier: Arc<dyn DetectionNotifier>,
        strategy: Box<dyn DetectionStrategy>,
        config: RelayConfig,
    ) -> Self {
        Self {
            source,
            stream,
            writer,
            reader,
            notifier,
            strategy,
            config,
            counters: Arc::new(EngineCounters::default()),
            fault: None,
            consecutive_failures: 0,
            rearm_on_open: false,
        }
    }

    /// Current counter values
    pub fn stats(&self) -> DetectorStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> Arc<EngineCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until `cancel` fires, then release the source and stream handles
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            source = %self.source.describe(),
            chunk_bytes = self.config.read_chunk_bytes,
            "Detection loop starting"
        );

        let mut scratch = vec![0u8; self.config.read_chunk_bytes];

        while !cancel.is_cancelled() {
            self.iterate(&mut scratch, &cancel).await;
        }

        self.finish();
    }

    async fn iterate(&mut self, scratch: &mut [u8], cancel: &CancellationToken) {
        if self.source.state() == SourceState::Closed {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = self.source.open() => result,
            };

            if let Err(e) = opened {
                EngineCounters::bump(&self.counters.open_failures, 1);
                self.record_fault(e.into());
                self.settle_fault(cancel).await;
                return;
            }
            debug!("Source {} open", self.source.describe());
            self.source_opened();
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = self.source.read(scratch) => result,
        };

        match read {
            Ok(0) => self.recover_from_stall(cancel).await,
            Ok(n) => {
                self.consecutive_failures = 0;
                self.relay(&scratch[..n]);
            }
            Err(e) => {
                EngineCounters::bump(&self.counters.read_errors, 1);
                self.record_fault(e.into());
            }
        }

        self.settle_fault(cancel).await;
    }

    /// Write the chunk and fire the notification gate
    fn relay(&mut self, chunk: &[u8]) {
        EngineCounters::bump(&self.counters.bytes_read, chunk.len() as u64);

        let sample_count = chunk.len() / SAMPLE_WORD_SIZE;
        match self.writer.write(chunk, sample_count) {
            Ok(written) => {
                EngineCounters::bump(&self.counters.samples_written, written as u64);
            }
            Err(e) => {
                EngineCounters::bump(&self.counters.write_errors, 1);
                self.record_fault(e.into());
                return;
            }
        }

        // Single writer: nothing can move the cursor between the write and this tell
        let end_index = self.writer.tell();
        trace!(bytes = chunk.len(), sample_count, end_index, "Relayed chunk");

        if let Some(detection) = self.strategy.evaluate(chunk, end_index) {
            info!(end_index, confidence = detection.confidence, "Keyword detected");

            self.notifier.notify_state(KeywordDetectorState::Active);
            self.notifier.notify_keyword(&KeywordEvent {
                stream: Arc::clone(&self.stream),
                keyword: detection.keyword,
                begin_index: detection.begin_index,
                end_index,
            });

            EngineCounters::bump(&self.counters.detections, 1);
        }
    }

    /// Keep readers moving with silence, then wait for the next producer
    async fn recover_from_stall(&mut self, cancel: &CancellationToken) {
        EngineCounters::bump(&self.counters.stalls, 1);
        info!("End of stream on {}, waiting for producer", self.source.describe());

        if self.config.notify_stream_closed {
            self.notifier.notify_state(KeywordDetectorState::StreamClosed);
        }

        let silence = [0u8; SAMPLE_WORD_SIZE];
        let mut injected = 0u64;
        for _ in 0..self.config.keep_alive_writes {
            match self.writer.write(&silence, 1) {
                Ok(n) => injected += n as u64,
                Err(e) => {
                    EngineCounters::bump(&self.counters.write_errors, 1);
                    self.record_fault(e.into());
                    break;
                }
            }
        }
        EngineCounters::bump(&self.counters.keep_alive_samples, injected);
        debug!("Injected {} keep-alive samples", injected);

        // Survives a failed reopen; the open path in `iterate` picks it up
        self.rearm_on_open = true;

        let reopened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = self.source.reopen() => result,
        };

        match reopened {
            Ok(()) => {
                info!("Reopened {}", self.source.describe());
                self.source_opened();
            }
            Err(e) => {
                EngineCounters::bump(&self.counters.open_failures, 1);
                self.record_fault(e.into());
            }
        }
    }

    /// Start a new detection segment if the source came back after a stall
    fn source_opened(&mut self) {
        if std::mem::take(&mut self.rearm_on_open) {
            self.strategy.on_stream_opened();
        }
    }

    /// Keep one fault per iteration, logging any earlier one it replaces
    fn record_fault(&mut self, fault: RelayFault) {
        if let Some(earlier) = self.fault.replace(fault) {
            error!(error = %earlier, "Relay fault superseded within the same iteration");
        }
    }

    /// Log and clear a recorded fault, then back off
    async fn settle_fault(&mut self, cancel: &CancellationToken) {
        let Some(fault) = self.fault.take() else {
            return;
        };

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.config.backoff.delay_for(self.consecutive_failures);

        error!(
            error = %fault,
            failures = self.consecutive_failures,
            retry_in_ms = delay.as_millis() as u64,
            "Relay iteration failed"
        );

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn finish(&mut self) {
        self.source.close();
        self.reader.close();
        self.writer.close();

        let stats = self.counters.snapshot();
        if stats.read_errors > 0 || stats.write_errors > 0 || stats.open_failures > 0 {
            warn!(
                read_errors = stats.read_errors,
                write_errors = stats.write_errors,
                open_failures = stats.open_failures,
                "Detection loop saw failures"
            );
        }
        info!(
            samples_written = stats.samples_written,
            detections = stats.detections,
            stalls = stats.stalls,
            "Detection loop stopped"
        );
    }
}
