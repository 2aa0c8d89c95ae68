/// Keyword detector lifecycle
///
/// Validates inputs, acquires the stream handles, prepares the source and runs
/// the [`DetectionEngine`] on a dedicated thread. Dropping the detector (or
/// calling [`KeywordDetector::shutdown`]) cancels the engine and joins the
/// thread.

use crate::config::{ConfigError, RelayConfig};
use crate::engine::{DetectionEngine, DetectorStats, EngineCounters};
use crate::format::{AudioFormat, Endianness};
use crate::observer::{DetectionNotifier, DetectorStateObserver, KeywordObserver, ObserverRegistry};
use crate::source::{ByteSource, FifoSource, SourceError};
use crate::strategy::{DetectionStrategy, EdgeTrigger};
use crate::stream::{AudioStream, ReaderPolicy, StreamError, WriterPolicy};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name of the thread running the detection loop
pub const DETECTION_THREAD_NAME: &str = "kwd-detection";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Failed to create stream {handle}: {source}")]
    HandleCreationFailed {
        handle: &'static str,
        #[source]
        source: StreamError,
    },

    #[error("Source setup failed: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to start detection thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Detector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Running,
    ShuttingDown,
    Stopped,
}

/// Builder for [`KeywordDetector`]
#[derive(Default)]
pub struct DetectorBuilder {
    stream: Option<Arc<dyn AudioStream>>,
    format: Option<AudioFormat>,
    registry: Option<Arc<ObserverRegistry>>,
    notifier: Option<Arc<dyn DetectionNotifier>>,
    keyword_observers: Vec<Arc<dyn KeywordObserver>>,
    state_observers: Vec<Arc<dyn DetectorStateObserver>>,
    source: Option<Box<dyn ByteSource>>,
    strategy: Option<Box<dyn DetectionStrategy>>,
    config: RelayConfig,
}

impl DetectorBuilder {
    /// Shared stream the detector writes into (required)
    pub fn stream(mut self, stream: Arc<dyn AudioStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Format of the source audio; defaults to `config.audio_format`
    pub fn audio_format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn keyword_observer(mut self, observer: Arc<dyn KeywordObserver>) -> Self {
        self.keyword_observers.push(observer);
        self
    }

    pub fn state_observer(mut self, observer: Arc<dyn DetectorStateObserver>) -> Self {
        self.state_observers.push(observer);
        self
    }

    /// Share an existing registry; observers added on the builder join it
    pub fn observer_registry(mut self, registry: Arc<ObserverRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Report through a custom notifier instead of an observer registry
    pub fn notifier(mut self, notifier: Arc<dyn DetectionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Source to relay from; defaults to a [`FifoSource`] at `config.fifo_path`
    pub fn source(mut self, source: Box<dyn ByteSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Detection strategy; defaults to [`EdgeTrigger`]
    pub fn strategy(mut self, strategy: Box<dyn DetectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate everything and start the detection thread
    pub fn build(self) -> Result<KeywordDetector, DetectorError> {
        let stream = self.stream.ok_or_else(|| {
            error!("Detector creation failed: no shared stream");
            DetectorError::InvalidInput("a shared audio stream is required".to_string())
        })?;

        let has_observers = !self.keyword_observers.is_empty() || !self.state_observers.is_empty();
        if self.notifier.is_some() && has_observers {
            error!("Detector creation failed: observers given with a custom notifier");
            return Err(DetectorError::InvalidInput(
                "observers cannot be combined with a custom notifier".to_string(),
            ));
        }

        let format = self.format.unwrap_or(self.config.audio_format);
        if format.requires_byte_swap() {
            error!("Detector creation failed: byte order mismatch");
            return Err(DetectorError::UnsupportedFormat(format!(
                "{:?} byte order, host is {:?}",
                format.endianness,
                Endianness::native()
            )));
        }

        self.config.validate()?;

        let reader = stream
            .create_reader(ReaderPolicy::Blocking)
            .map_err(|source| DetectorError::HandleCreationFailed {
                handle: "reader",
                source,
            })?;

        let writer = stream
            .create_writer(WriterPolicy::NonBlockable)
            .map_err(|source| DetectorError::HandleCreationFailed {
                handle: "writer",
                source,
            })?;

        let strategy = self
            .strategy
            .unwrap_or_else(|| Box::new(EdgeTrigger::new()));
        if !strategy.supports_format(&format) {
            error!("Detector creation failed: strategy rejected {:?}", format);
            return Err(DetectorError::UnsupportedFormat(format!(
                "{:?} at {} Hz is not supported by the detection strategy",
                format.encoding, format.sample_rate_hz
            )));
        }

        let config = self.config;
        let mut source = self
            .source
            .unwrap_or_else(|| Box::new(FifoSource::new(config.fifo_path.clone())));
        source.prepare()?;

        let notifier: Arc<dyn DetectionNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => {
                let registry = self.registry.unwrap_or_default();
                for observer in self.keyword_observers {
                    registry.add_keyword_observer(observer);
                }
                for observer in self.state_observers {
                    registry.add_state_observer(observer);
                }
                debug!("Using observer registry: {:?}", registry);
                registry as Arc<dyn DetectionNotifier>
            }
        };

        info!(
            source = %source.describe(),
            sample_rate_hz = format.sample_rate_hz,
            max_samples_per_push = config.max_samples_per_push(&format),
            "Initializing keyword detector"
        );

        let engine = DetectionEngine::new(source, stream, writer, reader, notifier, strategy, config);
        KeywordDetector::start(engine)
    }
}

/// Running keyword detector
pub struct KeywordDetector {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    lifecycle: watch::Sender<LifecycleState>,
    counters: Arc<EngineCounters>,
}

impl KeywordDetector {
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    fn start(engine: DetectionEngine) -> Result<Self, DetectorError> {
        let (lifecycle, _) = watch::channel(LifecycleState::Constructed);
        let cancel = CancellationToken::new();
        let counters = engine.counters();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(DETECTION_THREAD_NAME)
            .build()
            .map_err(DetectorError::Spawn)?;

        let token = cancel.clone();
        let thread = std::thread::Builder::new()
            .name(DETECTION_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(engine.run(token)))
            .map_err(DetectorError::Spawn)?;

        lifecycle.send_replace(LifecycleState::Running);
        info!("Keyword detector running");

        Ok(Self {
            cancel,
            thread: Some(thread),
            lifecycle,
            counters,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Get current statistics
    pub fn stats(&self) -> DetectorStats {
        self.counters.snapshot()
    }

    /// Stop the detection loop and wait for its thread to exit
    pub fn shutdown(mut self) -> DetectorStats {
        self.stop();
        self.stats()
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.lifecycle.send_replace(LifecycleState::ShuttingDown);
        info!("Shutting down keyword detector");

        self.cancel.cancel();
        if thread.join().is_err() {
            error!("Detection thread panicked");
        }

        self.lifecycle.send_replace(LifecycleState::Stopped);
        info!("Keyword detector stopped");
    }
}

impl Drop for KeywordDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
