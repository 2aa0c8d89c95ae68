/// Keyword relay library
///
/// Relays raw audio from a named pipe into a shared multi-reader buffer and
/// notifies keyword and detector-state observers when a new segment of audio
/// begins.

pub mod config;
pub mod detector;
pub mod engine;
pub mod format;
pub mod observer;
pub mod source;
pub mod strategy;
pub mod stream;

// Re-export main types
pub use config::{BackoffConfig, ConfigError, RelayConfig, DEFAULT_FIFO_PATH};
pub use detector::{DetectorBuilder, DetectorError, KeywordDetector, LifecycleState};
pub use engine::{DetectionEngine, DetectorStats};
pub use format::{AudioFormat, Encoding, Endianness};
pub use observer::{
    DetectionNotifier, DetectorStateObserver, KeywordDetectorState, KeywordEvent, KeywordObserver,
    LoggingObserver, ObserverRegistry,
};
pub use source::{ByteSource, FifoSource, MemoryProducer, MemorySource, SourceError, SourceState};
pub use strategy::{Detection, DetectionStrategy, EdgeTrigger, LpcmEdgeTrigger};
pub use stream::{
    AudioSample, AudioStream, ReaderPolicy, SharedAudioBuffer, StreamError, StreamReader,
    StreamWriter, WriterPolicy,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyword_relay=info,kwd_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
