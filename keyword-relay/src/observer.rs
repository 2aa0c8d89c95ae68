/// Observer notifications
///
/// The engine reports through [`DetectionNotifier`]. [`ObserverRegistry`] is the
/// stock implementation: it fans notifications out to registered keyword and
/// detector-state observers and can be shared between several detectors.

use crate::stream::AudioStream;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Detector state reported to state observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeywordDetectorState {
    /// Audio is flowing and a detection was just made
    Active,

    /// The source reached end-of-stream
    StreamClosed,

    /// The detector hit an unrecoverable problem
    Error,
}

impl fmt::Display for KeywordDetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeywordDetectorState::Active => "ACTIVE",
            KeywordDetectorState::StreamClosed => "STREAM_CLOSED",
            KeywordDetectorState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Keyword detection result
#[derive(Debug, Clone)]
pub struct KeywordEvent {
    /// Stream the detection refers to
    pub stream: Arc<dyn AudioStream>,

    /// Detected keyword, empty when the strategy has no label
    pub keyword: String,

    /// Stream index where the keyword starts, `None` if unknown
    pub begin_index: Option<u64>,

    /// Writer cursor right after the chunk that triggered detection
    pub end_index: u64,
}

/// Receives keyword detections
pub trait KeywordObserver: Send + Sync {
    fn on_keyword_detected(&self, event: &KeywordEvent);
}

/// Receives detector state transitions
pub trait DetectorStateObserver: Send + Sync {
    fn on_state_changed(&self, state: KeywordDetectorState);
}

/// Notification sink the detection engine reports to
#[cfg_attr(test, mockall::automock)]
pub trait DetectionNotifier: Send + Sync {
    fn notify_state(&self, state: KeywordDetectorState);

    fn notify_keyword(&self, event: &KeywordEvent);
}

/// Shared set of keyword and state observers
#[derive(Default)]
pub struct ObserverRegistry {
    keyword_observers: RwLock<Vec<Arc<dyn KeywordObserver>>>,
    state_observers: RwLock<Vec<Arc<dyn DetectorStateObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with observers
    pub fn with_observers(
        keyword_observers: impl IntoIterator<Item = Arc<dyn KeywordObserver>>,
        state_observers: impl IntoIterator<Item = Arc<dyn DetectorStateObserver>>,
    ) -> Self {
        let registry = Self::new();
        for observer in keyword_observers {
            registry.add_keyword_observer(observer);
        }
        for observer in state_observers {
            registry.add_state_observer(observer);
        }
        registry
    }

    /// Register a keyword observer; registering the same `Arc` twice is a no-op
    pub fn add_keyword_observer(&self, observer: Arc<dyn KeywordObserver>) {
        let mut observers = self.keyword_observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Returns true if the observer was registered
    pub fn remove_keyword_observer(&self, observer: &Arc<dyn KeywordObserver>) -> bool {
        let mut observers = self.keyword_observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    /// Register a state observer; registering the same `Arc` twice is a no-op
    pub fn add_state_observer(&self, observer: Arc<dyn DetectorStateObserver>) {
        let mut observers = self.state_observers.write();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Returns true if the observer was registered
    pub fn remove_state_observer(&self, observer: &Arc<dyn DetectorStateObserver>) -> bool {
        let mut observers = self.state_observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn keyword_observer_count(&self) -> usize {
        self.keyword_observers.read().len()
    }

    pub fn state_observer_count(&self) -> usize {
        self.state_observers.read().len()
    }
}

impl DetectionNotifier for ObserverRegistry {
    fn notify_state(&self, state: KeywordDetectorState) {
        // Snapshot so observers may (un)register from inside the callback
        let observers = self.state_observers.read().clone();
        debug!("Notifying {} state observers: {}", observers.len(), state);

        for observer in observers {
            observer.on_state_changed(state);
        }
    }

    fn notify_keyword(&self, event: &KeywordEvent) {
        let observers = self.keyword_observers.read().clone();
        debug!(
            "Notifying {} keyword observers (end_index={})",
            observers.len(),
            event.end_index
        );

        for observer in observers {
            trace!(keyword = %event.keyword, "Dispatching keyword event");
            observer.on_keyword_detected(event);
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("keyword_observers", &self.keyword_observer_count())
            .field("state_observers", &self.state_observer_count())
            .finish()
    }
}

/// Observer that writes every notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl KeywordObserver for LoggingObserver {
    fn on_keyword_detected(&self, event: &KeywordEvent) {
        info!(
            keyword = %event.keyword,
            begin_index = ?event.begin_index,
            end_index = event.end_index,
            "Keyword detected"
        );
    }
}

impl DetectorStateObserver for LoggingObserver {
    fn on_state_changed(&self, state: KeywordDetectorState) {
        info!("Keyword detector state: {}", state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SharedAudioBuffer;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        pub KeywordSink {}
        impl KeywordObserver for KeywordSink {
            fn on_keyword_detected(&self, event: &KeywordEvent);
        }
    }

    mock! {
        pub StateSink {}
        impl DetectorStateObserver for StateSink {
            fn on_state_changed(&self, state: KeywordDetectorState);
        }
    }

    fn event(end_index: u64) -> KeywordEvent {
        KeywordEvent {
            stream: Arc::new(SharedAudioBuffer::with_capacity(16).unwrap()),
            keyword: String::new(),
            begin_index: None,
            end_index,
        }
    }

    #[test]
    fn test_fan_out_to_all_observers() {
        let mut first = MockKeywordSink::new();
        first
            .expect_on_keyword_detected()
            .withf(|e| e.end_index == 512)
            .times(1)
            .return_const(());

        let mut second = MockKeywordSink::new();
        second.expect_on_keyword_detected().times(1).return_const(());

        let mut state = MockStateSink::new();
        state
            .expect_on_state_changed()
            .with(eq(KeywordDetectorState::Active))
            .times(1)
            .return_const(());

        let registry = ObserverRegistry::with_observers(
            [
                Arc::new(first) as Arc<dyn KeywordObserver>,
                Arc::new(second) as Arc<dyn KeywordObserver>,
            ],
            [Arc::new(state) as Arc<dyn DetectorStateObserver>],
        );

        registry.notify_state(KeywordDetectorState::Active);
        registry.notify_keyword(&event(512));
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        let registry = ObserverRegistry::new();
        let observer: Arc<dyn KeywordObserver> = Arc::new(LoggingObserver);

        registry.add_keyword_observer(Arc::clone(&observer));
        registry.add_keyword_observer(Arc::clone(&observer));
        assert_eq!(registry.keyword_observer_count(), 1);
    }

    #[test]
    fn test_removed_observer_not_notified() {
        let mut sink = MockStateSink::new();
        sink.expect_on_state_changed().times(0);

        let observer: Arc<dyn DetectorStateObserver> = Arc::new(sink);
        let registry = ObserverRegistry::new();
        registry.add_state_observer(Arc::clone(&observer));

        assert!(registry.remove_state_observer(&observer));
        assert!(!registry.remove_state_observer(&observer));

        registry.notify_state(KeywordDetectorState::StreamClosed);
        assert_eq!(registry.state_observer_count(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(KeywordDetectorState::Active.to_string(), "ACTIVE");
        assert_eq!(KeywordDetectorState::StreamClosed.to_string(), "STREAM_CLOSED");
        assert_eq!(KeywordDetectorState::Error.to_string(), "ERROR");
    }
}
