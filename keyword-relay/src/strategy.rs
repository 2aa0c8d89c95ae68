/// Detection strategies
///
/// A strategy looks at each relayed chunk and decides whether it marks the
/// start of interesting audio. The engine owns one strategy and consults it
/// after every successful write.

use crate::format::{AudioFormat, Encoding};
use tracing::debug;

/// Positive detection returned by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Keyword label, empty when unknown
    pub keyword: String,

    /// Stream index where the keyword begins, if the strategy knows it
    pub begin_index: Option<u64>,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

/// Pluggable keyword detection
pub trait DetectionStrategy: Send {
    /// Whether the strategy can analyse audio in `format`
    fn supports_format(&self, _format: &AudioFormat) -> bool {
        true
    }

    /// Evaluate one relayed chunk; `end_index` is the writer cursor after it
    fn evaluate(&mut self, chunk: &[u8], end_index: u64) -> Option<Detection>;

    /// The source was (re)opened after being idle or stalled
    fn on_stream_opened(&mut self);
}

/// Treats the first chunk after an idle period as a detection
///
/// Armed at construction and after every reopen; disarmed by the detection
/// it produces, so a continuous stream yields exactly one event.
#[derive(Debug)]
pub struct EdgeTrigger {
    armed: bool,
}

impl EdgeTrigger {
    pub fn new() -> Self {
        Self { armed: true }
    }

    /// Whether the next chunk will raise a detection
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Default for EdgeTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionStrategy for EdgeTrigger {
    fn supports_format(&self, format: &AudioFormat) -> bool {
        // No analysis happens, any format can be relayed
        debug!(?format, "Edge trigger accepts format");
        true
    }

    fn evaluate(&mut self, chunk: &[u8], end_index: u64) -> Option<Detection> {
        if !self.armed || chunk.is_empty() {
            return None;
        }

        self.armed = false;
        debug!("Edge trigger fired at index {}", end_index);

        Some(Detection {
            keyword: String::new(),
            begin_index: None,
            confidence: 1.0,
        })
    }

    fn on_stream_opened(&mut self) {
        if !self.armed {
            debug!("Edge trigger re-armed");
        }
        self.armed = true;
    }
}

/// Edge trigger that only accepts linear PCM
///
/// Useful when downstream consumers decode the buffer as raw samples.
#[derive(Debug, Default)]
pub struct LpcmEdgeTrigger {
    inner: EdgeTrigger,
}

impl DetectionStrategy for LpcmEdgeTrigger {
    fn supports_format(&self, format: &AudioFormat) -> bool {
        format.encoding == Encoding::Lpcm && format.sample_size_bits == 16
    }

    fn evaluate(&mut self, chunk: &[u8], end_index: u64) -> Option<Detection> {
        self.inner.evaluate(chunk, end_index)
    }

    fn on_stream_opened(&mut self) {
        self.inner.on_stream_opened();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fires_once_per_segment() {
        let mut trigger = EdgeTrigger::new();
        assert!(trigger.is_armed());

        let detection = trigger.evaluate(&[0; 64], 32).unwrap();
        assert!(detection.keyword.is_empty());
        assert_eq!(detection.begin_index, None);
        assert_relative_eq!(detection.confidence, 1.0);
        assert!(!trigger.is_armed());

        assert!(trigger.evaluate(&[0; 64], 64).is_none());
        assert!(trigger.evaluate(&[0; 64], 96).is_none());
    }

    #[test]
    fn test_rearms_on_reopen() {
        let mut trigger = EdgeTrigger::new();
        trigger.evaluate(&[1, 2], 1);
        assert!(!trigger.is_armed());

        trigger.on_stream_opened();
        assert!(trigger.is_armed());
        assert!(trigger.evaluate(&[1, 2], 2).is_some());
    }

    #[test]
    fn test_empty_chunk_keeps_armed() {
        let mut trigger = EdgeTrigger::new();
        assert!(trigger.evaluate(&[], 0).is_none());
        assert!(trigger.is_armed());
    }

    #[test]
    fn test_lpcm_only() {
        let trigger = LpcmEdgeTrigger::default();
        assert!(trigger.supports_format(&AudioFormat::default()));

        let opus = AudioFormat {
            encoding: Encoding::Opus,
            ..Default::default()
        };
        assert!(!trigger.supports_format(&opus));
        assert!(EdgeTrigger::new().supports_format(&opus));
    }
}
