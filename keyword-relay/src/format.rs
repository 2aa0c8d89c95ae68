/// Audio format description for the relayed stream
///
/// The relay never converts samples, so the producer must already deliver
/// audio in the host's native byte order.

use serde::{Deserialize, Serialize};

/// Sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Linear PCM
    Lpcm,

    /// Opus frames (not relayable as samples, rejected by most strategies)
    Opus,
}

/// Byte order of multi-byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the machine we are running on
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

/// Format of the audio delivered by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub endianness: Endianness,
    pub sample_rate_hz: u32,
    pub sample_size_bits: u32,
    pub num_channels: u32,
}

impl Default for AudioFormat {
    /// 16kHz mono 16-bit LPCM in native byte order
    fn default() -> Self {
        Self {
            encoding: Encoding::Lpcm,
            endianness: Endianness::native(),
            sample_rate_hz: 16_000,
            sample_size_bits: 16,
            num_channels: 1,
        }
    }
}

impl AudioFormat {
    /// Whether samples would need byte swapping before use on this host
    pub fn requires_byte_swap(&self) -> bool {
        self.endianness != Endianness::native()
    }

    /// Samples per channel in one millisecond
    pub fn samples_per_ms(&self) -> usize {
        (self.sample_rate_hz / 1000) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_native() {
        let format = AudioFormat::default();
        assert!(!format.requires_byte_swap());
        assert_eq!(format.samples_per_ms(), 16);
    }

    #[test]
    fn test_foreign_byte_order_requires_swap() {
        let foreign = match Endianness::native() {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        };

        let format = AudioFormat {
            endianness: foreign,
            ..Default::default()
        };
        assert!(format.requires_byte_swap());
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let json = r#"{"encoding":"lpcm","endianness":"little","sample_rate_hz":8000,"sample_size_bits":16,"num_channels":1}"#;
        let format: AudioFormat = serde_json::from_str(json).unwrap();
        assert_eq!(format.encoding, Encoding::Lpcm);
        assert_eq!(format.endianness, Endianness::Little);
        assert_eq!(format.samples_per_ms(), 8);
    }
}
