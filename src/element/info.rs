//! Stream information carried by an element.

use std::fmt;

/// Encoded format of the stream an element handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecFormat {
    /// Not known.
    #[default]
    Unknown,
    /// Raw bytes.
    Raw,
    /// Linear PCM.
    Pcm,
    /// RIFF WAVE.
    Wav,
    /// MPEG-1 layer III.
    Mp3,
    /// AAC.
    Aac,
    /// AAC in an MP4 container.
    M4a,
    /// Opus.
    Opus,
    /// FLAC.
    Flac,
    /// G.711 A-law.
    G711A,
    /// G.711 mu-law.
    G711U,
    /// G.722.
    G722,
    /// Bluetooth SBC.
    Sbc,
}

impl fmt::Display for CodecFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Music and position information of an element.
///
/// Decoders fill in the format fields and report them; sinks are retuned
/// from the reported values. Position fields are maintained by stream
/// elements as they move data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInfo {
    /// Sample rate in Hz.
    pub sample_rates: u32,
    /// Channel count.
    pub channels: u8,
    /// Bits per sample.
    pub bits: u8,
    /// Bit rate in bits per second.
    pub bps: u32,
    /// Current position in bytes.
    pub byte_pos: u64,
    /// Total stream length in bytes.
    pub total_bytes: u64,
    /// Duration in milliseconds.
    pub duration: u32,
    /// Source or destination URI.
    pub uri: Option<String>,
    /// Encoded format.
    pub codec_fmt: CodecFormat,
}

impl Default for AudioInfo {
    fn default() -> Self {
        Self {
            sample_rates: 44100,
            channels: 2,
            bits: 16,
            bps: 0,
            byte_pos: 0,
            total_bytes: 0,
            duration: 0,
            uri: None,
            codec_fmt: CodecFormat::Unknown,
        }
    }
}

impl AudioInfo {
    /// Info for a PCM stream with the given format.
    pub fn pcm(sample_rates: u32, channels: u8, bits: u8) -> Self {
        Self {
            sample_rates,
            channels,
            bits,
            codec_fmt: CodecFormat::Pcm,
            ..Default::default()
        }
    }

    /// Bytes of PCM per millisecond at this format.
    pub fn bytes_per_ms(&self) -> usize {
        self.sample_rates as usize / 1000 * self.channels as usize * (self.bits as usize / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_defaults() {
        let info = AudioInfo::default();
        assert_eq!(info.sample_rates, 44100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits, 16);
        assert_eq!(info.codec_fmt, CodecFormat::Unknown);
        assert!(info.uri.is_none());
    }

    #[test]
    fn test_bytes_per_ms() {
        let info = AudioInfo::pcm(16000, 1, 16);
        assert_eq!(info.bytes_per_ms(), 32);
        assert_eq!(info.bytes_per_ms() * 20, 640);
    }
}
