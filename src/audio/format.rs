//! PCM stream description and the RIFF header sent ahead of the audio

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::AudioError;

/// Format of the PCM audio handed to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamFormat {
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioStreamFormat {
    /// 16kHz, 16-bit, mono: what the service expects by default
    fn default() -> Self {
        Self::pcm(16000, 16, 1)
    }
}

impl AudioStreamFormat {
    pub fn pcm(samples_per_sec: u32, bits_per_sample: u16, channels: u16) -> Self {
        Self {
            samples_per_sec,
            bits_per_sample,
            channels,
        }
    }

    /// Build from a WAV file spec; only integer PCM is accepted
    pub fn from_wav_spec(spec: &WavSpec) -> Result<Self, AudioError> {
        if spec.sample_format != SampleFormat::Int {
            return Err(AudioError::UnsupportedFormat(
                "only integer PCM is supported".to_string(),
            ));
        }
        if spec.bits_per_sample != 8 && spec.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} bits per sample",
                spec.bits_per_sample
            )));
        }
        Ok(Self::pcm(
            spec.sample_rate,
            spec.bits_per_sample,
            spec.channels,
        ))
    }

    pub fn block_align(&self) -> u32 {
        self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.samples_per_sec * self.block_align()
    }

    /// Bytes covering `ms` milliseconds of audio, aligned to whole frames
    pub fn bytes_for_duration_ms(&self, ms: u32) -> usize {
        let raw = self.avg_bytes_per_sec() as u64 * ms as u64 / 1000;
        let align = self.block_align().max(1) as u64;
        ((raw / align) * align) as usize
    }

    /// 44-byte RIFF/WAVE header with zero data length
    pub fn header(&self) -> Result<Vec<u8>, AudioError> {
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.samples_per_sec,
            bits_per_sample: self.bits_per_sample,
            sample_format: SampleFormat::Int,
        };

        let mut bytes = Vec::with_capacity(44);
        let writer = WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;
        writer
            .finalize()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_rates() {
        let format = AudioStreamFormat::default();
        assert_eq!(format.block_align(), 2);
        assert_eq!(format.avg_bytes_per_sec(), 32000);
    }

    #[test]
    fn test_bytes_for_duration_aligned() {
        let format = AudioStreamFormat::pcm(16000, 16, 2);
        // 4 bytes per frame, 100ms = 6400 bytes
        assert_eq!(format.bytes_for_duration_ms(100), 6400);
        assert_eq!(format.bytes_for_duration_ms(100) % 4, 0);
    }

    #[test]
    fn test_header_is_riff_wave() {
        let header = AudioStreamFormat::default().header().unwrap();

        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        // sample rate, little-endian, at byte 24
        assert_eq!(
            u32::from_le_bytes([header[24], header[25], header[26], header[27]]),
            16000
        );
    }

    #[test]
    fn test_float_wav_rejected() {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        assert!(AudioStreamFormat::from_wav_spec(&spec).is_err());
    }
}
