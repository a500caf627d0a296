//! PCM sample formats and conversions between them.
//!
//! Buffers and devices both describe their data with a [`PcmFormat`].
//! Internally every buffer is canonicalized to mono `f32` at its declared
//! sample rate when filled; the mixer accumulates in `f32` and encodes to the
//! device's negotiated format only at the flush step.

use crate::error::{ResonaError, Result};

/// On-the-wire sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit, 128 is silence.
    U8,
    /// Signed 16-bit little-endian.
    I16,
    /// 32-bit float little-endian in [-1, 1].
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Full description of an interleaved PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub fn new(sample_format: SampleFormat, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_format,
            channels,
            sample_rate,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Number of whole frames contained in `byte_len` bytes.
    pub fn frames_in(&self, byte_len: usize) -> usize {
        byte_len / self.bytes_per_frame()
    }

    /// Validates the format fields themselves.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(ResonaError::invalid_value("channel count must be non-zero"));
        }
        if self.sample_rate == 0 {
            return Err(ResonaError::invalid_value("sample rate must be non-zero"));
        }
        Ok(())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_format: SampleFormat::I16,
            channels: 2,
            sample_rate: 44_100,
        }
    }
}

/// Decodes interleaved PCM bytes into canonical mono f32 samples, averaging
/// the channels of each frame.
///
/// # Errors
///
/// Returns an invalid-value error if `bytes` is not a whole number of frames.
pub fn decode_mono(bytes: &[u8], format: &PcmFormat) -> Result<Vec<f32>> {
    format.validate()?;
    let frame_bytes = format.bytes_per_frame();
    if bytes.len() % frame_bytes != 0 {
        return Err(ResonaError::invalid_value(format!(
            "PCM data length {} is not a multiple of the frame size {}",
            bytes.len(),
            frame_bytes
        )));
    }

    let channels = format.channels as usize;
    let mut out = Vec::with_capacity(bytes.len() / frame_bytes);

    match format.sample_format {
        SampleFormat::U8 => {
            for frame in bytes.chunks_exact(frame_bytes) {
                let sum: f32 = frame.iter().map(|&b| (b as f32 - 128.0) / 128.0).sum();
                out.push(sum / channels as f32);
            }
        }
        SampleFormat::I16 => {
            for frame in bytes.chunks_exact(frame_bytes) {
                let sum: f32 = frame
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
                    .sum();
                out.push(sum / channels as f32);
            }
        }
        SampleFormat::F32 => {
            for frame in bytes.chunks_exact(frame_bytes) {
                let sum: f32 = frame
                    .chunks_exact(4)
                    .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                    .sum();
                out.push(sum / channels as f32);
            }
        }
    }

    Ok(out)
}

/// Encodes the f32 mix accumulator into `sample_format`, clamping to [-1, 1].
pub fn encode_samples(samples: &[f32], sample_format: SampleFormat, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * sample_format.bytes_per_sample());

    match sample_format {
        SampleFormat::U8 => {
            for &sample in samples {
                let clamped = sample.clamp(-1.0, 1.0);
                out.push((clamped * 127.0 + 128.0) as u8);
            }
        }
        SampleFormat::I16 => {
            for &sample in samples {
                let clamped = sample.clamp(-1.0, 1.0);
                let value = (clamped * 32_767.0) as i16;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        SampleFormat::F32 => {
            for &sample in samples {
                out.extend_from_slice(&sample.clamp(-1.0, 1.0).to_le_bytes());
            }
        }
    }
}

/// Encodes mono f32 samples as interleaved PCM bytes in the given format.
///
/// Every output channel of a frame carries the same sample. Mostly useful for
/// producing test fixtures and for the file loader's output path.
pub fn encode_mono_frames(samples: &[f32], format: &PcmFormat) -> Vec<u8> {
    let mut interleaved = Vec::with_capacity(samples.len() * format.channels as usize);
    for &sample in samples {
        for _ in 0..format.channels {
            interleaved.push(sample);
        }
    }
    let mut out = Vec::new();
    encode_samples(&interleaved, format.sample_format, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_mono_averages_channels() {
        let format = PcmFormat::new(SampleFormat::I16, 2, 44_100);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16_384i16.to_le_bytes());
        bytes.extend_from_slice(&(-16_384i16).to_le_bytes());
        let mono = decode_mono(&bytes, &format).unwrap();
        assert_eq!(mono.len(), 1);
        assert!(mono[0].abs() < 1e-6);
    }

    #[test]
    fn decode_rejects_partial_frames() {
        let format = PcmFormat::new(SampleFormat::I16, 2, 44_100);
        assert!(decode_mono(&[0u8; 3], &format).is_err());
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let mut out = Vec::new();
        encode_samples(&[2.0, -2.0], SampleFormat::I16, &mut out);
        let high = i16::from_le_bytes([out[0], out[1]]);
        let low = i16::from_le_bytes([out[2], out[3]]);
        assert_eq!(high, 32_767);
        assert_eq!(low, -32_767);
    }

    #[test]
    fn f32_round_trip_preserves_samples() {
        let format = PcmFormat::new(SampleFormat::F32, 1, 48_000);
        let bytes = encode_mono_frames(&[0.25, -0.5], &format);
        let mono = decode_mono(&bytes, &format).unwrap();
        assert_eq!(mono, vec![0.25, -0.5]);
    }
}
