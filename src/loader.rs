//! Audio file loading.
//!
//! Convenience path from a file on disk to a filled buffer: decode with
//! symphonia, downmix to the canonical mono form, optionally resample with
//! rubato, then hand the result to the buffer store. The mixer itself never
//! touches codecs; streaming decode goes through the pull-callback contract
//! instead.

use crate::error::{ResonaError, Result};
use crate::format::{self, PcmFormat, SampleFormat};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use symphonia::{
    core::{
        audio::SampleBuffer, codecs::DecoderOptions, errors::Error, formats::FormatOptions,
        io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// Decoded audio, canonical mono f32.
#[derive(Debug, Clone)]
pub struct LoadedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    /// Channel count of the file before the downmix.
    source_channels: u16,
}

impl LoadedAudio {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn source_channels(&self) -> u16 {
        self.source_channels
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// The [`PcmFormat`] describing [`LoadedAudio::to_pcm_bytes`] output.
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(SampleFormat::F32, 1, self.sample_rate)
    }

    /// Encodes the samples as PCM bytes suitable for a buffer fill.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        format::encode_mono_frames(&self.samples, &self.pcm_format())
    }

    /// Resamples to `target_rate` with an FFT resampler.
    pub fn resample(self, target_rate: u32) -> Result<Self> {
        if target_rate == 0 {
            return Err(ResonaError::invalid_value("sample rate must be non-zero"));
        }
        if target_rate == self.sample_rate {
            return Ok(self);
        }

        use rubato::{FftFixedIn, Resampler};

        const CHUNK: usize = 1024;
        let mut resampler =
            FftFixedIn::<f32>::new(self.sample_rate as usize, target_rate as usize, CHUNK, 2, 1)
                .map_err(|e| ResonaError::Loading(format!("failed to create resampler: {}", e)))?;

        let mut output = Vec::new();
        let mut index = 0;
        while index < self.samples.len() {
            let take = (self.samples.len() - index).min(CHUNK);
            let mut chunk = vec![0.0f32; CHUNK];
            chunk[..take].copy_from_slice(&self.samples[index..index + take]);

            let waves_out = resampler
                .process(&[chunk], None)
                .map_err(|e| ResonaError::Loading(format!("resampling error: {}", e)))?;
            if let Some(first) = waves_out.first() {
                output.extend_from_slice(first);
            }
            index += take;
        }

        Ok(Self {
            samples: output,
            sample_rate: target_rate,
            source_channels: self.source_channels,
        })
    }
}

/// Loads and decodes an audio file (WAV, FLAC, OGG, MP3, ...) into
/// canonical mono f32 samples at the file's own rate.
pub fn load_audio_file(path: &str) -> Result<LoadedAudio> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ResonaError::Loading(format!("failed to probe audio format: {:?}", e)))?;

    let mut reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| ResonaError::Loading("no default audio track found".to_string()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| ResonaError::Loading("sample rate not found".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| ResonaError::Loading("channel count not found".to_string()))?
        .count() as u16;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| ResonaError::Loading(format!("failed to create decoder: {:?}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => break, // end-of-file
            Err(e) => {
                return Err(ResonaError::Loading(format!("error reading packet: {:?}", e)));
            }
        };

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(Error::IoError(_)) => break,
            Err(Error::DecodeError(_)) => continue, // recoverable corruption
            Err(e) => {
                return Err(ResonaError::Loading(format!(
                    "error decoding packet: {:?}",
                    e
                )));
            }
        };

        let spec = *decoded.spec();
        let capacity = decoded.capacity();
        let mut tmp = SampleBuffer::<f32>::new(capacity as u64, spec);
        tmp.copy_interleaved_ref(decoded);

        // Downmix to the canonical mono form as we go.
        samples.extend(tmp.samples().chunks(channels as usize).map(|frame| {
            let sum: f32 = frame.iter().sum();
            sum / channels as f32
        }));
    }

    log::info!(
        "loaded {:?}: {} frames, {} Hz, {} source channel(s)",
        path,
        samples.len(),
        sample_rate,
        channels
    );

    Ok(LoadedAudio {
        samples,
        sample_rate,
        source_channels: channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let audio = LoadedAudio {
            samples: vec![0.1, 0.2, 0.3],
            sample_rate: 44_100,
            source_channels: 2,
        };
        let resampled = audio.clone().resample(44_100).unwrap();
        assert_eq!(resampled.samples(), audio.samples());
    }

    #[test]
    fn resample_scales_the_frame_count() {
        let samples: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
        let audio = LoadedAudio {
            samples,
            sample_rate: 22_050,
            source_channels: 1,
        };
        let resampled = audio.resample(44_100).unwrap();
        // Twice the rate, give or take resampler latency padding.
        let ratio = resampled.samples().len() as f64 / 4096.0;
        assert!(ratio > 1.5 && ratio < 2.5, "ratio {}", ratio);
        assert_eq!(resampled.sample_rate(), 44_100);
    }

    #[test]
    fn pcm_bytes_round_trip_through_decode() {
        let audio = LoadedAudio {
            samples: vec![0.5, -0.25],
            sample_rate: 48_000,
            source_channels: 1,
        };
        let decoded = format::decode_mono(&audio.to_pcm_bytes(), &audio.pcm_format()).unwrap();
        assert_eq!(decoded, vec![0.5, -0.25]);
    }

    #[test]
    fn missing_files_surface_io_errors() {
        assert!(load_audio_file("/no/such/file.wav").is_err());
    }
}
