//! # Audio Normalization
//!
//! Best-effort conversion of client audio into the PCM layout the upstream
//! speech service expects (16kHz, 16-bit, mono, little-endian).
//!
//! ## Key Functions:
//! - **Format detection**: Map the client's declared format onto [`AudioFormat`]
//! - **WAV decoding**: Strip the RIFF header, downmix, resample
//! - **PCM resampling**: Linear interpolation between sample rates
//! - **Passthrough**: Compressed containers (webm/ogg) are forwarded untouched
//!
//! Normalization never fails outright. Anything that cannot be decoded is
//! passed through with its declared format so the upstream can decide.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::{debug, warn};

/// Audio container/encoding as declared by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm,
    Wav,
    Webm,
    Ogg,
}

impl AudioFormat {
    /// Interpret a loose client-supplied format string.
    ///
    /// Browsers record webm/opus by default, so anything unrecognised
    /// (including `"auto"`) is treated as webm.
    pub fn from_declared(declared: &str) -> Self {
        let lower = declared.to_ascii_lowercase();
        if lower.contains("wav") {
            AudioFormat::Wav
        } else if lower.contains("pcm") || lower == "raw" || lower.contains("l16") {
            AudioFormat::Pcm
        } else if lower.contains("ogg") || (lower.contains("opus") && !lower.contains("webm")) {
            AudioFormat::Ogg
        } else {
            AudioFormat::Webm
        }
    }

    /// MIME type used when forwarding a frame of this format upstream.
    pub fn mime_type(&self, sample_rate: u32) -> String {
        match self {
            AudioFormat::Pcm => format!("audio/pcm;rate={}", sample_rate),
            AudioFormat::Wav => "audio/wav".to_string(),
            AudioFormat::Webm => "audio/webm".to_string(),
            AudioFormat::Ogg => "audio/ogg".to_string(),
        }
    }
}

/// A contiguous block of audio bytes plus the metadata needed to forward it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub format: AudioFormat,
}

impl AudioFrame {
    /// Build a frame that shares this frame's metadata but carries `data`.
    pub fn with_data(&self, data: Vec<u8>) -> Self {
        Self {
            data,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
            format: self.format.clone(),
        }
    }

    pub fn mime_type(&self) -> String {
        self.format.mime_type(self.sample_rate)
    }
}

/// Declared input rates outside this range are treated as bogus.
pub const SUPPORTED_INPUT_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Target PCM layout.
#[derive(Debug, Clone)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for PcmSpec {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // upstream input rate
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Converts client audio into the upstream input format.
pub struct AudioProcessor {
    target: PcmSpec,
}

impl AudioProcessor {
    pub fn new(target: PcmSpec) -> Self {
        Self { target }
    }

    /// Normalize `raw` into a frame ready for the upstream.
    ///
    /// ## Behaviour by declared format:
    /// - **wav**: decoded, downmixed to mono, resampled to the target rate
    /// - **pcm**: assumed 16-bit mono; a trailing odd byte is dropped and the
    ///   samples are resampled when `declared_rate` differs. Rates outside
    ///   [`SUPPORTED_INPUT_RATES`] are ignored.
    /// - **webm/ogg**: passed through unchanged
    ///
    /// Bytes that start with a RIFF header are decoded as WAV regardless of the
    /// declared format. Decode failures fall back to passthrough.
    pub fn normalize_to_pcm(
        &self,
        raw: Vec<u8>,
        declared: &AudioFormat,
        declared_rate: Option<u32>,
    ) -> AudioFrame {
        if *declared == AudioFormat::Wav || Self::is_wav(&raw) {
            return match self.decode_wav(&raw) {
                Ok(samples) => self.pcm_frame(samples),
                Err(e) => {
                    warn!("WAV decode failed, passing audio through: {}", e);
                    self.passthrough(raw, AudioFormat::Wav, declared_rate)
                }
            };
        }

        match declared {
            AudioFormat::Pcm => {
                let mut raw = raw;
                if raw.len() % 2 != 0 {
                    debug!("Dropping trailing byte of odd-length PCM payload ({} bytes)", raw.len());
                    raw.truncate(raw.len() & !1);
                }
                let from_rate = match declared_rate {
                    Some(rate) if SUPPORTED_INPUT_RATES.contains(&rate) => rate,
                    Some(rate) => {
                        warn!("Ignoring unsupported declared sample rate {}Hz", rate);
                        self.target.sample_rate
                    }
                    None => self.target.sample_rate,
                };
                if from_rate == self.target.sample_rate {
                    return self.passthrough(raw, AudioFormat::Pcm, Some(from_rate));
                }
                let samples = Self::bytes_to_samples(&raw);
                debug!("Resampling PCM {}Hz -> {}Hz", from_rate, self.target.sample_rate);
                self.pcm_frame(Self::resample(&samples, from_rate, self.target.sample_rate))
            }
            other => self.passthrough(raw, other.clone(), declared_rate),
        }
    }

    fn pcm_frame(&self, samples: Vec<i16>) -> AudioFrame {
        AudioFrame {
            data: Self::samples_to_bytes(&samples),
            sample_rate: self.target.sample_rate,
            channels: self.target.channels,
            bit_depth: self.target.bit_depth,
            format: AudioFormat::Pcm,
        }
    }

    fn passthrough(&self, raw: Vec<u8>, format: AudioFormat, rate: Option<u32>) -> AudioFrame {
        AudioFrame {
            data: raw,
            sample_rate: rate.unwrap_or(self.target.sample_rate),
            channels: self.target.channels,
            bit_depth: self.target.bit_depth,
            format,
        }
    }

    /// RIFF/WAVE magic check.
    pub fn is_wav(data: &[u8]) -> bool {
        data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
    }

    /// Decode a WAV container into mono samples at the target rate.
    fn decode_wav(&self, raw: &[u8]) -> Result<Vec<i16>, String> {
        let mut cursor = Cursor::new(raw);
        let (header, data) = wav::read(&mut cursor).map_err(|e| e.to_string())?;
        if !SUPPORTED_INPUT_RATES.contains(&header.sampling_rate) {
            return Err(format!("unsupported WAV sample rate {}Hz", header.sampling_rate));
        }

        let interleaved: Vec<i16> = match data {
            wav::BitDepth::Sixteen(samples) => samples,
            wav::BitDepth::Eight(samples) => samples
                .into_iter()
                .map(|s| ((s as i16) - 128) << 8)
                .collect(),
            wav::BitDepth::TwentyFour(samples) => {
                samples.into_iter().map(|s| (s >> 8) as i16).collect()
            }
            wav::BitDepth::ThirtyTwoFloat(samples) => samples
                .into_iter()
                .map(|s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
                .collect(),
            wav::BitDepth::Empty => return Err("WAV file contains no samples".to_string()),
        };

        let mono = Self::downmix(&interleaved, header.channel_count);
        Ok(Self::resample(&mono, header.sampling_rate, self.target.sample_rate))
    }

    /// Average interleaved channels into a single mono channel.
    pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
        if channels <= 1 {
            return samples.to_vec();
        }
        samples
            .chunks(channels as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    }

    /// Linear-interpolation resampler.
    pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
        if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
            return samples.to_vec();
        }

        let ratio = from_rate as f64 / to_rate as f64;
        let out_len = ((samples.len() as f64) / ratio).floor() as usize;
        let last = samples.len() - 1;

        (0..out_len)
            .map(|i| {
                let pos = i as f64 * ratio;
                let idx = pos.floor() as usize;
                let frac = pos - idx as f64;
                let a = samples[idx.min(last)] as f64;
                let b = samples[(idx + 1).min(last)] as f64;
                (a + (b - a) * frac).round().clamp(-32768.0, 32767.0) as i16
            })
            .collect()
    }

    /// Little-endian 16-bit PCM bytes to samples. A trailing odd byte is ignored.
    pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        samples
    }

    pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            // Writing into a Vec cannot fail
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], channels: u16, rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(&AudioProcessor::samples_to_bytes(samples));
        out
    }

    #[test]
    fn test_declared_format_parsing() {
        assert_eq!(AudioFormat::from_declared("audio/wav"), AudioFormat::Wav);
        assert_eq!(AudioFormat::from_declared("PCM"), AudioFormat::Pcm);
        assert_eq!(AudioFormat::from_declared("audio/webm;codecs=opus"), AudioFormat::Webm);
        assert_eq!(AudioFormat::from_declared("audio/ogg"), AudioFormat::Ogg);
        assert_eq!(AudioFormat::from_declared("auto"), AudioFormat::Webm);
    }

    #[test]
    fn test_pcm_at_target_rate_is_untouched() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let raw = AudioProcessor::samples_to_bytes(&[1, -2, 3, -4]);
        let frame = processor.normalize_to_pcm(raw.clone(), &AudioFormat::Pcm, None);
        assert_eq!(frame.data, raw);
        assert_eq!(frame.format, AudioFormat::Pcm);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_pcm_resampled_from_higher_rate() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let samples = vec![100i16; 480]; // 10ms at 48kHz
        let raw = AudioProcessor::samples_to_bytes(&samples);
        let frame = processor.normalize_to_pcm(raw, &AudioFormat::Pcm, Some(48000));
        assert_eq!(frame.data.len(), 160 * 2);
        assert_eq!(frame.sample_rate, 16000);
    }

    #[test]
    fn test_stereo_wav_is_downmixed() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let interleaved = [1000i16, 3000, -1000, -3000, 0, 200];
        let raw = wav_bytes(&interleaved, 2, 16000);
        let frame = processor.normalize_to_pcm(raw, &AudioFormat::Pcm, None);
        assert_eq!(frame.format, AudioFormat::Pcm);
        assert_eq!(AudioProcessor::bytes_to_samples(&frame.data), vec![2000, -2000, 100]);
    }

    #[test]
    fn test_webm_passthrough_and_bad_wav_fallback() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let blob = vec![0x1a, 0x45, 0xdf, 0xa3, 0x00];
        let frame = processor.normalize_to_pcm(blob.clone(), &AudioFormat::Webm, None);
        assert_eq!(frame.data, blob);
        assert_eq!(frame.mime_type(), "audio/webm");

        let broken = b"RIFF\x00\x00\x00\x00WAVEjunk".to_vec();
        let frame = processor.normalize_to_pcm(broken.clone(), &AudioFormat::Wav, None);
        assert_eq!(frame.data, broken);
        assert_eq!(frame.format, AudioFormat::Wav);
    }

    #[test]
    fn test_odd_trailing_byte_is_trimmed() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let frame = processor.normalize_to_pcm(vec![1, 2, 3, 4, 5], &AudioFormat::Pcm, None);
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");

        let frame = processor.normalize_to_pcm(vec![9], &AudioFormat::Pcm, None);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_implausible_declared_rate_is_ignored() {
        let processor = AudioProcessor::new(PcmSpec::default());
        let raw = vec![7u8; 2000];
        for rate in [1, 7_999, 192_001, u32::MAX] {
            let frame = processor.normalize_to_pcm(raw.clone(), &AudioFormat::Pcm, Some(rate));
            assert_eq!(frame.data.len(), raw.len(), "rate {}", rate);
            assert_eq!(frame.sample_rate, 16000);
        }

        let tiny_rate_wav = wav_bytes(&[100i16; 10], 1, 1);
        let frame = processor.normalize_to_pcm(tiny_rate_wav.clone(), &AudioFormat::Wav, None);
        assert_eq!(frame.data, tiny_rate_wav);
        assert_eq!(frame.format, AudioFormat::Wav);
    }

    #[test]
    fn test_resample_identity_and_empty() {
        assert_eq!(AudioProcessor::resample(&[1, 2, 3], 16000, 16000), vec![1, 2, 3]);
        assert!(AudioProcessor::resample(&[], 48000, 16000).is_empty());
    }
}
