//! 16-bit linear PCM framing helpers.
//!
//! Outbound: `f32` in [-1, 1] → `i16` (× 32768, truncated, saturating) →
//! little-endian bytes → base64. Inbound is the reverse, dividing by 32768.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{CallError, CallResult};

pub const PCM_SCALE: f32 = 32768.0;

/// MIME type declared on every outbound frame.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

pub fn quantize(samples: &[f32]) -> Vec<i16> {
    // `as` truncates toward zero and saturates, so 1.0 maps to i16::MAX
    samples.iter().map(|&s| (s * PCM_SCALE) as i16).collect()
}

pub fn dequantize(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM_SCALE).collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_pcm16(bytes: &[u8]) -> CallResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CallError::MalformedAudio(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> CallResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| CallError::MalformedAudio(format!("invalid base64: {}", e)))
}

/// A playback-ready buffer: interleaved `f32` samples plus their format.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Turns raw inbound PCM16 bytes into a playable buffer.
///
/// Empty payloads and payloads that do not hold a whole number of frames
/// are rejected.
pub fn decode_audio(bytes: &[u8], sample_rate: u32, channels: u16) -> CallResult<DecodedAudio> {
    if sample_rate == 0 || channels == 0 {
        return Err(CallError::MalformedAudio(format!(
            "invalid format {}Hz/{}ch",
            sample_rate, channels
        )));
    }
    let samples = bytes_to_pcm16(bytes)?;
    if samples.is_empty() {
        return Err(CallError::MalformedAudio("empty audio payload".into()));
    }
    if samples.len() % channels as usize != 0 {
        return Err(CallError::MalformedAudio(format!(
            "{} samples do not split into {} channels",
            samples.len(),
            channels
        )));
    }
    Ok(DecodedAudio {
        samples: dequantize(&samples),
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_frame_round_trips_to_zeros() {
        let silence = vec![0.0f32; 4096];
        let wire = encode_base64(&pcm16_to_bytes(&quantize(&silence)));
        let decoded = decode_audio(&decode_base64(&wire).unwrap(), 16000, 1).unwrap();
        assert_eq!(decoded.samples.len(), 4096);
        assert!(decoded.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn quantization_error_is_bounded() {
        let input: Vec<f32> = (0..200).map(|i| (i as f32 / 100.0) - 1.0).collect();
        let output = dequantize(&quantize(&input));
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= 1.0 / PCM_SCALE, "{} vs {}", a, b);
        }
    }

    #[test]
    fn quantize_truncates_and_saturates() {
        assert_eq!(quantize(&[0.5, -0.5, 1.0, -1.0, 2.0]), vec![16384, -16384, 32767, -32768, 32767]);
        // 0.00004 * 32768 = 1.31 → 1
        assert_eq!(quantize(&[0.00004, -0.00004]), vec![1, -1]);
    }

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(pcm16_to_bytes(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xFE, 0xFF]).unwrap(), vec![1, -2]);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(bytes_to_pcm16(&[1, 2, 3]), Err(CallError::MalformedAudio(_))));
        assert!(decode_audio(&[], 24000, 1).is_err());
        assert!(decode_audio(&[0, 0, 0, 0, 0, 0], 24000, 2).is_err());
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn duration_follows_frame_count() {
        let audio = decode_audio(&vec![0u8; 24000], 24000, 1).unwrap();
        assert_eq!(audio.frames(), 12000);
        assert_eq!(audio.duration(), 0.5);
        assert_eq!(pcm_mime_type(16000), "audio/pcm;rate=16000");
    }
}
