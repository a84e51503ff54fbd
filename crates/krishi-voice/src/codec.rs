//! PCM frame codec: quantization, transport encoding, and level metering.
//!
//! Capture frames are f32 samples in -1.0..1.0; the engine speaks 16-bit
//! little-endian PCM wrapped in base64. Both directions go through here.

use crate::error::{SessionError, SessionResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Gain applied to raw RMS before clamping to [0,1] for the level meter.
/// Typical speech peaks around 0.25 RMS of full scale.
const LEVEL_GAIN: f32 = 4.0;

/// One encoded capture frame, ready for the engine channel.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Base64-encoded PCM16 LE payload.
    pub data: String,
    /// Mime tag carrying the sample rate, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// Root-mean-square activity level of a frame, scaled and clamped to [0,1].
///
/// Side channel for the UI level meter; has no effect on session correctness.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    (rms * LEVEL_GAIN).clamp(0.0, 1.0)
}

/// Quantize a frame to PCM16 LE and base64-encode it for the wire.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let quantized = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    EncodedChunk {
        data: BASE64.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
    }
}

/// Decode raw PCM16 LE bytes to f32 samples.
///
/// An odd byte count means a truncated sample and is rejected.
pub fn decode_pcm(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect();
    Ok(samples)
}

/// Duration in seconds of a decoded mono buffer.
pub fn buffer_duration(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_level(&[0.0; 480]), 0.0);
        assert_eq!(rms_level(&[]), 0.0);
    }

    #[test]
    fn rms_clamps_at_full_scale() {
        let loud = vec![1.0f32; 480];
        assert_eq!(rms_level(&loud), 1.0);
    }

    #[test]
    fn rms_scales_quiet_speech() {
        let quiet = vec![0.1f32; 480];
        let level = rms_level(&quiet);
        assert!(level > 0.3 && level < 0.5, "got {}", level);
    }

    #[test]
    fn encode_tags_sample_rate() {
        let chunk = encode_frame(&[0.0; 16], 16000);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        let bytes = BASE64.decode(&chunk.data).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let chunk = encode_frame(&[2.0, -2.0], 16000);
        let bytes = BASE64.decode(&chunk.data).unwrap();
        let hi = i16::from_le_bytes([bytes[0], bytes[1]]);
        let lo = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(hi, i16::MAX);
        assert_eq!(lo, -i16::MAX);
    }

    #[test]
    fn decode_rejects_odd_length() {
        assert!(decode_pcm(&[0, 1, 2]).is_err());
    }

    #[test]
    fn decode_recovers_quantized_values() {
        let chunk = encode_frame(&[0.5, -0.5, 0.0], 16000);
        let bytes = BASE64.decode(&chunk.data).unwrap();
        let samples = decode_pcm(&bytes).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
        assert_eq!(samples[2], 0.0);
    }

    #[test]
    fn duration_of_one_second_buffer() {
        assert_eq!(buffer_duration(24000, 24000), 1.0);
        assert_eq!(buffer_duration(12000, 24000), 0.5);
    }
}
