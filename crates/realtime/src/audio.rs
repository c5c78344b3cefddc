//! PCM16 helpers shared by the audio device and the session pipelines.

use base64::Engine;

/// Sample rate used on both the capture and playback side, matching the
/// wire format of the realtime service.
pub const SAMPLE_RATE: u32 = 24_000;

/// Number of samples per capture frame (~43 ms at 24 kHz).
pub const FRAME_SAMPLES: usize = 1024;

/// Encodes a slice of i16 samples into a base64 string of little-endian PCM16.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

/// Decodes a base64 string of little-endian PCM16 into i16 samples.
///
/// Malformed input yields an empty vector; incomplete trailing bytes are
/// dropped.
pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    } else {
        tracing::error!("Failed to decode base64 audio fragment");
        Vec::new()
    }
}

/// Converts a slice of f32 samples to i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to f32 samples in `[-1.0, 1.0]`.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Instantaneous loudness estimate for a chunk of samples.
///
/// Root-mean-square of the normalized samples, scaled so that ordinary
/// speech fills most of the `[0, 1]` range, clamped to 1.0.
pub fn level_estimate(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    (rms * 4.0).min(1.0)
}
