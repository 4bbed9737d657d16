//! PCM helpers shared by the recorder and the media seams.

use anyhow::Result;
use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate remote media tracks typically deliver.
pub const TAP_SAMPLE_RATE: u32 = 48_000;

/// One mono chunk of decoded remote audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Root-mean-square amplitude of a sample window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Converts f32 samples to little-endian PCM16 bytes, clamping out-of-range
/// values.
pub fn pcm16_bytes(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    Bytes::from(out)
}

/// Resamples a mono signal between sample rates.
pub fn resample(input: &[f32], in_rate: u32, out_rate: u32) -> Result<Vec<f32>> {
    if in_rate == out_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    const CHUNK: usize = 1024;
    let ratio = out_rate as f64 / in_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK, 1)?;

    let mut out = Vec::with_capacity((input.len() as f64 * ratio) as usize + CHUNK);
    let mut chunks = input.chunks_exact(CHUNK);
    for chunk in &mut chunks {
        let processed = resampler.process(&[chunk], None)?;
        out.extend_from_slice(&processed[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let processed = resampler.process_partial(Some(&[tail]), None)?;
        out.extend_from_slice(&processed[0]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_abs_diff_eq!(rms(&[0.0; 480]), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rms(&[]), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_abs_diff_eq!(rms(&[0.5; 480]), 0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(rms(&[-0.25; 480]), 0.25, epsilon = 1e-4);
    }

    #[test]
    fn pcm16_round_trips_known_values() {
        let bytes = pcm16_bytes(&[0.5, -1.0, 0.0]);
        assert_eq!(bytes.len(), 6);
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, 16384);
        let second = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(second, i16::MIN);
        let third = i16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(third, 0);
    }

    #[test]
    fn pcm16_clamps_out_of_range() {
        let bytes = pcm16_bytes(&[2.0, -2.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let input = vec![0.1, 0.2, 0.3];
        let out = resample(&input, 24_000, 24_000).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn downsampling_halves_length_approximately() {
        let input: Vec<f32> = (0..4800)
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();
        let out = resample(&input, 48_000, 24_000).unwrap();
        let expected = input.len() / 2;
        let slack = 1200; // resampler chunking may trim edges
        assert!(
            out.len() >= expected - slack && out.len() <= expected + slack,
            "unexpected resampled length {}",
            out.len()
        );
    }

    #[test]
    fn resample_empty_input() {
        assert!(resample(&[], 48_000, 24_000).unwrap().is_empty());
    }
}
