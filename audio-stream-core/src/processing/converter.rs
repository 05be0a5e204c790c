/// Pure-math converter from native capture formats to canonical PCM.
///
/// Canonical format: mono 16-bit little-endian PCM at `target_sample_rate`.
/// All operations work on `&[f32]` buffers with no platform dependencies
/// and no allocation beyond the output buffer, so the conversion can run
/// inside the audio callback.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    target_sample_rate: u32,
}

impl FormatConverter {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Full native → canonical transform: downmix, resample, quantize.
    ///
    /// `samples` is interleaved `channels`-wide f32 at `source_rate`.
    /// Output length in samples is exactly
    /// `floor(frames * target_rate / source_rate)`; partial trailing
    /// samples are never emitted.
    pub fn convert(&self, samples: &[f32], channels: u16, source_rate: u32) -> Vec<u8> {
        let mono = Self::downmix_to_mono(samples, channels);
        let resampled = self.resample(&mono, source_rate);
        Self::quantize_i16_le(&resampled)
    }

    /// Average interleaved channels down to mono.
    pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
        if channels <= 1 {
            return samples.to_vec();
        }
        let channels = channels as usize;
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Linear-interpolation resample from `source_rate` to the target rate.
    ///
    /// Output length is `floor(len * target / source)` by integer math, so
    /// repeated buffers of the same size always produce the same count.
    pub fn resample(&self, samples: &[f32], source_rate: u32) -> Vec<f32> {
        if source_rate == self.target_sample_rate || samples.is_empty() {
            return samples.to_vec();
        }

        let out_len =
            (samples.len() as u64 * self.target_sample_rate as u64 / source_rate as u64) as usize;
        if out_len == 0 {
            return Vec::new();
        }

        let step = source_rate as f64 / self.target_sample_rate as f64;
        let mut output = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let pos = i as f64 * step;
            let index = pos as usize;
            let fraction = (pos - index as f64) as f32;

            let sample = if index + 1 < samples.len() {
                samples[index] * (1.0 - fraction) + samples[index + 1] * fraction
            } else {
                samples[samples.len() - 1]
            };
            output.push(sample);
        }
        output
    }

    /// Convert f32 samples to 16-bit little-endian PCM bytes.
    ///
    /// Out-of-range values are clamped to [-1.0, 1.0] before quantizing.
    pub fn quantize_i16_le(samples: &[f32]) -> Vec<u8> {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            let value = (clamped * i16::MAX as f32) as i16;
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    /// RMS level of samples (0.0–1.0 for normalized audio).
    pub fn rms_level(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Peak absolute level of samples.
    pub fn peak_level(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn downmix_averages_channels() {
        let interleaved = [0.2f32, 0.4, -0.6, 0.6, 1.0, 0.0];
        let mono = FormatConverter::downmix_to_mono(&interleaved, 2);
        assert_eq!(mono.len(), 3);
        assert_relative_eq!(mono[0], 0.3, epsilon = 1e-6);
        assert_relative_eq!(mono[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(mono[2], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn downmix_mono_is_passthrough() {
        let samples = [0.1f32, 0.2, 0.3];
        assert_eq!(FormatConverter::downmix_to_mono(&samples, 1), samples);
    }

    #[test]
    fn resample_same_rate_is_passthrough() {
        let converter = FormatConverter::new(16000);
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(converter.resample(&samples, 16000), samples);
    }

    #[test]
    fn resample_output_length_is_exact_floor() {
        let converter = FormatConverter::new(16000);
        for (len, rate) in [(480, 48000u32), (441, 44100), (1024, 44100), (333, 22050)] {
            let samples = vec![0.5f32; len];
            let out = converter.resample(&samples, rate);
            let expected = (len as u64 * 16000 / rate as u64) as usize;
            assert_eq!(out.len(), expected, "len={} rate={}", len, rate);
        }
    }

    #[test]
    fn resample_interpolates_midpoints() {
        let converter = FormatConverter::new(48000);
        let out = converter.resample(&[0.0, 1.0], 24000);
        assert_eq!(out.len(), 4);
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn quantize_clamps_and_scales() {
        let pcm = FormatConverter::quantize_i16_le(&[0.0, 1.0, -1.0, 2.0, -3.0]);
        assert_eq!(pcm.len(), 10);
        let read = |i: usize| i16::from_le_bytes([pcm[i * 2], pcm[i * 2 + 1]]);
        assert_eq!(read(0), 0);
        assert_eq!(read(1), i16::MAX);
        assert_eq!(read(2), -i16::MAX);
        assert_eq!(read(3), i16::MAX);
        assert_eq!(read(4), -i16::MAX);
    }

    #[test]
    fn convert_full_pipeline_sample_count() {
        // 100 ms of 48 kHz stereo → 100 ms of 16 kHz mono PCM16.
        let converter = FormatConverter::new(16000);
        let frames = 4800;
        let interleaved: Vec<f32> = (0..frames * 2).map(|i| (i as f32 * 0.01).sin()).collect();
        let pcm = converter.convert(&interleaved, 2, 48000);
        assert_eq!(pcm.len() / 2, frames * 16000 / 48000);
    }

    #[test]
    fn rms_and_peak() {
        assert_eq!(FormatConverter::rms_level(&[]), 0.0);
        assert_relative_eq!(FormatConverter::rms_level(&[1.0, 1.0]), 1.0, epsilon = 1e-6);
        assert_relative_eq!(
            FormatConverter::peak_level(&[0.1, -0.7, 0.3]),
            0.7,
            epsilon = 1e-6
        );
    }
}
