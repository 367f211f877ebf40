use rustfft::{num_complex::Complex32, FftPlanner};
use crate::drivers::AnalysisError;
/// One-sided magnitude spectrum of a single LFP window.
#[derive(Clone, Debug)]
pub struct FrequencySpectrum {
    pub sample_rate_hz: f32,
    pub frequencies_hz: Vec<f32>,
    pub magnitudes: Vec<f32>,
}
impl FrequencySpectrum {
    /// Mean squared magnitude of the bins inside `[low_hz, high_hz]`.
    pub fn band_power(&self, low_hz: f32, high_hz: f32) -> f32 {
        let (sum, count) = self
            .frequencies_hz
            .iter()
            .zip(&self.magnitudes)
            .filter(|(f, _)| **f >= low_hz && **f <= high_hz)
            .fold((0.0f32, 0usize), |(sum, n), (_, m)| (sum + m * m, n + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    }
}
/// Helper that computes FFTs for a given window size.
pub struct SpectrumBuilder {
    fft_size: usize,
}
impl SpectrumBuilder {
    pub fn with_size(fft_size: usize) -> Result<Self, AnalysisError> {
        if fft_size == 0 {
            return Err(AnalysisError::InvalidFftSize);
        }
        Ok(Self { fft_size })
    }
    /// Smallest power-of-two builder that fits `len` samples.
    pub fn fitting(len: usize) -> Result<Self, AnalysisError> {
        Self::with_size(len.max(1).next_power_of_two())
    }
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }
    /// Zero-pads or truncates `samples` to the window size; the mean is removed first.
    pub fn compute(&self, samples: &[f32], sample_rate_hz: f32) -> FrequencySpectrum {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.fft_size);
        let frequencies_hz = (0..self.fft_size / 2)
            .map(|k| k as f32 * (sample_rate_hz / self.fft_size as f32))
            .collect();
        let used = samples.len().min(self.fft_size);
        let mean = if used == 0 {
            0.0
        } else {
            samples[..used].iter().sum::<f32>() / used as f32
        };
        let mut buffer: Vec<Complex32> = samples
            .iter()
            .take(self.fft_size)
            .map(|v| Complex32::new(v - mean, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex32::ZERO);
        fft.process(&mut buffer);
        let magnitudes = buffer
            .iter()
            .take(self.fft_size / 2)
            .map(|c| c.norm() / self.fft_size as f32)
            .collect();
        FrequencySpectrum {
            sample_rate_hz,
            frequencies_hz,
            magnitudes,
        }
    }
}
