use rustfft::{num_complex::Complex64, FftPlanner};

use crate::drivers::TimeSeriesFrame;

/// Magnitude spectrum for each channel.
#[derive(Clone, Debug)]
pub struct FrequencySpectrum {
    pub sample_rate_hz: f64,
    pub frequencies_hz: Vec<f64>,
    pub magnitudes: Vec<Vec<f64>>, // channel -> bins
    pub channel_labels: Vec<String>,
}

impl FrequencySpectrum {
    /// Frequency of the strongest non-DC bin of `channel`.
    pub fn peak_frequency(&self, channel: usize) -> Option<f64> {
        let mags = self.magnitudes.get(channel)?;
        mags.iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| self.frequencies_hz[k])
    }
}

/// Computes FFTs for a given window size. Shorter signals are zero padded,
/// longer ones truncated.
pub struct SpectrumBuilder {
    fft_size: usize,
}

impl SpectrumBuilder {
    pub fn with_size(fft_size: usize) -> Self {
        Self {
            fft_size: fft_size.max(2),
        }
    }

    /// Uses the whole frame.
    pub fn for_frame(frame: &TimeSeriesFrame) -> Self {
        Self::with_size(frame.len())
    }

    pub fn compute(&self, frame: &TimeSeriesFrame) -> FrequencySpectrum {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(self.fft_size);
        let bin = frame.sample_rate_hz / self.fft_size as f64;
        let frequencies = (0..self.fft_size / 2).map(|k| k as f64 * bin).collect();
        let magnitudes: Vec<Vec<f64>> = frame
            .samples
            .iter()
            .map(|channel| {
                let mut buffer: Vec<Complex64> = channel
                    .iter()
                    .copied()
                    .take(self.fft_size)
                    .map(|v| Complex64::new(v, 0.0))
                    .collect();
                buffer.resize(self.fft_size, Complex64::new(0.0, 0.0));
                fft.process(&mut buffer);
                buffer
                    .iter()
                    .take(self.fft_size / 2)
                    .map(|c| c.norm() / self.fft_size as f64)
                    .collect()
            })
            .collect();
        FrequencySpectrum {
            sample_rate_hz: frame.sample_rate_hz,
            frequencies_hz: frequencies,
            magnitudes,
            channel_labels: frame.channel_labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::*;

    #[test]
    fn finds_carrier_frequency() {
        let rate = 10e6;
        let samples: Vec<f64> = (0..1000)
            .map(|i| (2.0 * PI * 1e6 * i as f64 / rate).sin())
            .collect();
        let frame = TimeSeriesFrame {
            sample_rate_hz: rate,
            channel_labels: vec!["CH1".into()],
            samples: vec![samples],
        };
        let spectrum = SpectrumBuilder::for_frame(&frame).compute(&frame);
        assert_eq!(spectrum.frequencies_hz.len(), 500);
        assert_eq!(spectrum.magnitudes[0].len(), 500);
        let peak = spectrum.peak_frequency(0).unwrap();
        assert!((peak - 1e6).abs() < 1.0, "{peak}");
        assert!(spectrum.peak_frequency(1).is_none());
    }
}
