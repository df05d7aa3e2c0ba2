use crate::drivers::{AcquisitionSession, LabError};

/// Converted voltages of one run, ready for analysis and plotting.
#[derive(Clone, Debug)]
pub struct TimeSeriesFrame {
    pub sample_rate_hz: f64,
    pub channel_labels: Vec<String>,
    pub samples: Vec<Vec<f64>>, // channels x samples
}

impl TimeSeriesFrame {
    pub fn from_session(session: &AcquisitionSession) -> Result<Self, LabError> {
        let mut labels = Vec::new();
        let mut samples = Vec::new();
        for &ch in session.channels() {
            labels.push(channel_label(ch));
            samples.push(session.volts(ch)?);
        }
        Ok(Self {
            sample_rate_hz: session.sample_rate_hz(),
            channel_labels: labels,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate_hz
    }

    pub fn time_axis(&self) -> Vec<f64> {
        let dt = 1.0 / self.sample_rate_hz;
        (0..self.len()).map(|i| i as f64 * dt).collect()
    }

    pub fn channel(&self, index: usize) -> Result<&[f64], LabError> {
        self.samples
            .get(index)
            .map(Vec::as_slice)
            .ok_or(LabError::ChannelOutOfRange {
                channel: index,
                available: self.samples.len(),
            })
    }

    /// Samples of zero-based scope channel `channel`, found by its label.
    pub fn scope_channel(&self, channel: usize) -> Result<&[f64], LabError> {
        let label = channel_label(channel);
        self.channel_labels
            .iter()
            .position(|l| *l == label)
            .and_then(|idx| self.samples.get(idx))
            .map(Vec::as_slice)
            .ok_or(LabError::ChannelOutOfRange {
                channel,
                available: self.samples.len(),
            })
    }
}

/// Front-panel name of a zero-based scope channel.
pub fn channel_label(channel: usize) -> String {
    format!("CH{}", channel + 1)
}
