use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::drivers::{LabError, VoltageScale};
use crate::types::{TriggerFilter, TriggerSlope, TriggerSource, WaveFunction};

/// Smallest buffer the analog input accepts; shorter requests are rounded up
/// by the instrument without notice.
pub const MIN_WINDOW_SAMPLES: usize = 16;
/// Highest sample rate the scope honours. Faster requests are silently capped.
pub const MAX_SAMPLE_RATE_HZ: f64 = 100e6;

/// Excitation pulse on one wavegen channel, repeated once per acquisition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub channel: usize,
    pub function: WaveFunction,
    /// Carrier frequency. 0 gives a single low-frequency square edge per run.
    pub frequency_hz: f64,
    pub amplitude_v: f64,
    pub offset_v: f64,
    /// Wavegen run time per repetition.
    pub width_s: f64,
    /// Wait time between repetitions (TR).
    pub repetition_s: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            function: WaveFunction::Square,
            frequency_hz: 0.0,
            amplitude_v: 5.0,
            offset_v: 0.0,
            width_s: 1e-6,
            repetition_s: 0.01,
        }
    }
}

impl PulseConfig {
    /// Compact tag for filenames, e.g. `100x1p00e-6s-TR1p00e-2s`.
    pub fn filename_tag(&self, repetitions: usize) -> String {
        format!(
            "{}x{:.2e}s-TR{:.2e}s",
            repetitions, self.width_s, self.repetition_s
        )
        .replace('.', "p")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub range_v: f64,
    pub offset_v: f64,
    /// Fixed conversion scale used instead of the one read back from the device.
    pub scale_override: Option<VoltageScale>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            range_v: 25.0,
            offset_v: 0.0,
            scale_override: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    pub channel: usize,
    pub level_v: f64,
    pub slope: TriggerSlope,
    pub holdoff_s: f64,
    /// Auto-trigger timeout; 0 disables auto triggering.
    pub auto_timeout_s: f64,
    pub filter: TriggerFilter,
    /// Samples of pre-roll before the trigger. `None` keeps the instrument
    /// default (trigger in the middle of the window).
    pub pretrigger_samples: Option<usize>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerSource::AnalogIn,
            channel: 0,
            level_v: 1.0,
            slope: TriggerSlope::Rise,
            holdoff_s: 0.0,
            auto_timeout_s: 0.0,
            filter: TriggerFilter::Average,
            pretrigger_samples: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Number of windows to record. 0 means "until interrupted" and is only
    /// valid for the timestamp logger.
    pub acquisitions: usize,
    pub pulse: Option<PulseConfig>,
    pub sample_rate_hz: f64,
    pub window_time_s: f64,
    pub channels: Vec<ChannelConfig>,
    pub trigger: TriggerConfig,
    /// Give up on a window after this long without a trigger.
    pub trigger_wait_timeout_s: Option<f64>,
    /// Treat instrument-reported errors as fatal.
    pub strict_errors: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            acquisitions: 100,
            pulse: Some(PulseConfig::default()),
            sample_rate_hz: 10e6,
            window_time_s: 200e-6,
            channels: vec![ChannelConfig::default(), ChannelConfig::default()],
            trigger: TriggerConfig::default(),
            trigger_wait_timeout_s: None,
            strict_errors: false,
        }
    }
}

impl AcquisitionConfig {
    /// Settings for logging trigger times: shortest window at the highest
    /// rate so the scope re-arms as fast as possible.
    pub fn timestamp_logger() -> Self {
        Self {
            acquisitions: 0,
            pulse: None,
            sample_rate_hz: MAX_SAMPLE_RATE_HZ,
            window_time_s: MIN_WINDOW_SAMPLES as f64 / MAX_SAMPLE_RATE_HZ,
            channels: vec![ChannelConfig {
                range_v: 5.0,
                ..ChannelConfig::default()
            }],
            trigger: TriggerConfig {
                holdoff_s: 10e-6,
                filter: TriggerFilter::Decimate,
                ..TriggerConfig::default()
            },
            trigger_wait_timeout_s: None,
            strict_errors: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, LabError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn window_len(&self) -> usize {
        (self.sample_rate_hz * self.window_time_s).round().max(0.0) as usize
    }

    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    pub fn enabled_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(i, _)| i)
            .collect()
    }

    /// Recorded time across all windows; TR dead time is not included.
    pub fn recorded_time_s(&self) -> f64 {
        self.acquisitions as f64 * self.window_len() as f64 * self.sample_period()
    }

    /// Wall-clock duration of the pulse train.
    pub fn nominal_run_time_s(&self) -> f64 {
        let tr = self.pulse.as_ref().map(|p| p.repetition_s).unwrap_or(0.0);
        self.acquisitions as f64 * tr
    }

    /// Rough USB throughput, assuming 2 bytes per sample per channel.
    pub fn approx_usb_bitrate(&self) -> f64 {
        let recorded = self.recorded_time_s();
        if recorded <= 0.0 {
            return 0.0;
        }
        let samples = self.acquisitions * self.window_len() * self.enabled_channels().len();
        16.0 * samples as f64 / recorded
    }

    /// Trigger position (seconds from window centre) giving the requested
    /// pre-roll.
    pub fn trigger_position_s(&self) -> Option<f64> {
        self.trigger
            .pretrigger_samples
            .map(|n| trigger_position_for_index(n, self.sample_period(), self.window_time_s))
    }

    pub fn validate(&self) -> Result<(), LabError> {
        if !(self.sample_rate_hz > 0.0) {
            return Err(LabError::InvalidConfig(
                "sample rate must be greater than zero".into(),
            ));
        }
        if self.sample_rate_hz > MAX_SAMPLE_RATE_HZ {
            warn!(
                "sample rate {:.3e} Hz exceeds the {:.0e} Hz limit; the instrument will cap it",
                self.sample_rate_hz, MAX_SAMPLE_RATE_HZ
            );
        }
        let window = self.window_len();
        if window < MIN_WINDOW_SAMPLES {
            return Err(LabError::InvalidConfig(format!(
                "window of {window} samples is below the {MIN_WINDOW_SAMPLES}-sample minimum"
            )));
        }
        let enabled = self.enabled_channels();
        if enabled.is_empty() || enabled.len() > 2 || self.channels.len() > 2 {
            return Err(LabError::InvalidConfig(format!(
                "1 or 2 input channels must be enabled, got {} of {}",
                enabled.len(),
                self.channels.len()
            )));
        }
        if self.trigger.source == TriggerSource::AnalogIn
            && self.trigger.channel >= self.channels.len()
        {
            return Err(LabError::ChannelOutOfRange {
                channel: self.trigger.channel,
                available: self.channels.len(),
            });
        }
        if let Some(timeout) = self.trigger_wait_timeout_s {
            if !(timeout > 0.0) {
                return Err(LabError::InvalidConfig(
                    "trigger wait timeout must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the checks that only apply to a
    /// windowed recording. A zero count would ask the wavegen for an endless
    /// pulse train.
    pub fn validate_recording(&self) -> Result<(), LabError> {
        self.validate()?;
        if self.acquisitions == 0 {
            return Err(LabError::InvalidConfig(
                "a recording needs at least one acquisition".into(),
            ));
        }
        Ok(())
    }
}

/// Trigger position for a pre-roll of `index` samples. The instrument places
/// the trigger in the middle of the buffer at position 0, so the result
/// shifts it towards the start. Approximate to within one sample.
pub fn trigger_position_for_index(index: usize, dt: f64, window_time_s: f64) -> f64 {
    0.5 * window_time_s - index as f64 * dt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_2000_sample_windows() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.window_len(), 2000);
        assert_eq!(config.enabled_channels(), vec![0, 1]);
        assert!((config.nominal_run_time_s() - 1.0).abs() < 1e-12);
        assert!((config.recorded_time_s() - 0.02).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_too_small_window_and_missing_channels() {
        let mut config = AcquisitionConfig {
            window_time_s: 1e-6,
            ..AcquisitionConfig::default()
        };
        assert!(matches!(config.validate(), Err(LabError::InvalidConfig(_))));

        config.window_time_s = 200e-6;
        for ch in &mut config.channels {
            ch.enabled = false;
        }
        assert!(matches!(config.validate(), Err(LabError::InvalidConfig(_))));
    }

    #[test]
    fn timestamp_logger_uses_minimum_buffer() {
        let config = AcquisitionConfig::timestamp_logger();
        assert_eq!(config.window_len(), MIN_WINDOW_SAMPLES);
        assert!(config.pulse.is_none());
        config.validate().unwrap();
        assert!(config.validate_recording().is_err());
    }

    #[test]
    fn recording_needs_at_least_one_window() {
        let mut config = AcquisitionConfig {
            acquisitions: 0,
            ..AcquisitionConfig::default()
        };
        config.validate().unwrap();
        assert!(matches!(
            config.validate_recording(),
            Err(LabError::InvalidConfig(_))
        ));
        config.acquisitions = 1;
        config.validate_recording().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AcquisitionConfig =
            serde_json::from_str(r#"{"acquisitions": 10, "trigger": {"slope": "fall"}}"#).unwrap();
        assert_eq!(config.acquisitions, 10);
        assert_eq!(config.trigger.slope, TriggerSlope::Fall);
        assert_eq!(config.trigger.level_v, 1.0);
        assert_eq!(config.sample_rate_hz, 10e6);
    }

    #[test]
    fn pretrigger_shifts_from_centre() {
        let pos = trigger_position_for_index(10, 1e-7, 200e-6);
        assert!((pos - (100e-6 - 1e-6)).abs() < 1e-12);
        let config = AcquisitionConfig::default();
        assert!(config.trigger_position_s().is_none());
    }

    #[test]
    fn pulse_tag_has_no_underscores_or_dots() {
        let tag = PulseConfig::default().filename_tag(100);
        assert!(!tag.contains('_'));
        assert!(!tag.contains('.'));
        assert!(tag.starts_with("100x"));
    }
}
