use crate::config::{AcquisitionConfig, PulseConfig};
use crate::drivers::{convert, LabError, VoltageScale};
use crate::types::{SampleLoss, ScopeParams};

/// Pre-sized storage for one run of `N` windows.
///
/// Every enabled channel owns a flat buffer of `N × window_len` raw samples.
/// Windows are written strictly in order; only the first
/// [`filled_windows`](Self::filled_windows) of them hold valid data.
#[derive(Clone, Debug)]
pub struct AcquisitionSession {
    pulse: Option<PulseConfig>,
    sample_rate_hz: f64,
    window_len: usize,
    acquisitions: usize,
    channels: Vec<usize>,
    scales: Vec<Option<VoltageScale>>,
    raw: Vec<Vec<i16>>,
    filled_windows: usize,
    scope_params: Option<ScopeParams>,
    pub loss: SampleLoss,
}

impl AcquisitionSession {
    pub fn new(config: &AcquisitionConfig) -> Result<Self, LabError> {
        config.validate_recording()?;
        let channels = config.enabled_channels();
        let window_len = config.window_len();
        let total = config
            .acquisitions
            .checked_mul(window_len)
            .ok_or_else(|| LabError::InvalidConfig("session buffer size overflows".into()))?;
        // fixed overrides are known up front; the rest is filled in once the
        // instrument is configured
        let scales = channels
            .iter()
            .map(|&ch| config.channels[ch].scale_override)
            .collect();
        Ok(Self {
            pulse: config.pulse.clone(),
            sample_rate_hz: config.sample_rate_hz,
            window_len,
            acquisitions: config.acquisitions,
            raw: vec![vec![0; total]; channels.len()],
            channels,
            scales,
            filled_windows: 0,
            scope_params: None,
            loss: SampleLoss::default(),
        })
    }

    pub fn pulse(&self) -> Option<&PulseConfig> {
        self.pulse.as_ref()
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    /// Instrument channel indices, in storage order.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn filled_windows(&self) -> usize {
        self.filled_windows
    }

    pub fn is_complete(&self) -> bool {
        self.filled_windows == self.acquisitions
    }

    pub fn capacity_per_channel(&self) -> usize {
        self.acquisitions * self.window_len
    }

    pub fn filled_len(&self) -> usize {
        self.filled_windows * self.window_len
    }

    fn slot(&self, channel: usize) -> Result<usize, LabError> {
        self.channels
            .iter()
            .position(|&c| c == channel)
            .ok_or(LabError::ChannelOutOfRange {
                channel,
                available: self.channels.len(),
            })
    }

    /// Cached scale for an instrument channel, if already known.
    pub fn scale(&self, channel: usize) -> Option<VoltageScale> {
        self.slot(channel).ok().and_then(|s| self.scales[s])
    }

    /// Stores the scale read back from the instrument. A fixed override set in
    /// the configuration wins.
    pub fn cache_scale(&mut self, channel: usize, scale: VoltageScale) -> Result<(), LabError> {
        let slot = self.slot(channel)?;
        if self.scales[slot].is_none() {
            self.scales[slot] = Some(scale);
        }
        Ok(())
    }

    /// Scope settings read back at configuration time, with the cached
    /// scales written over the instrument's own range and offset.
    pub fn scope_params(&self) -> Option<&ScopeParams> {
        self.scope_params.as_ref()
    }

    /// Channels that are not recorded get a NaN range and offset, so a saved
    /// `_vconv.csv` tells which scope channels the data columns belong to.
    pub fn store_scope_params(&mut self, mut params: ScopeParams) {
        for ch in 0..2 {
            let scale = self
                .slot(ch)
                .ok()
                .and_then(|slot| self.scales[slot])
                .unwrap_or(VoltageScale::new(f64::NAN, f64::NAN));
            params.set_scale(ch, scale);
        }
        self.scope_params = Some(params);
    }

    /// Slice for `window_index` of `channel`, at offset `window_index × window_len`.
    pub fn window_slot_mut(
        &mut self,
        channel: usize,
        window_index: usize,
    ) -> Result<&mut [i16], LabError> {
        if window_index >= self.acquisitions {
            return Err(LabError::BufferSize {
                expected: self.acquisitions,
                actual: window_index + 1,
            });
        }
        let slot = self.slot(channel)?;
        let start = window_index * self.window_len;
        Ok(&mut self.raw[slot][start..start + self.window_len])
    }

    pub fn commit_window(&mut self) {
        if self.filled_windows < self.acquisitions {
            self.filled_windows += 1;
        }
    }

    /// Raw samples of the filled windows.
    pub fn raw(&self, channel: usize) -> Result<&[i16], LabError> {
        let slot = self.slot(channel)?;
        Ok(&self.raw[slot][..self.filled_len()])
    }

    /// Pseudo-time axis of the filled part, TR dead time not included.
    pub fn time_axis(&self) -> Vec<f64> {
        let dt = self.sample_period();
        (0..self.filled_len()).map(|i| i as f64 * dt).collect()
    }

    pub fn volts(&self, channel: usize) -> Result<Vec<f64>, LabError> {
        let scale = self.scale(channel).ok_or_else(|| LabError::Instrument {
            context: "voltage conversion".into(),
            message: format!("no voltage scale cached for channel {}", channel + 1),
        })?;
        Ok(convert(self.raw(channel)?, scale))
    }

    /// Lost and corrupted samples as a percentage of the filled samples.
    pub fn loss_percentages(&self) -> (f64, f64) {
        let total = (self.filled_len() * self.channels.len()) as f64;
        if total == 0.0 {
            return (0.0, 0.0);
        }
        (
            100.0 * self.loss.lost as f64 / total,
            100.0 * self.loss.corrupted as f64 / total,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    fn config(acquisitions: usize, window_len: usize) -> AcquisitionConfig {
        AcquisitionConfig {
            acquisitions,
            sample_rate_hz: 1e6,
            window_time_s: window_len as f64 / 1e6,
            ..AcquisitionConfig::default()
        }
    }

    #[test]
    fn buffer_is_sized_for_all_windows() {
        let session = AcquisitionSession::new(&config(10, 16384)).unwrap();
        assert_eq!(session.capacity_per_channel(), 163_840);
        assert_eq!(session.channels(), &[0, 1]);
        assert_eq!(session.filled_len(), 0);
    }

    #[test]
    fn zero_windows_is_rejected() {
        assert!(matches!(
            AcquisitionSession::new(&config(0, 16)),
            Err(LabError::InvalidConfig(_))
        ));
    }

    #[test]
    fn windows_land_at_their_offset() {
        let mut session = AcquisitionSession::new(&config(3, 16)).unwrap();
        for w in 0..3 {
            let slot = session.window_slot_mut(1, w).unwrap();
            slot.fill(w as i16 + 1);
            session.commit_window();
        }
        let raw = session.raw(1).unwrap();
        assert_eq!(raw.len(), 48);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[16], 2);
        assert_eq!(raw[47], 3);
        assert!(session.is_complete());
        assert!(session.window_slot_mut(0, 3).is_err());
    }

    #[test]
    fn override_beats_instrument_scale() {
        let mut cfg = config(1, 16);
        cfg.channels[0] = ChannelConfig {
            scale_override: Some(VoltageScale::new(5.538410, 0.000291)),
            ..ChannelConfig::default()
        };
        let mut session = AcquisitionSession::new(&cfg).unwrap();
        session.cache_scale(0, VoltageScale::new(5.0, 0.0)).unwrap();
        session.cache_scale(1, VoltageScale::new(5.0, 0.0)).unwrap();
        assert_eq!(session.scale(0), Some(VoltageScale::new(5.538410, 0.000291)));
        assert_eq!(session.scale(1), Some(VoltageScale::new(5.0, 0.0)));

        session.store_scope_params(ScopeParams {
            ch1_v_range: 5.0,
            ch1_v_offset: 0.0,
            trigger_pos: 1e-4,
            ..ScopeParams::default()
        });
        let params = session.scope_params().unwrap();
        assert_eq!(params.ch1_v_range, 5.538410);
        assert_eq!(params.ch1_v_offset, 0.000291);
        assert_eq!(params.ch2_v_range, 5.0);
        assert_eq!(params.trigger_pos, 1e-4);
    }

    #[test]
    fn unrecorded_channel_is_blank_in_scope_params() {
        let mut cfg = config(1, 16);
        cfg.channels[0].enabled = false;
        let mut session = AcquisitionSession::new(&cfg).unwrap();
        session.cache_scale(1, VoltageScale::new(25.0, 0.0)).unwrap();
        let mut params = ScopeParams::default();
        params.set_scale(0, VoltageScale::new(5.0, 0.0));
        params.set_scale(1, VoltageScale::new(25.0, 0.0));
        session.store_scope_params(params);
        let stored = session.scope_params().unwrap();
        assert!(stored.scale(0).is_none());
        assert_eq!(stored.scale(1), Some(VoltageScale::new(25.0, 0.0)));
    }

    #[test]
    fn conversion_uses_cached_scale_and_filled_part_only() {
        let mut session = AcquisitionSession::new(&config(4, 16)).unwrap();
        assert!(session.volts(0).is_err());
        session.cache_scale(0, VoltageScale::new(5.0, 0.0)).unwrap();
        session.window_slot_mut(0, 0).unwrap().fill(16384);
        session.commit_window();
        let volts = session.volts(0).unwrap();
        assert_eq!(volts.len(), 16);
        assert!(volts.iter().all(|v| (v - 1.25).abs() < 1e-12));
        let t = session.time_axis();
        assert!((t[15] - 15e-6).abs() < 1e-15);
    }

    #[test]
    fn loss_percentage_over_filled_samples() {
        let mut session = AcquisitionSession::new(&config(2, 50)).unwrap();
        session.commit_window();
        session.loss = SampleLoss { lost: 10, corrupted: 1 };
        let (lost, corrupted) = session.loss_percentages();
        assert!((lost - 10.0).abs() < 1e-12);
        assert!((corrupted - 1.0).abs() < 1e-12);
    }
}
