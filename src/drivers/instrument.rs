use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{AcquisitionConfig, PulseConfig, TriggerConfig};
use crate::drivers::{LabError, VoltageScale};
use crate::types::{
    InstrumentStatus, SampleLoss, ScopeCapabilities, ScopeParams, Span, TriggerTime,
};

/// Boundary to the oscilloscope / waveform generator.
///
/// Implementations own exactly one device handle. Callers configure the
/// wavegen and the analog input, start the acquisition, then poll
/// [`status`](Instrument::status) and copy each finished window out with
/// [`read_window`](Instrument::read_window). The instrument re-arms itself after
/// every read-out.
pub trait Instrument {
    fn channel_count(&self) -> usize;

    fn configure_wavegen(&mut self, pulse: &PulseConfig, repeat: usize) -> Result<(), LabError>;
    fn start_wavegen(&mut self, channel: usize) -> Result<(), LabError>;
    fn stop_wavegen(&mut self, channel: usize) -> Result<(), LabError>;

    /// Sample rate, buffer size and per-channel enable/range/offset.
    fn configure_analog_in(&mut self, config: &AcquisitionConfig) -> Result<(), LabError>;
    fn configure_trigger(
        &mut self,
        trigger: &TriggerConfig,
        position_s: Option<f64>,
    ) -> Result<(), LabError>;
    fn start_acquisition(&mut self) -> Result<(), LabError>;
    fn stop_acquisition(&mut self) -> Result<(), LabError>;

    fn status(&mut self) -> Result<InstrumentStatus, LabError>;
    /// Copies the last finished window of `channel` into `dest`.
    fn read_window(&mut self, channel: usize, dest: &mut [i16]) -> Result<(), LabError>;
    fn sample_loss(&mut self) -> Result<SampleLoss, LabError>;
    fn trigger_time(&mut self) -> Result<TriggerTime, LabError>;

    /// Only meaningful while the device is open and the channel enabled.
    fn voltage_scale(&mut self, channel: usize) -> Result<VoltageScale, LabError>;
    fn scope_params(&mut self) -> Result<ScopeParams, LabError>;
    fn capabilities(&mut self) -> Result<ScopeCapabilities, LabError>;

    fn close(&mut self) -> Result<(), LabError>;
}

/// Parameters of the synthetic pulse-echo signal.
#[derive(Clone, Debug)]
pub struct SimulationProfile {
    pub seed: u64,
    /// Status polls reported as `Armed` before each trigger.
    pub armed_polls: usize,
    /// Status polls reported as `Triggered` while the window fills.
    pub filling_polls: usize,
    /// Stop triggering after this many windows.
    pub trigger_limit: Option<usize>,
    pub loss_per_window: SampleLoss,
    pub echo_delays_s: Vec<f64>,
    pub echo_amplitude_v: f64,
    pub echo_frequency_hz: f64,
    pub noise_v: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            seed: 7,
            armed_polls: 3,
            filling_polls: 2,
            trigger_limit: None,
            loss_per_window: SampleLoss::default(),
            echo_delays_s: vec![40e-6, 80e-6],
            echo_amplitude_v: 0.4,
            echo_frequency_hz: 1e6,
            noise_v: 0.005,
        }
    }
}

/// In-memory instrument useful for tests and dry runs without hardware.
///
/// Channel 0 sees the excitation pulse at the trigger point, channel 1 sees
/// decaying echoes after it.
pub struct SimulatedInstrument {
    profile: SimulationProfile,
    rng: StdRng,
    channels: usize,
    scales: Vec<VoltageScale>,
    enabled: Vec<bool>,
    sample_rate_hz: f64,
    window_len: usize,
    pulse: Option<PulseConfig>,
    trigger: TriggerConfig,
    trigger_position_s: Option<f64>,
    acquiring: bool,
    wavegen_running: bool,
    polls: usize,
    window_ready: bool,
    windows_emitted: usize,
    window: Vec<Vec<i16>>,
    close_calls: usize,
}

impl SimulatedInstrument {
    pub fn new(profile: SimulationProfile) -> Self {
        let rng = StdRng::seed_from_u64(profile.seed);
        Self {
            profile,
            rng,
            channels: 2,
            scales: vec![VoltageScale::new(5.0, 0.0); 2],
            enabled: vec![false; 2],
            sample_rate_hz: 1e6,
            window_len: 16,
            pulse: None,
            trigger: TriggerConfig::default(),
            trigger_position_s: None,
            acquiring: false,
            wavegen_running: false,
            polls: 0,
            window_ready: false,
            windows_emitted: 0,
            window: Vec::new(),
            close_calls: 0,
        }
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn windows_emitted(&self) -> usize {
        self.windows_emitted
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn is_wavegen_running(&self) -> bool {
        self.wavegen_running
    }

    fn ensure_open(&self, context: &str) -> Result<(), LabError> {
        if self.close_calls > 0 {
            return Err(LabError::Instrument {
                context: context.to_string(),
                message: "device is closed".into(),
            });
        }
        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<(), LabError> {
        if channel >= self.channels {
            return Err(LabError::ChannelOutOfRange {
                channel,
                available: self.channels,
            });
        }
        Ok(())
    }

    fn trigger_index(&self) -> usize {
        let dt = 1.0 / self.sample_rate_hz;
        let window_time = self.window_len as f64 * dt;
        // position is measured from the window centre towards the start
        let position = self.trigger_position_s.unwrap_or(0.0);
        let index = ((0.5 * window_time - position) / dt).round();
        (index.max(0.0) as usize).min(self.window_len.saturating_sub(1))
    }

    fn synthesize_window(&mut self) {
        let dt = 1.0 / self.sample_rate_hz;
        let trigger_at = self.trigger_index();
        let (amplitude, width_s) = self
            .pulse
            .as_ref()
            .map(|p| (p.amplitude_v, p.width_s))
            .unwrap_or((self.trigger.level_v * 2.0, 1e-6));
        let width = ((width_s / dt).round() as usize).max(1);
        let mut out = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            let scale = self.scales[ch];
            if !self.enabled[ch] {
                out.push(vec![scale.to_raw(0.0); self.window_len]);
                continue;
            }
            let mut samples = Vec::with_capacity(self.window_len);
            for i in 0..self.window_len {
                let mut v = 0.0;
                if ch == 0 {
                    if i >= trigger_at && i < trigger_at + width {
                        v += amplitude;
                    }
                } else if i >= trigger_at {
                    let t = (i - trigger_at) as f64 * dt;
                    for &delay in &self.profile.echo_delays_s {
                        if t >= delay {
                            let tau = t - delay;
                            v += self.profile.echo_amplitude_v
                                * (-tau * self.profile.echo_frequency_hz / 3.0).exp()
                                * (2.0 * PI * self.profile.echo_frequency_hz * tau).sin();
                        }
                    }
                }
                if self.profile.noise_v > 0.0 {
                    v += self
                        .rng
                        .gen_range(-self.profile.noise_v..self.profile.noise_v);
                }
                samples.push(scale.to_raw(v));
            }
            out.push(samples);
        }
        self.window = out;
    }
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

impl Instrument for SimulatedInstrument {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn configure_wavegen(&mut self, pulse: &PulseConfig, _repeat: usize) -> Result<(), LabError> {
        self.ensure_open("configure_wavegen")?;
        self.pulse = Some(pulse.clone());
        Ok(())
    }

    fn start_wavegen(&mut self, _channel: usize) -> Result<(), LabError> {
        self.ensure_open("start_wavegen")?;
        self.wavegen_running = true;
        Ok(())
    }

    fn stop_wavegen(&mut self, _channel: usize) -> Result<(), LabError> {
        self.wavegen_running = false;
        Ok(())
    }

    fn configure_analog_in(&mut self, config: &AcquisitionConfig) -> Result<(), LabError> {
        self.ensure_open("configure_analog_in")?;
        if config.channels.len() > self.channels {
            return Err(LabError::ChannelOutOfRange {
                channel: config.channels.len() - 1,
                available: self.channels,
            });
        }
        self.sample_rate_hz = config.sample_rate_hz;
        self.window_len = config.window_len();
        for (idx, ch) in config.channels.iter().enumerate() {
            self.enabled[idx] = ch.enabled;
            self.scales[idx] = VoltageScale::new(ch.range_v, ch.offset_v);
        }
        Ok(())
    }

    fn configure_trigger(
        &mut self,
        trigger: &TriggerConfig,
        position_s: Option<f64>,
    ) -> Result<(), LabError> {
        self.ensure_open("configure_trigger")?;
        self.trigger = trigger.clone();
        self.trigger_position_s = position_s;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<(), LabError> {
        self.ensure_open("start_acquisition")?;
        self.acquiring = true;
        self.polls = 0;
        self.window_ready = false;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), LabError> {
        self.acquiring = false;
        Ok(())
    }

    fn status(&mut self) -> Result<InstrumentStatus, LabError> {
        self.ensure_open("status")?;
        if !self.acquiring {
            return Ok(InstrumentStatus::Ready);
        }
        if self.window_ready {
            // re-arm after the previous read-out
            self.window_ready = false;
            self.polls = 0;
        }
        if let Some(limit) = self.profile.trigger_limit {
            if self.windows_emitted >= limit {
                return Ok(InstrumentStatus::Armed);
            }
        }
        self.polls += 1;
        if self.polls <= self.profile.armed_polls {
            Ok(InstrumentStatus::Armed)
        } else if self.polls <= self.profile.armed_polls + self.profile.filling_polls {
            Ok(InstrumentStatus::Triggered)
        } else {
            self.synthesize_window();
            self.windows_emitted += 1;
            self.window_ready = true;
            Ok(InstrumentStatus::Done)
        }
    }

    fn read_window(&mut self, channel: usize, dest: &mut [i16]) -> Result<(), LabError> {
        self.ensure_open("read_window")?;
        self.check_channel(channel)?;
        let src = self.window.get(channel).ok_or_else(|| LabError::Instrument {
            context: "read_window".into(),
            message: "no finished window".into(),
        })?;
        if src.len() != dest.len() {
            return Err(LabError::BufferSize {
                expected: src.len(),
                actual: dest.len(),
            });
        }
        dest.copy_from_slice(src);
        Ok(())
    }

    fn sample_loss(&mut self) -> Result<SampleLoss, LabError> {
        Ok(self.profile.loss_per_window)
    }

    fn trigger_time(&mut self) -> Result<TriggerTime, LabError> {
        let tr = self
            .pulse
            .as_ref()
            .map(|p| p.repetition_s)
            .unwrap_or(0.01);
        let ticks_per_sec = 1000u32;
        let elapsed_ticks =
            (self.windows_emitted as f64 * tr * f64::from(ticks_per_sec)).round() as u64;
        Ok(TriggerTime {
            trig_utc_sec: 1_646_000_000 + (elapsed_ticks / u64::from(ticks_per_sec)) as u32,
            trig_ticks: (elapsed_ticks % u64::from(ticks_per_sec)) as u32,
            ticks_per_sec,
        })
    }

    fn voltage_scale(&mut self, channel: usize) -> Result<VoltageScale, LabError> {
        self.ensure_open("voltage_scale")?;
        self.check_channel(channel)?;
        Ok(self.scales[channel])
    }

    fn scope_params(&mut self) -> Result<ScopeParams, LabError> {
        self.ensure_open("scope_params")?;
        let mut params = ScopeParams {
            ch1_attenuation: 1.0,
            ch2_attenuation: 1.0,
            trigger_pos: self.trigger_position_s.unwrap_or(0.0),
            trigger_holdoff_time: self.trigger.holdoff_s,
            trigger_timeout: self.trigger.auto_timeout_s,
            ..ScopeParams::default()
        };
        for ch in 0..self.channels {
            params.set_scale(ch, self.scales[ch]);
        }
        Ok(params)
    }

    fn capabilities(&mut self) -> Result<ScopeCapabilities, LabError> {
        self.ensure_open("capabilities")?;
        Ok(ScopeCapabilities {
            voltage_range: Span { min: 5.0, max: 50.0, steps: 2.0 },
            voltage_offset: Span { min: -2.5, max: 2.5, steps: 1024.0 },
            trigger_position: Span { min: -0.1, max: 0.1, steps: 1e6 },
            trigger_holdoff: Span { min: 0.0, max: 10.0, steps: 1e6 },
            trigger_timeout: Span { min: 0.0, max: 10.0, steps: 1e6 },
            buffer_size_min: 16,
            buffer_size_max: 8192,
        })
    }

    fn close(&mut self) -> Result<(), LabError> {
        self.acquiring = false;
        self.wavegen_running = false;
        self.close_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> SimulatedInstrument {
        let mut sim = SimulatedInstrument::default();
        let config = AcquisitionConfig {
            sample_rate_hz: 10e6,
            window_time_s: 100e-6,
            ..AcquisitionConfig::default()
        };
        sim.configure_analog_in(&config).unwrap();
        sim.configure_wavegen(&PulseConfig::default(), 1).unwrap();
        sim.configure_trigger(&config.trigger, None).unwrap();
        sim.start_acquisition().unwrap();
        sim
    }

    #[test]
    fn status_cycles_through_armed_triggered_done() {
        let mut sim = configured();
        let seen: Vec<_> = (0..6).map(|_| sim.status().unwrap()).collect();
        assert_eq!(
            seen,
            vec![
                InstrumentStatus::Armed,
                InstrumentStatus::Armed,
                InstrumentStatus::Armed,
                InstrumentStatus::Triggered,
                InstrumentStatus::Triggered,
                InstrumentStatus::Done,
            ]
        );
        // re-armed after read-out
        assert_eq!(sim.status().unwrap(), InstrumentStatus::Armed);
    }

    #[test]
    fn pulse_lands_at_window_centre() {
        let mut sim = configured();
        while sim.status().unwrap() != InstrumentStatus::Done {}
        let mut buf = vec![0i16; 1000];
        sim.read_window(0, &mut buf).unwrap();
        let scale = sim.voltage_scale(0).unwrap();
        assert!(scale.to_volts(buf[500]) > 4.0);
        assert!(scale.to_volts(buf[100]).abs() < 0.1);
    }

    #[test]
    fn read_window_checks_length_and_channel() {
        let mut sim = configured();
        while sim.status().unwrap() != InstrumentStatus::Done {}
        let mut short = vec![0i16; 10];
        assert!(matches!(
            sim.read_window(0, &mut short),
            Err(LabError::BufferSize { .. })
        ));
        let mut buf = vec![0i16; 1000];
        assert!(matches!(
            sim.read_window(5, &mut buf),
            Err(LabError::ChannelOutOfRange { .. })
        ));
    }

    #[test]
    fn closed_device_refuses_queries() {
        let mut sim = configured();
        sim.close().unwrap();
        assert!(sim.voltage_scale(0).is_err());
        assert!(sim.status().is_err());
        assert_eq!(sim.close_calls(), 1);
    }
}
