use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::config::AcquisitionConfig;
use crate::drivers::{AcquisitionSession, Instrument, LabError};
use crate::types::{InstrumentStatus, SampleLoss};

/// Shared stop flag. Cloned into the Ctrl+C handler and polled by the loops.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum AcquisitionState {
    Idle,
    Armed,
    Filling,
    Done,
    Finished,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionReport {
    pub windows: usize,
    pub interrupted: bool,
    /// Window that never saw a trigger within the wait timeout. The windows
    /// before it are complete.
    pub timed_out: Option<usize>,
    pub loss: SampleLoss,
    pub elapsed: Duration,
}

/// Repeated-trigger acquisition: one window per trigger, `N` windows per run.
pub struct WindowedAcquisition {
    state: AcquisitionState,
    trigger_timeout: Option<Duration>,
    wavegen_channel: Option<usize>,
}

impl WindowedAcquisition {
    /// `trigger_timeout_s` of `None` waits for each trigger indefinitely.
    pub fn new(trigger_timeout_s: Option<f64>) -> Self {
        Self {
            state: AcquisitionState::Idle,
            trigger_timeout: trigger_timeout_s.map(Duration::from_secs_f64),
            wavegen_channel: None,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    fn transition(&mut self, next: AcquisitionState) {
        if self.state != next {
            trace!("acquisition {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Idle -> Armed. Programs pulse, inputs and trigger, caches the voltage
    /// scales in the session, then starts the scope and the pulse train.
    pub fn configure<I: Instrument>(
        &mut self,
        instrument: &mut I,
        config: &AcquisitionConfig,
        session: &mut AcquisitionSession,
    ) -> Result<(), LabError> {
        if self.state != AcquisitionState::Idle {
            return Err(LabError::InvalidConfig(format!(
                "cannot configure acquisition in state {:?}",
                self.state
            )));
        }
        let caps = instrument.capabilities()?;
        debug!("scope capabilities: {caps:?}");
        let window_len = session.window_len();
        if window_len < caps.buffer_size_min || window_len > caps.buffer_size_max {
            warn!(
                "window of {} samples is outside the instrument buffer range {}..={}",
                window_len, caps.buffer_size_min, caps.buffer_size_max
            );
        }

        if let Some(pulse) = &config.pulse {
            instrument.configure_wavegen(pulse, config.acquisitions)?;
            self.wavegen_channel = Some(pulse.channel);
        }
        instrument.configure_analog_in(config)?;
        instrument.configure_trigger(&config.trigger, config.trigger_position_s())?;

        for &ch in config.enabled_channels().iter() {
            let scale = instrument.voltage_scale(ch)?;
            session.cache_scale(ch, scale)?;
        }
        let params = instrument.scope_params()?;
        info!("scope settings: {params:?}");
        session.store_scope_params(params);

        instrument.start_acquisition()?;
        if let Some(ch) = self.wavegen_channel {
            instrument.start_wavegen(ch)?;
        }
        info!(
            "armed: {} windows of {} samples at {:.3e} Hz",
            session.acquisitions(),
            window_len,
            session.sample_rate_hz()
        );
        self.transition(AcquisitionState::Armed);
        Ok(())
    }

    /// Fills the session window by window until it is full or `cancel` is set.
    pub fn run<I: Instrument>(
        &mut self,
        instrument: &mut I,
        session: &mut AcquisitionSession,
        cancel: &CancelToken,
    ) -> Result<AcquisitionReport, LabError> {
        if self.state != AcquisitionState::Armed {
            return Err(LabError::InvalidConfig(format!(
                "acquisition must be armed before running, state is {:?}",
                self.state
            )));
        }
        let started = Instant::now();
        let channels = session.channels().to_vec();
        let mut interrupted = false;
        let mut timed_out = None;

        'windows: while !session.is_complete() {
            let index = session.filled_windows();
            self.transition(AcquisitionState::Armed);
            let armed_at = Instant::now();
            loop {
                if cancel.is_cancelled() {
                    interrupted = true;
                    break 'windows;
                }
                match instrument.status()? {
                    InstrumentStatus::Done => break,
                    InstrumentStatus::Triggered => self.transition(AcquisitionState::Filling),
                    _ => {}
                }
                if let Some(timeout) = self.trigger_timeout {
                    if armed_at.elapsed() > timeout {
                        warn!(
                            "no trigger within {:.3} s for window {index}, stopping",
                            timeout.as_secs_f64()
                        );
                        timed_out = Some(index);
                        break 'windows;
                    }
                }
            }
            self.transition(AcquisitionState::Done);

            for &ch in &channels {
                let slot = session.window_slot_mut(ch, index)?;
                instrument.read_window(ch, slot)?;
            }
            let loss = instrument.sample_loss()?;
            if !loss.is_clean() {
                debug!(
                    "window {index}: {} lost, {} corrupted samples",
                    loss.lost, loss.corrupted
                );
            }
            session.loss += loss;
            session.commit_window();
        }

        if interrupted {
            warn!(
                "acquisition interrupted after {} of {} windows",
                session.filled_windows(),
                session.acquisitions()
            );
        }
        Ok(AcquisitionReport {
            windows: session.filled_windows(),
            interrupted,
            timed_out,
            loss: session.loss,
            elapsed: started.elapsed(),
        })
    }

    /// Stops the pulse train and the scope and closes the device. Safe to call
    /// more than once; only the first call reaches the instrument.
    pub fn finish<I: Instrument>(&mut self, instrument: &mut I) -> Result<(), LabError> {
        if self.state == AcquisitionState::Finished {
            return Ok(());
        }
        self.transition(AcquisitionState::Finished);
        if let Some(ch) = self.wavegen_channel {
            if let Err(err) = instrument.stop_wavegen(ch) {
                warn!("failed to stop wavegen channel {}: {err}", ch + 1);
            }
        }
        if let Err(err) = instrument.stop_acquisition() {
            warn!("failed to stop acquisition: {err}");
        }
        instrument.close()
    }
}

/// Runs a whole acquisition and always tears the device down, whichever way
/// the run ends.
pub fn record<I: Instrument>(
    instrument: &mut I,
    config: &AcquisitionConfig,
    cancel: &CancelToken,
) -> Result<(AcquisitionSession, AcquisitionReport), LabError> {
    let mut session = AcquisitionSession::new(config)?;
    let mut acquisition = WindowedAcquisition::new(config.trigger_wait_timeout_s);
    let outcome = acquisition
        .configure(instrument, config, &mut session)
        .and_then(|_| acquisition.run(instrument, &mut session, cancel));
    let closed = acquisition.finish(instrument);
    let report = outcome?;
    closed?;
    Ok((session, report))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::drivers::{SimulatedInstrument, SimulationProfile};

    fn small_config(acquisitions: usize) -> AcquisitionConfig {
        AcquisitionConfig {
            acquisitions,
            sample_rate_hz: 10e6,
            window_time_s: 20e-6,
            ..AcquisitionConfig::default()
        }
    }

    #[test]
    fn records_all_windows_and_closes_once() {
        let mut sim = SimulatedInstrument::default();
        let config = small_config(5);
        let (session, report) = record(&mut sim, &config, &CancelToken::new()).unwrap();
        assert_eq!(report.windows, 5);
        assert!(!report.interrupted);
        assert_eq!(session.raw(0).unwrap().len(), 5 * 200);
        assert_eq!(sim.close_calls(), 1);
        assert!(!sim.is_acquiring());
        assert!(!sim.is_wavegen_running());
        // scales survive the close
        assert!(session.volts(1).is_ok());
    }

    #[test]
    fn every_window_carries_its_own_pulse() {
        let mut sim = SimulatedInstrument::default();
        let (session, _) = record(&mut sim, &small_config(3), &CancelToken::new()).unwrap();
        let volts = session.volts(0).unwrap();
        for w in 0..3 {
            // trigger sits in the middle of each 200-sample window
            assert!(volts[w * 200 + 100] > 4.0, "window {w}");
            assert!(volts[w * 200 + 20].abs() < 0.1, "window {w}");
        }
    }

    #[test]
    fn loss_is_accumulated_without_stopping() {
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            loss_per_window: SampleLoss { lost: 2, corrupted: 1 },
            ..SimulationProfile::default()
        });
        let (session, report) = record(&mut sim, &small_config(4), &CancelToken::new()).unwrap();
        assert_eq!(report.windows, 4);
        assert_eq!(report.loss, SampleLoss { lost: 8, corrupted: 4 });
        assert_eq!(session.loss, report.loss);
    }

    #[test]
    fn missing_trigger_times_out_and_still_closes() {
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            trigger_limit: Some(2),
            ..SimulationProfile::default()
        });
        let config = AcquisitionConfig {
            trigger_wait_timeout_s: Some(0.05),
            ..small_config(4)
        };
        let (_, report) = record(&mut sim, &config, &CancelToken::new()).unwrap();
        assert_eq!(report.timed_out, Some(2));
        assert!(!report.interrupted);
        assert_eq!(sim.close_calls(), 1);
    }

    #[test]
    fn timeout_keeps_completed_windows() {
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            trigger_limit: Some(2),
            ..SimulationProfile::default()
        });
        let config = AcquisitionConfig {
            trigger_wait_timeout_s: Some(0.05),
            ..small_config(4)
        };
        let (session, report) = record(&mut sim, &config, &CancelToken::new()).unwrap();
        assert_eq!(report.windows, 2);
        assert_eq!(session.filled_windows(), 2);
        assert_eq!(session.raw(0).unwrap().len(), 2 * 200);
        let volts = session.volts(0).unwrap();
        assert!(volts[200 + 100] > 4.0);
    }

    #[test]
    fn cancellation_keeps_completed_windows() {
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            trigger_limit: Some(3),
            ..SimulationProfile::default()
        });
        let config = small_config(10);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let (session, report) = record(&mut sim, &config, &cancel).unwrap();
        handle.join().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.windows, 3);
        assert_eq!(session.filled_len(), 3 * 200);
        assert_eq!(sim.close_calls(), 1);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut sim = SimulatedInstrument::default();
        let config = small_config(1);
        let mut session = AcquisitionSession::new(&config).unwrap();
        let mut acquisition = WindowedAcquisition::new(None);
        acquisition.configure(&mut sim, &config, &mut session).unwrap();
        assert_eq!(acquisition.state(), AcquisitionState::Armed);
        acquisition.finish(&mut sim).unwrap();
        acquisition.finish(&mut sim).unwrap();
        assert_eq!(acquisition.state(), AcquisitionState::Finished);
        assert_eq!(sim.close_calls(), 1);
    }

    #[test]
    fn run_requires_configuration() {
        let mut sim = SimulatedInstrument::default();
        let mut session = AcquisitionSession::new(&small_config(1)).unwrap();
        let mut acquisition = WindowedAcquisition::new(None);
        assert!(acquisition
            .run(&mut sim, &mut session, &CancelToken::new())
            .is_err());
    }
}
