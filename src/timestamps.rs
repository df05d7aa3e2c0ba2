use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, TimeZone};
use log::{info, warn};

use crate::config::AcquisitionConfig;
use crate::drivers::{CancelToken, Instrument, LabError};
use crate::recorder::TimestampRecorder;
use crate::types::{InstrumentStatus, TriggerTime};

#[derive(Clone, Debug, PartialEq)]
pub struct TimestampReport {
    pub triggers: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl TimestampReport {
    /// Wall-clock time per trigger, a rough TR estimate.
    pub fn rough_tr_s(&self) -> Option<f64> {
        (self.triggers > 0).then(|| self.elapsed.as_secs_f64() / self.triggers as f64)
    }
}

/// Logs the instrument time of every trigger until cancelled or `limit`
/// triggers have been seen. The device is closed on every exit path.
pub fn log_triggers<I: Instrument>(
    instrument: &mut I,
    config: &AcquisitionConfig,
    recorder: &mut TimestampRecorder,
    cancel: &CancelToken,
    limit: Option<usize>,
) -> Result<TimestampReport, LabError> {
    let outcome = poll_triggers(instrument, config, recorder, cancel, limit);
    if let Err(err) = instrument.stop_acquisition() {
        warn!("failed to stop acquisition: {err}");
    }
    let closed = instrument.close();
    let report = outcome?;
    closed?;
    info!(
        "{} triggers in {:.3} s (rough TR {:?} s)",
        report.triggers,
        report.elapsed.as_secs_f64(),
        report.rough_tr_s()
    );
    Ok(report)
}

fn poll_triggers<I: Instrument>(
    instrument: &mut I,
    config: &AcquisitionConfig,
    recorder: &mut TimestampRecorder,
    cancel: &CancelToken,
    limit: Option<usize>,
) -> Result<TimestampReport, LabError> {
    config.validate()?;
    instrument.configure_analog_in(config)?;
    instrument.configure_trigger(&config.trigger, config.trigger_position_s())?;
    info!("scope settings: {:?}", instrument.scope_params()?);
    instrument.start_acquisition()?;

    let started = Instant::now();
    let mut interrupted = false;
    loop {
        if limit.is_some_and(|n| recorder.rows() >= n) {
            break;
        }
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        if instrument.status()? == InstrumentStatus::Done {
            let time = instrument.trigger_time()?;
            recorder.write_record(&time)?;
        }
    }
    Ok(TimestampReport {
        triggers: recorder.rows(),
        elapsed: started.elapsed(),
        interrupted,
    })
}

/// Reference times in whole microseconds since the Unix epoch, one per row
/// in the first column.
pub fn load_reference_us(path: &Path) -> Result<Vec<i64>, LabError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut out = Vec::new();
    for (n, record) in rdr.records().enumerate() {
        let record = record?;
        let field = record.get(0).unwrap_or("");
        let value = field.parse::<i64>().map_err(|e| LabError::MalformedCsv {
            path: path.to_path_buf(),
            line: n as u64 + 1,
            message: format!("{field:?}: {e}"),
        })?;
        out.push(value);
    }
    Ok(out)
}

/// Trigger-to-trigger statistics of a timestamp log.
#[derive(Clone, Debug)]
pub struct TimingAnalysis {
    pub times_s: Vec<f64>,
    pub dt_s: Vec<f64>,
}

impl TimingAnalysis {
    pub fn new(triggers: &[TriggerTime]) -> Self {
        let times_s: Vec<f64> = triggers.iter().map(TriggerTime::seconds).collect();
        let dt_s = times_s.windows(2).map(|w| w[1] - w[0]).collect();
        Self { times_s, dt_s }
    }

    pub fn mean_dt(&self) -> Option<f64> {
        if self.dt_s.is_empty() {
            return None;
        }
        Some(self.dt_s.iter().sum::<f64>() / self.dt_s.len() as f64)
    }

    pub fn first_trigger(&self) -> Option<NaiveDateTime> {
        let t = *self.times_s.first()?;
        let secs = t.floor();
        let nanos = ((t - secs) * 1e9).round().min(999_999_999.0) as u32;
        Local
            .timestamp_opt(secs as i64, nanos)
            .single()
            .map(|dt| dt.naive_local())
    }

    /// Seconds from file creation (local time in the file name) to the first
    /// trigger.
    pub fn start_delay_s(&self, file_created: NaiveDateTime) -> Option<f64> {
        let first = self.first_trigger()?;
        let delta = first - file_created;
        Some(delta.num_microseconds()? as f64 / 1e6)
    }

    /// For every trigger, signed offset in seconds to the closest reference
    /// time.
    pub fn offsets_to_reference(&self, reference_us: &[i64]) -> Vec<f64> {
        if reference_us.is_empty() {
            return Vec::new();
        }
        let mut sorted = reference_us.to_vec();
        sorted.sort_unstable();
        self.times_s
            .iter()
            .map(|&t| {
                let t_us = (t * 1e6).round() as i64;
                let idx = sorted.partition_point(|&r| r < t_us);
                let candidates = [idx.checked_sub(1), Some(idx)];
                let nearest = candidates
                    .iter()
                    .flatten()
                    .filter_map(|&i| sorted.get(i))
                    .min_by_key(|&&r| (t_us - r).abs())
                    .copied()
                    .unwrap_or(t_us);
                (t_us - nearest) as f64 / 1e6
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{SimulatedInstrument, SimulationProfile};
    use chrono::TimeZone;

    fn at(secs: u32, ticks: u32) -> TriggerTime {
        TriggerTime {
            trig_utc_sec: secs,
            trig_ticks: ticks,
            ticks_per_sec: 1000,
        }
    }

    #[test]
    fn logger_stops_at_limit_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2022, 3, 1, 10, 20, 12).unwrap();
        let mut recorder = TimestampRecorder::create(dir.path(), "timestamps", started).unwrap();
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            armed_polls: 1,
            filling_polls: 0,
            ..SimulationProfile::default()
        });
        let report = log_triggers(
            &mut sim,
            &AcquisitionConfig::timestamp_logger(),
            &mut recorder,
            &CancelToken::new(),
            Some(5),
        )
        .unwrap();
        assert_eq!(report.triggers, 5);
        assert!(!report.interrupted);
        assert_eq!(sim.close_calls(), 1);
        let logged = crate::recorder::load_timestamps(recorder.path()).unwrap();
        assert_eq!(logged.len(), 5);
        let analysis = TimingAnalysis::new(&logged);
        assert!((analysis.mean_dt().unwrap() - 0.01).abs() < 1e-6);
    }

    #[test]
    fn cancelled_logger_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2022, 3, 1, 10, 20, 13).unwrap();
        let mut recorder = TimestampRecorder::create(dir.path(), "ts", started).unwrap();
        let mut sim = SimulatedInstrument::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = log_triggers(
            &mut sim,
            &AcquisitionConfig::timestamp_logger(),
            &mut recorder,
            &cancel,
            None,
        )
        .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.triggers, 0);
        assert_eq!(sim.close_calls(), 1);
    }

    #[test]
    fn intervals_and_mean() {
        let analysis = TimingAnalysis::new(&[at(100, 0), at(100, 10), at(100, 30)]);
        assert_eq!(analysis.dt_s.len(), 2);
        assert!((analysis.dt_s[0] - 0.01).abs() < 1e-9);
        assert!((analysis.mean_dt().unwrap() - 0.015).abs() < 1e-9);
        assert!(TimingAnalysis::new(&[at(1, 0)]).mean_dt().is_none());
    }

    #[test]
    fn delay_from_file_creation() {
        let created = Local.with_ymd_and_hms(2022, 3, 1, 10, 20, 12).unwrap();
        let first = created.timestamp() as u32 + 2;
        let analysis = TimingAnalysis::new(&[at(first, 500)]);
        let delay = analysis.start_delay_s(created.naive_local()).unwrap();
        assert!((delay - 2.5).abs() < 1e-6);
    }

    #[test]
    fn nearest_reference_offsets() {
        let analysis = TimingAnalysis::new(&[at(10, 0), at(11, 0)]);
        let offsets = analysis.offsets_to_reference(&[11_000_200, 9_999_900]);
        assert!((offsets[0] - 0.0001).abs() < 1e-9);
        assert!((offsets[1] + 0.0002).abs() < 1e-9);
        assert!(analysis.offsets_to_reference(&[]).is_empty());
    }
}
