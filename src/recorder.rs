use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use log::{info, warn};

use crate::drivers::{channel_label, AcquisitionSession, LabError, TimeSeriesFrame, VoltageScale};
use crate::types::{ScopeParams, TriggerTime};

/// Timestamp prefix of every output file.
pub const FILE_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Conversion constants measured on the lab's unit. Only a fallback for
/// recordings without a `_vconv.csv`; a recalibrated scope will differ.
pub const DEFAULT_SCALES: [VoltageScale; 2] = [
    VoltageScale {
        range: 5.538410,
        offset: 0.000291,
    },
    VoltageScale {
        range: 5.546847,
        offset: -0.000028,
    },
];

/// Underscores separate filename fields, so they cannot appear inside one.
pub fn validate_description(desc: &str) -> Result<(), LabError> {
    if desc.is_empty() || desc.contains('_') || desc.contains(['/', '\\']) {
        return Err(LabError::InvalidDescription(desc.to_string()));
    }
    Ok(())
}

fn refuse_existing(path: &Path) -> Result<(), LabError> {
    if path.exists() {
        return Err(LabError::OutputExists(path.to_path_buf()));
    }
    Ok(())
}

/// Data and metadata paths of one recording.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunFiles {
    pub data: PathBuf,
    pub vconv: PathBuf,
}

impl RunFiles {
    /// `{stamp}_{desc}[_{pulse}]_data.csv` plus the matching `_vconv.csv`.
    pub fn new(
        folder: &Path,
        desc: &str,
        pulse_tag: Option<&str>,
        started: DateTime<Local>,
    ) -> Result<Self, LabError> {
        validate_description(desc)?;
        let mut stem = format!("{}_{}", started.format(FILE_TIME_FORMAT), desc);
        if let Some(tag) = pulse_tag {
            stem.push('_');
            stem.push_str(&tag.replace('_', "-"));
        }
        Ok(Self {
            data: folder.join(format!("{stem}_data.csv")),
            vconv: folder.join(format!("{stem}_vconv.csv")),
        })
    }

    /// Creates the folder if needed and fails if either file already exists.
    pub fn prepare(&self) -> Result<(), LabError> {
        if let Some(parent) = self.data.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        refuse_existing(&self.data)?;
        refuse_existing(&self.vconv)
    }
}

/// Writes the filled windows as header-less `index,time,ch1[,ch2]` rows.
pub fn write_data_csv(path: &Path, session: &AcquisitionSession) -> Result<usize, LabError> {
    refuse_existing(path)?;
    let columns: Vec<&[i16]> = session
        .channels()
        .iter()
        .map(|&ch| session.raw(ch))
        .collect::<Result<_, _>>()?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(File::create(path)?));
    let time = session.time_axis();
    let mut record = Vec::with_capacity(2 + columns.len());
    for (i, t) in time.iter().enumerate() {
        record.clear();
        record.push(i.to_string());
        record.push(t.to_string());
        for column in &columns {
            record.push(column[i].to_string());
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    info!("wrote {} rows to {}", time.len(), path.display());
    Ok(time.len())
}

/// Two-line header/value file with the conversion parameters.
pub fn write_scope_params(path: &Path, params: &ScopeParams) -> Result<(), LabError> {
    refuse_existing(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.serialize(params)?;
    wtr.flush()?;
    Ok(())
}

pub fn load_scope_params(path: &Path) -> Result<ScopeParams, LabError> {
    let mut rdr = csv::Reader::from_path(path)?;
    match rdr.deserialize::<ScopeParams>().next() {
        Some(row) => Ok(row?),
        None => Err(LabError::MalformedCsv {
            path: path.to_path_buf(),
            line: 2,
            message: "no parameter row".into(),
        }),
    }
}

/// `{stamp}_{desc}[_{pulse}]_data.csv` -> `{stamp}_{desc}[_{pulse}]_vconv.csv`.
pub fn vconv_path_for(data_path: &Path) -> PathBuf {
    let name = data_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.rsplit_once('_').map(|(s, _)| s).unwrap_or(&name);
    data_path.with_file_name(format!("{stem}_vconv.csv"))
}

/// Second underscore-separated field of the file name.
pub fn description_of(path: &Path) -> Option<String> {
    let name = path.file_stem()?.to_string_lossy().into_owned();
    name.split('_').nth(1).map(str::to_string)
}

/// Local start time encoded in the file name prefix.
pub fn recording_time_of(path: &Path) -> Option<NaiveDateTime> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let stamp = name.split(['_', '.']).next()?;
    NaiveDateTime::parse_from_str(stamp, FILE_TIME_FORMAT).ok()
}

/// Raw counts as read back from a data CSV.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecording {
    pub index: Vec<u64>,
    pub time: Vec<f64>,
    pub channels: Vec<Vec<i16>>,
}

impl RawRecording {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Sample rate implied by the time column.
    pub fn sample_rate_hz(&self) -> Option<f64> {
        match self.time.as_slice() {
            [t0, t1, ..] if t1 > t0 => Some(1.0 / (t1 - t0)),
            _ => None,
        }
    }

    /// Scope channels of the data columns. `scales` is indexed by scope
    /// channel; a missing entry marks a channel that was not recorded. When
    /// more scales are known than columns exist, the columns are taken to
    /// start at CH1.
    pub fn scope_channels(&self, scales: &[Option<VoltageScale>]) -> Result<Vec<usize>, LabError> {
        let columns = self.channels.len();
        let known: Vec<usize> = scales
            .iter()
            .enumerate()
            .filter_map(|(ch, scale)| scale.as_ref().map(|_| ch))
            .collect();
        if known.len() == columns {
            return Ok(known);
        }
        if columns <= scales.len() && scales[..columns].iter().all(Option::is_some) {
            return Ok((0..columns).collect());
        }
        Err(LabError::ChannelMismatch {
            expected: columns,
            actual: known.len(),
        })
    }

    pub fn to_frame(&self, scales: &[Option<VoltageScale>]) -> Result<TimeSeriesFrame, LabError> {
        let channels = self.scope_channels(scales)?;
        let sample_rate_hz = self.sample_rate_hz().ok_or_else(|| {
            LabError::InvalidConfig("need two increasing time stamps to infer the sample rate".into())
        })?;
        let mut samples = Vec::with_capacity(channels.len());
        for (raw, &ch) in self.channels.iter().zip(&channels) {
            let scale = scales[ch].ok_or(LabError::ChannelOutOfRange {
                channel: ch,
                available: scales.len(),
            })?;
            samples.push(crate::drivers::convert(raw, scale));
        }
        Ok(TimeSeriesFrame {
            sample_rate_hz,
            channel_labels: channels.iter().copied().map(channel_label).collect(),
            samples,
        })
    }
}

/// Reads a 1- or 2-channel data CSV. The column count of the first row fixes
/// the layout for the whole file.
pub fn load_raw_csv(path: &Path) -> Result<RawRecording, LabError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut out = RawRecording {
        index: Vec::new(),
        time: Vec::new(),
        channels: Vec::new(),
    };
    for (n, record) in rdr.records().enumerate() {
        let record = record?;
        let line = n as u64 + 1;
        let malformed = |message: String| LabError::MalformedCsv {
            path: path.to_path_buf(),
            line,
            message,
        };
        if n == 0 {
            if !(3..=4).contains(&record.len()) {
                return Err(malformed(format!(
                    "expected 3 or 4 columns, found {}",
                    record.len()
                )));
            }
            out.channels = vec![Vec::new(); record.len() - 2];
        }
        let field = |k: usize| record.get(k).unwrap_or("");
        out.index
            .push(field(0).parse().map_err(|e| malformed(format!("index: {e}")))?);
        out.time
            .push(field(1).parse().map_err(|e| malformed(format!("time: {e}")))?);
        for (c, column) in out.channels.iter_mut().enumerate() {
            let text = field(2 + c);
            let value = text
                .parse::<i16>()
                .map_err(|e| malformed(format!("ch{} {text:?}: {e}", c + 1)))?;
            column.push(value);
        }
    }
    Ok(out)
}

/// Conversion scales for a recording, indexed by scope channel: the
/// companion `_vconv.csv` when it exists, the lab defaults otherwise.
pub fn scales_for(data_path: &Path) -> Result<Vec<Option<VoltageScale>>, LabError> {
    let vconv = vconv_path_for(data_path);
    match load_scope_params(&vconv) {
        Ok(params) => {
            let scales: Vec<Option<VoltageScale>> = (0..2).map(|ch| params.scale(ch)).collect();
            info!("using conversion parameters from {}: {scales:?}", vconv.display());
            Ok(scales)
        }
        Err(LabError::Csv(err)) if matches!(err.kind(), csv::ErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound) =>
        {
            warn!(
                "{} not found; using default conversion parameters, these may be approximate",
                vconv.display()
            );
            Ok(DEFAULT_SCALES.map(Some).to_vec())
        }
        Err(err) => Err(err),
    }
}

/// Appends trigger times to a header-less CSV, flushing every row so an
/// interrupted run keeps everything logged so far.
pub struct TimestampRecorder {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: usize,
}

impl TimestampRecorder {
    pub fn create(
        folder: &Path,
        desc: &str,
        started: DateTime<Local>,
    ) -> Result<Self, LabError> {
        validate_description(desc)?;
        fs::create_dir_all(folder)?;
        let path = folder.join(format!("{}_{}.csv", started.format(FILE_TIME_FORMAT), desc));
        refuse_existing(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        info!("recording trigger times to {}", path.display());
        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_record(&mut self, time: &TriggerTime) -> Result<(), LabError> {
        self.writer.serialize(time)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}

pub fn load_timestamps(path: &Path) -> Result<Vec<TriggerTime>, LabError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut out = Vec::new();
    for row in rdr.deserialize() {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::drivers::{record, CancelToken, SimulatedInstrument};

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2022, 3, 1, 10, 20, 12).unwrap()
    }

    #[test]
    fn description_rules() {
        assert!(validate_description("phantom1").is_ok());
        assert!(matches!(
            validate_description("bad_name"),
            Err(LabError::InvalidDescription(_))
        ));
        assert!(validate_description("").is_err());
    }

    #[test]
    fn run_file_names() {
        let files = RunFiles::new(Path::new("out"), "phantom", Some("100x1p00e-6s"), started())
            .unwrap();
        assert_eq!(
            files.data,
            Path::new("out/20220301-102012_phantom_100x1p00e-6s_data.csv")
        );
        assert_eq!(vconv_path_for(&files.data), files.vconv);
        assert_eq!(description_of(&files.data).as_deref(), Some("phantom"));
        let plain = RunFiles::new(Path::new("out"), "phantom", None, started()).unwrap();
        assert_eq!(
            plain.vconv,
            Path::new("out/20220301-102012_phantom_vconv.csv")
        );
        assert_eq!(
            recording_time_of(&plain.data),
            Some(started().naive_local())
        );
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let files = RunFiles::new(dir.path(), "x", None, started()).unwrap();
        files.prepare().unwrap();
        fs::write(&files.data, "").unwrap();
        assert!(matches!(files.prepare(), Err(LabError::OutputExists(_))));
    }

    fn filled_session(channels: usize) -> AcquisitionSession {
        let mut config = AcquisitionConfig {
            acquisitions: 2,
            sample_rate_hz: 1e6,
            window_time_s: 16e-6,
            ..AcquisitionConfig::default()
        };
        config.channels.truncate(channels);
        let mut session = AcquisitionSession::new(&config).unwrap();
        for w in 0..2 {
            for ch in 0..channels {
                let slot = session.window_slot_mut(ch, w).unwrap();
                for (i, v) in slot.iter_mut().enumerate() {
                    *v = (i as i16 - 8) * 1000 * (ch as i16 + 1);
                }
            }
            session.commit_window();
        }
        session
    }

    #[test]
    fn data_csv_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20220301-102012_two_data.csv");
        let session = filled_session(2);
        assert_eq!(write_data_csv(&path, &session).unwrap(), 32);
        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().next(), Some("0,0,-8000,-16000"));

        let loaded = load_raw_csv(&path).unwrap();
        assert_eq!(loaded.len(), 32);
        assert_eq!(loaded.channels.len(), 2);
        assert_eq!(loaded.channels[1].as_slice(), session.raw(1).unwrap());
        assert!((loaded.sample_rate_hz().unwrap() - 1e6).abs() < 1e-3);
        assert!(matches!(
            write_data_csv(&path, &session),
            Err(LabError::OutputExists(_))
        ));
    }

    #[test]
    fn single_channel_csv_has_three_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20220301-102012_one_data.csv");
        write_data_csv(&path, &filled_session(1)).unwrap();
        let loaded = load_raw_csv(&path).unwrap();
        assert_eq!(loaded.channels.len(), 1);
        let frame = loaded.to_frame(&DEFAULT_SCALES.map(Some)).unwrap();
        assert_eq!(frame.samples.len(), 1);
        assert_eq!(frame.channel_labels, vec!["CH1".to_string()]);
        assert_eq!(frame.len(), 32);
        assert!(loaded.to_frame(&[None, None]).is_err());
    }

    #[test]
    fn malformed_rows_name_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "0,0.0,12,13\n1,1e-6,x,14\n").unwrap();
        match load_raw_csv(&path) {
            Err(LabError::MalformedCsv { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scope_params_round_trip_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("20220301-102012_phantom_data.csv");
        assert_eq!(
            scales_for(&data).unwrap(),
            vec![Some(DEFAULT_SCALES[0]), Some(DEFAULT_SCALES[1])]
        );

        let mut params = ScopeParams::default();
        params.set_scale(0, VoltageScale::new(5.0, 0.01));
        params.set_scale(1, VoltageScale::new(25.0, -0.02));
        params.trigger_pos = 0.0;
        write_scope_params(&vconv_path_for(&data), &params).unwrap();
        let text = fs::read_to_string(vconv_path_for(&data)).unwrap();
        assert!(text.starts_with("ch1_v_range,ch2_v_range,ch1_v_offset,ch2_v_offset,"));
        assert_eq!(text.lines().count(), 2);
        assert_eq!(
            scales_for(&data).unwrap(),
            vec![
                Some(VoltageScale::new(5.0, 0.01)),
                Some(VoltageScale::new(25.0, -0.02))
            ]
        );
    }

    #[test]
    fn second_channel_only_reloads_with_its_own_scale() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AcquisitionConfig {
            acquisitions: 3,
            sample_rate_hz: 10e6,
            window_time_s: 20e-6,
            ..AcquisitionConfig::default()
        };
        config.channels[0].enabled = false;
        config.channels[0].range_v = 5.0;
        config.channels[1].range_v = 25.0;
        let mut sim = SimulatedInstrument::default();
        let (session, _) = record(&mut sim, &config, &CancelToken::new()).unwrap();
        let live = TimeSeriesFrame::from_session(&session).unwrap();
        assert_eq!(live.channel_labels, vec!["CH2".to_string()]);

        let files = RunFiles::new(dir.path(), "ch2only", None, started()).unwrap();
        files.prepare().unwrap();
        write_data_csv(&files.data, &session).unwrap();
        write_scope_params(&files.vconv, session.scope_params().unwrap()).unwrap();

        let scales = scales_for(&files.data).unwrap();
        assert_eq!(scales[0], None);
        assert_eq!(scales[1], Some(VoltageScale::new(25.0, 0.0)));
        let reloaded = load_raw_csv(&files.data).unwrap().to_frame(&scales).unwrap();
        assert_eq!(reloaded.channel_labels, live.channel_labels);
        assert_eq!(reloaded.samples[0], live.samples[0]);
    }

    #[test]
    fn timestamps_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = TimestampRecorder::create(dir.path(), "timestamps", started()).unwrap();
        let t = TriggerTime {
            trig_utc_sec: 1_646_148_012,
            trig_ticks: 500,
            ticks_per_sec: 1000,
        };
        rec.write_record(&t).unwrap();
        rec.write_record(&t).unwrap();
        assert_eq!(rec.rows(), 2);
        let path = rec.path().to_path_buf();
        drop(rec);
        assert_eq!(load_timestamps(&path).unwrap(), vec![t, t]);
        assert!(TimestampRecorder::create(dir.path(), "timestamps", started()).is_err());
    }
}
