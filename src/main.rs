// src/main.rs
//! # echoscope
//!
//! Pulse-echo ultrasound recording on a Digilent Analog Discovery, plus the
//! offline tools used to look at the recordings afterwards.
//!
//! ```bash
//! # 100 pulses, one 200 µs window per pulse
//! echoscope record -f data -d phantom --pulse-info
//!
//! # dry run without hardware
//! echoscope record -f data -d dryrun --simulate --plot
//!
//! # M-mode image of channel 2
//! echoscope mmode data/20220301-102012_phantom_data.csv --period 2000 --channel 2
//! ```
mod config;
mod drivers;
mod dwf;
mod recorder;
mod shutdown;
mod timestamps;
mod types;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use crate::config::AcquisitionConfig;
use crate::drivers::{
    channel_label, record, render_bland_altman_png, render_intervals_png, render_mmode_png,
    render_spectrum_png, render_waveform_png, reshape_to_mmode_f64, AcquisitionReport,
    AcquisitionSession, BlandAltman, CancelToken, ChannelDifference, Instrument, LabError, Medium,
    PlotStyle, SignalStats, SimulatedInstrument, SimulationProfile, SpectrumBuilder,
    TimeSeriesFrame, XAxis,
};
use crate::dwf::DwfDevice;
use crate::recorder::{
    load_raw_csv, load_timestamps, recording_time_of, scales_for, validate_description,
    write_data_csv, write_scope_params, RunFiles, TimestampRecorder,
};
use crate::timestamps::{load_reference_us, log_triggers, TimingAnalysis};
use crate::types::ScopeParams;

/// echoscope - ultrasound pulse-echo acquisition and analysis
#[derive(Parser)]
#[command(name = "echoscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pulse the transducer and record one window per pulse
    Record(RecordArgs),

    /// Log the instrument time of every trigger until Ctrl+C
    Timestamps {
        /// Output folder
        #[arg(short, long)]
        folder: PathBuf,

        /// Short description, no underscores
        #[arg(short, long, default_value = "timestamps")]
        desc: String,

        /// Stop after this many triggers
        #[arg(long)]
        limit: Option<usize>,

        /// Use the built-in simulator instead of a device
        #[arg(long)]
        simulate: bool,
    },

    /// Plot a recording against time or distance
    Plot {
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// Output PNG (defaults to the CSV name with .png)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show the path length c·t instead of pseudo-time
        #[arg(long, value_enum)]
        distance: Option<Medium>,
    },

    /// Lay one channel out as an M-mode image
    Mmode {
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// Samples per repetition
        #[arg(long)]
        period: f64,

        /// First sample of the first repetition
        #[arg(long, default_value = "0")]
        first_index: f64,

        /// Scope channel (1 or 2)
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        /// Rows hidden at the top (transmit ring-down)
        #[arg(long, default_value = "0")]
        ignore_rows: usize,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Magnitude spectrum of every channel
    Fft {
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// FFT length (defaults to the whole recording)
        #[arg(long)]
        size: Option<usize>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two channels, or one channel of two recordings
    Compare {
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// Second recording; compares the same channel of both files
        #[arg(long)]
        against: Option<PathBuf>,

        /// Channel used together with --against
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
        channel: u8,

        /// Bland-Altman plot
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Trigger-to-trigger statistics of a timestamp log
    Timing {
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// Reference times, one integer microsecond epoch per line
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Plot of the intervals
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// SDK version, attached devices and scope limits
    Info {
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Args)]
struct RecordArgs {
    /// Output folder
    #[arg(short, long)]
    folder: PathBuf,

    /// Short description, no underscores
    #[arg(short, long)]
    desc: String,

    /// Append the pulse settings to the file name
    #[arg(long)]
    pulse_info: bool,

    /// JSON acquisition settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of pulses / windows
    #[arg(short = 'n', long)]
    acquisitions: Option<usize>,

    #[arg(long)]
    sample_rate: Option<f64>,

    /// Window length in seconds
    #[arg(long)]
    window_time: Option<f64>,

    /// Give up when a trigger does not arrive within this many seconds
    #[arg(long)]
    trigger_timeout: Option<f64>,

    /// Device index (first device when omitted)
    #[arg(long)]
    device: Option<usize>,

    /// Treat every SDK error as fatal
    #[arg(long)]
    strict: bool,

    /// Use the built-in simulator instead of a device
    #[arg(long)]
    simulate: bool,

    /// Also save a waveform PNG next to the data
    #[arg(long)]
    plot: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::Record(args) => run_record(args),
        Commands::Timestamps {
            folder,
            desc,
            limit,
            simulate,
        } => run_timestamps(&folder, &desc, limit, simulate),
        Commands::Plot {
            input,
            output,
            distance,
        } => run_plot(&input, output, distance),
        Commands::Mmode {
            input,
            period,
            first_index,
            channel,
            ignore_rows,
            output,
        } => run_mmode(&input, period, first_index, channel, ignore_rows, output),
        Commands::Fft {
            input,
            size,
            output,
        } => run_fft(&input, size, output),
        Commands::Compare {
            input,
            against,
            channel,
            output,
        } => run_compare(&input, against.as_deref(), channel, output),
        Commands::Timing {
            input,
            reference,
            output,
        } => run_timing(&input, reference.as_deref(), output),
        Commands::Info { simulate } => run_info(simulate),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_record(args: RecordArgs) -> Result<()> {
    // nothing touches the hardware before the output names are known to be usable
    validate_description(&args.desc)?;

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AcquisitionConfig::default(),
    };
    if let Some(n) = args.acquisitions {
        config.acquisitions = n;
    }
    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    if let Some(window) = args.window_time {
        config.window_time_s = window;
    }
    if args.trigger_timeout.is_some() {
        config.trigger_wait_timeout_s = args.trigger_timeout;
    }
    config.strict_errors |= args.strict;
    config.validate_recording()?;

    let pulse_tag = if args.pulse_info {
        config
            .pulse
            .as_ref()
            .map(|p| p.filename_tag(config.acquisitions))
    } else {
        None
    };
    let files = RunFiles::new(&args.folder, &args.desc, pulse_tag.as_deref(), Local::now())?;
    files.prepare()?;

    info!(
        "{} windows x {} samples, recorded {:.3} ms over a nominal {:.3} s, approx. {:.2} Mbit/s",
        config.acquisitions,
        config.window_len(),
        1e3 * config.recorded_time_s(),
        config.nominal_run_time_s(),
        config.approx_usb_bitrate() / 1e6
    );

    let cancel = CancelToken::new();
    shutdown::cancel_on_ctrl_c(cancel.clone());

    let (session, report) = if args.simulate {
        let mut sim = SimulatedInstrument::new(SimulationProfile::default());
        record(&mut sim, &config, &cancel)?
    } else {
        let mut device = DwfDevice::open(args.device, config.strict_errors)?;
        record(&mut device, &config, &cancel)?
    };

    save_run(&files, &session, args.plot)?;
    log_summary(&session, &report)?;
    if report.interrupted || report.timed_out.is_some() {
        println!(
            "stopped early: saved {} of {} windows to {}",
            report.windows,
            session.acquisitions(),
            files.data.display()
        );
    } else {
        println!("saved {} windows to {}", report.windows, files.data.display());
    }
    if let Some(window) = report.timed_out {
        return Err(LabError::TriggerTimeout {
            window,
            timeout_s: config.trigger_wait_timeout_s.unwrap_or_default(),
        }
        .into());
    }
    Ok(())
}

fn save_run(files: &RunFiles, session: &AcquisitionSession, plot: bool) -> Result<()> {
    write_data_csv(&files.data, session)?;
    let params = session.scope_params().copied().unwrap_or_else(|| {
        let mut params = ScopeParams::default();
        for &ch in session.channels() {
            if let Some(scale) = session.scale(ch) {
                params.set_scale(ch, scale);
            }
        }
        params
    });
    write_scope_params(&files.vconv, &params)?;
    info!("conversion parameters saved to {}", files.vconv.display());

    if plot {
        if session.filled_windows() == 0 {
            warn!("no windows recorded, skipping plot");
            return Ok(());
        }
        let frame = TimeSeriesFrame::from_session(session)?;
        let title = files
            .data
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let png = render_waveform_png(&frame, &title, XAxis::Time, PlotStyle::default())?;
        let path = files.data.with_extension("png");
        fs::write(&path, png)?;
        info!("plot saved to {}", path.display());
    }
    Ok(())
}

fn log_summary(session: &AcquisitionSession, report: &AcquisitionReport) -> Result<()> {
    for &ch in session.channels() {
        if let Some(stats) = SignalStats::of(&session.volts(ch)?) {
            info!(
                "{}: min {:.4} V, max {:.4} V, mean {:.4} V",
                channel_label(ch),
                stats.min,
                stats.max,
                stats.mean
            );
        }
    }
    let (lost, corrupted) = session.loss_percentages();
    if report.loss.is_clean() {
        info!("no samples lost or corrupted");
    } else {
        warn!(
            "{} samples lost ({lost:.3} %), {} corrupted ({corrupted:.3} %)",
            report.loss.lost, report.loss.corrupted
        );
    }
    info!(
        "{} windows in {:.3} s",
        report.windows,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

fn run_timestamps(folder: &Path, desc: &str, limit: Option<usize>, simulate: bool) -> Result<()> {
    validate_description(desc)?;
    let config = AcquisitionConfig::timestamp_logger();
    let mut recorder = TimestampRecorder::create(folder, desc, Local::now())?;

    let cancel = CancelToken::new();
    shutdown::cancel_on_ctrl_c(cancel.clone());
    println!("logging triggers to {}, Ctrl+C to stop", recorder.path().display());

    let report = if simulate {
        let mut sim = SimulatedInstrument::new(SimulationProfile {
            filling_polls: 0,
            ..SimulationProfile::default()
        });
        log_triggers(&mut sim, &config, &mut recorder, &cancel, limit)?
    } else {
        let mut device = DwfDevice::open(None, config.strict_errors)?;
        log_triggers(&mut device, &config, &mut recorder, &cancel, limit)?
    };

    match report.rough_tr_s() {
        Some(tr) => println!("{} triggers, rough TR {:.6} s", report.triggers, tr),
        None => println!("no triggers seen"),
    }
    Ok(())
}

fn load_frame(path: &Path) -> Result<TimeSeriesFrame> {
    let raw = load_raw_csv(path).with_context(|| format!("reading {}", path.display()))?;
    if raw.is_empty() {
        bail!("{} holds no samples", path.display());
    }
    let scales = scales_for(path)?;
    Ok(raw.to_frame(&scales)?)
}

fn title_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn output_or(input: &Path, output: Option<PathBuf>, suffix: &str) -> PathBuf {
    output.unwrap_or_else(|| input.with_file_name(format!("{}{suffix}.png", title_of(input))))
}

fn run_plot(input: &Path, output: Option<PathBuf>, distance: Option<Medium>) -> Result<()> {
    let frame = load_frame(input)?;
    let axis = distance.map(XAxis::Distance).unwrap_or(XAxis::Time);
    let png = render_waveform_png(&frame, &title_of(input), axis, PlotStyle::default())?;
    let path = output_or(input, output, "");
    fs::write(&path, png)?;
    println!("{}", path.display());
    Ok(())
}

fn run_mmode(
    input: &Path,
    period: f64,
    first_index: f64,
    channel: u8,
    ignore_rows: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let frame = load_frame(input)?;
    let signal = frame.scope_channel(channel as usize - 1)?;
    let mmode = reshape_to_mmode_f64(signal, period, first_index)?;
    info!(
        "{} repetitions of {} samples, {} leading and {} trailing samples dropped",
        mmode.periods(),
        mmode.period_length(),
        mmode.discarded_leading,
        mmode.discarded_trailing
    );
    let title = format!("{} {}", title_of(input), channel_label(channel as usize - 1));
    let png = render_mmode_png(&mmode, &title, ignore_rows, PlotStyle::default())?;
    let path = output_or(input, output, &format!("_mmode_ch{channel}"));
    fs::write(&path, png)?;
    println!("{}", path.display());
    Ok(())
}

fn run_fft(input: &Path, size: Option<usize>, output: Option<PathBuf>) -> Result<()> {
    let frame = load_frame(input)?;
    let builder = match size {
        Some(n) => SpectrumBuilder::with_size(n),
        None => SpectrumBuilder::for_frame(&frame),
    };
    let spectrum = builder.compute(&frame);
    for (idx, label) in spectrum.channel_labels.iter().enumerate() {
        if let Some(peak) = spectrum.peak_frequency(idx) {
            println!("{label}: peak at {:.4} MHz", peak / 1e6);
        }
    }
    let png = render_spectrum_png(&spectrum, PlotStyle::default())?;
    let path = output_or(input, output, "_fft");
    fs::write(&path, png)?;
    println!("{}", path.display());
    Ok(())
}

fn run_compare(
    input: &Path,
    against: Option<&Path>,
    channel: u8,
    output: Option<PathBuf>,
) -> Result<()> {
    let first = load_frame(input)?;
    let (a, b, title) = match against {
        Some(other) => {
            let second = load_frame(other)?;
            let idx = channel as usize - 1;
            (
                first.scope_channel(idx)?.to_vec(),
                second.scope_channel(idx)?.to_vec(),
                format!("{} vs {}", title_of(input), title_of(other)),
            )
        }
        None => (
            first.channel(0)?.to_vec(),
            first.channel(1)?.to_vec(),
            format!("{} CH1 vs CH2", title_of(input)),
        ),
    };

    let diff = ChannelDifference::between(&a, &b)?;
    if diff.is_identical() {
        println!("signals are identical");
    } else {
        println!(
            "norm of difference {:.6} V, |diff| min {:.6} V, max {:.6} V",
            diff.norm, diff.min_abs, diff.max_abs
        );
    }

    let ba = BlandAltman::compute(&a, &b)?;
    let (lo, hi) = ba.limits();
    println!(
        "bias {:.6} V, SD {:.6} V, limits of agreement {:.6} .. {:.6} V",
        ba.bias, ba.sd, lo, hi
    );
    let png = render_bland_altman_png(&ba, &title, PlotStyle::default())?;
    let path = output_or(input, output, "_bland-altman");
    fs::write(&path, png)?;
    println!("{}", path.display());
    Ok(())
}

fn run_timing(input: &Path, reference: Option<&Path>, output: Option<PathBuf>) -> Result<()> {
    let triggers = load_timestamps(input).with_context(|| format!("reading {}", input.display()))?;
    let analysis = TimingAnalysis::new(&triggers);
    println!("{} triggers", analysis.times_s.len());
    if let Some(mean) = analysis.mean_dt() {
        println!("mean dt {:.6} s", mean);
    }
    if let Some(first) = analysis.first_trigger() {
        println!("first trigger at {first}");
    }
    match recording_time_of(input).and_then(|created| analysis.start_delay_s(created)) {
        Some(delay) => println!("first trigger {:.3} s after the file was created", delay),
        None => warn!("no creation time in {}", input.display()),
    }

    if let Some(reference) = reference {
        let reference_us = load_reference_us(reference)?;
        let offsets = analysis.offsets_to_reference(&reference_us);
        if let Some(stats) = SignalStats::of(&offsets) {
            println!(
                "offset to nearest reference: min {:.6} s, max {:.6} s, mean {:.6} s",
                stats.min, stats.max, stats.mean
            );
        }
    }

    if analysis.dt_s.is_empty() {
        warn!("fewer than two triggers, nothing to plot");
        return Ok(());
    }
    let png = render_intervals_png(&analysis.dt_s, &title_of(input), PlotStyle::default())?;
    let path = output_or(input, output, "_dt");
    fs::write(&path, png)?;
    println!("{}", path.display());
    Ok(())
}

fn run_info(simulate: bool) -> Result<()> {
    if simulate {
        let mut sim = SimulatedInstrument::default();
        print_instrument(&mut sim)?;
        return Ok(sim.close()?);
    }
    let (version, count) = dwf::probe()?;
    println!("DWF version: {version}");
    println!("{count} device(s) attached");
    if count == 0 {
        return Ok(());
    }
    let mut device = DwfDevice::open(None, false)?;
    print_instrument(&mut device)?;
    Ok(device.close()?)
}

fn print_instrument<I: Instrument>(instrument: &mut I) -> Result<()> {
    println!("analog inputs: {}", instrument.channel_count());
    let caps = instrument.capabilities()?;
    println!(
        "buffer size: {}..={} samples",
        caps.buffer_size_min, caps.buffer_size_max
    );
    println!(
        "voltage range: {} .. {} V ({} steps)",
        caps.voltage_range.min, caps.voltage_range.max, caps.voltage_range.steps
    );
    println!(
        "voltage offset: {} .. {} V",
        caps.voltage_offset.min, caps.voltage_offset.max
    );
    println!(
        "trigger position: {} .. {} s",
        caps.trigger_position.min, caps.trigger_position.max
    );
    println!(
        "trigger holdoff: {} .. {} s",
        caps.trigger_holdoff.min, caps.trigger_holdoff.max
    );
    println!(
        "trigger timeout: {} .. {} s",
        caps.trigger_timeout.min, caps.trigger_timeout.max
    );
    Ok(())
}
