use std::io::Cursor;
use std::ops::Range;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::LineSeries;
use plotters::prelude::*;

use crate::drivers::analysis::{distance_axis_mm, BlandAltman, Medium};
use crate::drivers::error::LabError;
use crate::drivers::fft::FrequencySpectrum;
use crate::drivers::mmode::MMode;
use crate::drivers::TimeSeriesFrame;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    /// Caption, axes and legend. These need a system font; without it only
    /// the data is drawn.
    pub annotate: bool,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}

impl PlotStyle {
    /// Data only, no text.
    pub fn bare() -> Self {
        Self {
            annotate: false,
            ..Self::default()
        }
    }

    fn label_area(&self, size: u32) -> u32 {
        if self.annotate {
            size
        } else {
            0
        }
    }
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            annotate: true,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RGBColor(255, 140, 0), GREEN, CYAN, MAGENTA, YELLOW, WHITE],
        }
    }
}

/// Horizontal axis of a waveform plot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XAxis {
    /// Pseudo-time; TR delays are not shown.
    Time,
    /// Path length `c·t` in millimetres at the medium's speed of sound. For
    /// a pulse-echo time this is the round trip, twice the reflector depth.
    Distance(Medium),
}

impl XAxis {
    fn label(self) -> &'static str {
        match self {
            XAxis::Time => "Seconds (TR delays not shown)",
            XAxis::Distance(_) => "Path length c·t [mm]",
        }
    }

    fn values(self, frame: &TimeSeriesFrame) -> Vec<f64> {
        let t = frame.time_axis();
        match self {
            XAxis::Time => t,
            XAxis::Distance(medium) => distance_axis_mm(&t, medium),
        }
    }
}

fn bounds<'a>(values: impl Iterator<Item = &'a f64>) -> Range<f64> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return -1.0..1.0;
    }
    if (hi - lo).abs() < f64::EPSILON {
        return lo - 1.0..hi + 1.0;
    }
    let pad = 0.05 * (hi - lo);
    lo - pad..hi + pad
}

fn caption_font<'a>() -> TextStyle<'a> {
    ("sans-serif", 20).into_font().color(&WHITE)
}

pub fn render_waveform_png(
    frame: &TimeSeriesFrame,
    title: &str,
    axis: XAxis,
    style: PlotStyle,
) -> Result<Vec<u8>, LabError> {
    if frame.is_empty() {
        return Err(LabError::Plot("time-series frame has no samples".into()));
    }
    let xs = axis.values(frame);
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let y_range = bounds(frame.samples.iter().flatten());
        let x_range = bounds(xs.iter());
        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, style.label_area(55))
            .set_label_area_size(LabelAreaPosition::Bottom, style.label_area(40));
        if style.annotate {
            builder.caption(title, caption_font());
        }
        let mut chart = builder.build_cartesian_2d(x_range, y_range)?;
        if style.annotate {
            chart
                .configure_mesh()
                .light_line_style(&WHITE.mix(0.1))
                .x_desc(axis.label())
                .y_desc("Volts")
                .draw()?;
        }
        for (idx, channel) in frame.samples.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = xs.iter().copied().zip(channel.iter().copied());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(
                    frame
                        .channel_labels
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("Ch {idx}")),
                )
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        if style.annotate {
            chart
                .configure_series_labels()
                .border_style(&WHITE.mix(0.2))
                .background_style(&style.background)
                .label_font(("sans-serif", 14).into_font().color(&WHITE))
                .draw()?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

pub fn render_spectrum_png(
    spectrum: &FrequencySpectrum,
    style: PlotStyle,
) -> Result<Vec<u8>, LabError> {
    if spectrum.magnitudes.is_empty() || spectrum.frequencies_hz.is_empty() {
        return Err(LabError::Plot("spectrum has no magnitudes".into()));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let peak = spectrum
            .magnitudes
            .iter()
            .flat_map(|c| c.iter().copied())
            .fold(0.0f64, f64::max)
            .max(1e-6);
        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, style.label_area(55))
            .set_label_area_size(LabelAreaPosition::Bottom, style.label_area(40));
        if style.annotate {
            builder.caption("FFT Magnitude", caption_font());
        }
        let mut chart = builder
            .build_cartesian_2d(
                0f64..spectrum.frequencies_hz.last().copied().unwrap_or(1.0).max(1.0),
                0f64..peak * 1.05,
            )?;
        if style.annotate {
            chart
                .configure_mesh()
                .light_line_style(&WHITE.mix(0.1))
                .x_desc("Hz")
                .draw()?;
        }
        for (idx, mags) in spectrum.magnitudes.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = spectrum
                .frequencies_hz
                .iter()
                .cloned()
                .zip(mags.iter().cloned());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(
                    spectrum
                        .channel_labels
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("Ch {idx}")),
                )
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        if style.annotate {
            chart
                .configure_series_labels()
                .border_style(&WHITE.mix(0.2))
                .background_style(&style.background)
                .label_font(("sans-serif", 14).into_font().color(&WHITE))
                .draw()?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Grayscale M-mode image: depth downwards, repetitions to the right.
/// The first `ignore_rows` rows (transmit ring-down) are left out of the
/// gray-level scaling and the picture.
pub fn render_mmode_png(
    mmode: &MMode,
    title: &str,
    ignore_rows: usize,
    style: PlotStyle,
) -> Result<Vec<u8>, LabError> {
    let rows = mmode.period_length();
    let cols = mmode.periods();
    if cols == 0 || ignore_rows >= rows {
        return Err(LabError::Plot("m-mode matrix is empty".into()));
    }
    let shown = mmode.matrix.slice(ndarray::s![ignore_rows.., ..]);
    let visible_rows = shown.nrows();
    // bucket the matrix down to at most one cell per pixel
    let cells_x = cols.min(style.width as usize);
    let cells_y = visible_rows.min(style.height as usize);
    let mut cells = vec![0.0f64; cells_x * cells_y];
    let mut counts = vec![0usize; cells_x * cells_y];
    for ((r, c), &v) in shown.indexed_iter() {
        let cx = c * cells_x / cols;
        let cy = r * cells_y / visible_rows;
        cells[cy * cells_x + cx] += v;
        counts[cy * cells_x + cx] += 1;
    }
    for (cell, &n) in cells.iter_mut().zip(&counts) {
        if n > 0 {
            *cell /= n as f64;
        }
    }
    let range = bounds(cells.iter());
    let span = range.end - range.start;

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, style.label_area(55))
            .set_label_area_size(LabelAreaPosition::Bottom, style.label_area(40));
        if style.annotate {
            builder.caption(title, caption_font());
        }
        let mut chart = builder
            // negated depth so the first sample sits at the top
            .build_cartesian_2d(0f64..cols as f64, -(rows as f64)..-(ignore_rows as f64))?;
        if style.annotate {
            chart
                .configure_mesh()
                .disable_mesh()
                .x_desc("Repetition")
                .y_desc("Sample in period")
                .y_label_formatter(&|v| format!("{:.0}", -v))
                .draw()?;
        }
        let col_step = cols as f64 / cells_x as f64;
        let row_step = visible_rows as f64 / cells_y as f64;
        chart.draw_series((0..cells_y).flat_map(|cy| {
            (0..cells_x).map(move |cx| (cx, cy))
        }).map(|(cx, cy)| {
            let level = ((cells[cy * cells_x + cx] - range.start) / span * 255.0)
                .clamp(0.0, 255.0) as u8;
            let x0 = cx as f64 * col_step;
            let y0 = -(ignore_rows as f64 + cy as f64 * row_step);
            Rectangle::new(
                [(x0, y0), (x0 + col_step, y0 - row_step)],
                RGBColor(level, level, level).filled(),
            )
        }))?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Differences against means with the bias and 95 % limit lines.
pub fn render_bland_altman_png(
    ba: &BlandAltman,
    title: &str,
    style: PlotStyle,
) -> Result<Vec<u8>, LabError> {
    if ba.means.is_empty() {
        return Err(LabError::Plot("no paired samples".into()));
    }
    let (lo, hi) = ba.limits();
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let x_range = bounds(ba.means.iter());
        let y_range = bounds(ba.differences.iter().chain([lo, hi].iter()));
        let (x0, x1) = (x_range.start, x_range.end);
        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, style.label_area(55))
            .set_label_area_size(LabelAreaPosition::Bottom, style.label_area(40));
        if style.annotate {
            builder.caption(title, caption_font());
        }
        let mut chart = builder.build_cartesian_2d(x_range, y_range)?;
        if style.annotate {
            chart
                .configure_mesh()
                .light_line_style(&WHITE.mix(0.1))
                .x_desc("Mean (V)")
                .y_desc("Difference (V)")
                .draw()?;
        }
        let dot = style.palette[0];
        chart.draw_series(
            ba.means
                .iter()
                .zip(&ba.differences)
                .map(|(&m, &d)| Circle::new((m, d), 2, dot.filled())),
        )?;
        let bias_color = style.palette[1 % style.palette.len()];
        chart.draw_series(LineSeries::new(vec![(x0, ba.bias), (x1, ba.bias)], &bias_color))?;
        for limit in [lo, hi] {
            chart.draw_series(LineSeries::new(vec![(x0, limit), (x1, limit)], &WHITE.mix(0.6)))?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Trigger-to-trigger intervals against trigger number.
pub fn render_intervals_png(dt_s: &[f64], title: &str, style: PlotStyle) -> Result<Vec<u8>, LabError> {
    if dt_s.is_empty() {
        return Err(LabError::Plot("need at least two triggers".into()));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut builder = ChartBuilder::on(&root);
        builder
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, style.label_area(65))
            .set_label_area_size(LabelAreaPosition::Bottom, style.label_area(40));
        if style.annotate {
            builder.caption(title, caption_font());
        }
        let mut chart = builder.build_cartesian_2d(0f64..dt_s.len() as f64, bounds(dt_s.iter()))?;
        if style.annotate {
            chart
                .configure_mesh()
                .light_line_style(&WHITE.mix(0.1))
                .x_desc("Trigger")
                .y_desc("dt (s)")
                .draw()?;
        }
        let color = style.palette[0];
        let series = dt_s.iter().enumerate().map(|(i, &v)| (i as f64 + 1.0, v));
        chart.draw_series(LineSeries::new(series, &color))?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, LabError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| LabError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::fft::SpectrumBuilder;
    use crate::drivers::mmode::reshape_to_mmode;

    const PNG_MAGIC: [u8; 4] = [0x89, b'P', b'N', b'G'];

    fn frame() -> TimeSeriesFrame {
        TimeSeriesFrame {
            sample_rate_hz: 1e6,
            channel_labels: vec!["CH1".into(), "CH2".into()],
            samples: vec![
                (0..64).map(|i| (i as f64 * 0.3).sin()).collect(),
                (0..64).map(|i| (i as f64 * 0.1).cos()).collect(),
            ],
        }
    }

    #[test]
    fn plotting_helpers_return_png() {
        let frame = frame();
        let wave = render_waveform_png(&frame, "test", XAxis::Time, PlotStyle::bare()).unwrap();
        let dist = render_waveform_png(
            &frame,
            "test",
            XAxis::Distance(Medium::Water),
            PlotStyle::bare(),
        )
        .unwrap();
        let spectrum = SpectrumBuilder::with_size(32).compute(&frame);
        let fft = render_spectrum_png(&spectrum, PlotStyle::bare()).unwrap();
        for png in [wave, dist, fft] {
            assert_eq!(&png[..4], &PNG_MAGIC);
        }
    }

    #[test]
    fn mmode_and_bland_altman_render() {
        let frame = frame();
        let mmode = reshape_to_mmode(&frame.samples[0], 8, 0).unwrap();
        let png = render_mmode_png(&mmode, "m-mode", 1, PlotStyle::bare()).unwrap();
        assert_eq!(&png[..4], &PNG_MAGIC);
        assert!(render_mmode_png(&mmode, "m-mode", 8, PlotStyle::bare()).is_err());

        let ba = BlandAltman::compute(&frame.samples[0], &frame.samples[1]).unwrap();
        let png = render_bland_altman_png(&ba, "ch1 vs ch2", PlotStyle::bare()).unwrap();
        assert_eq!(&png[..4], &PNG_MAGIC);
    }

    #[test]
    fn distance_axis_is_labelled_as_path_length() {
        let frame = frame();
        let xs = XAxis::Distance(Medium::Water).values(&frame);
        assert!((xs[1] - 1000.0 * 1482.3 * 1e-6).abs() < 1e-12);
        assert!(XAxis::Distance(Medium::Water).label().contains("c·t"));
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let empty = TimeSeriesFrame {
            sample_rate_hz: 1e6,
            channel_labels: vec![],
            samples: vec![],
        };
        assert!(render_waveform_png(&empty, "x", XAxis::Time, PlotStyle::bare()).is_err());
        assert!(render_intervals_png(&[], "dt", PlotStyle::bare()).is_err());
        let png = render_intervals_png(&[0.01, 0.0101, 0.0099], "dt", PlotStyle::bare()).unwrap();
        assert_eq!(&png[..4], &PNG_MAGIC);
    }
}
