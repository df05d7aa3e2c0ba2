use ndarray::{Array2, ShapeBuilder};

use crate::drivers::LabError;

/// Returns `value` as a count, rejecting anything that is not an exact
/// non-negative integer. Rounding would silently misalign the reshape.
pub fn integral(value: f64, name: &'static str) -> Result<usize, LabError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > usize::MAX as f64 {
        return Err(LabError::NonIntegral { name, value });
    }
    Ok(value as usize)
}

/// One channel laid out as depth (rows) × repetition (columns).
#[derive(Clone, Debug)]
pub struct MMode {
    pub matrix: Array2<f64>,
    pub discarded_leading: usize,
    pub discarded_trailing: usize,
}

impl MMode {
    pub fn period_length(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn periods(&self) -> usize {
        self.matrix.ncols()
    }
}

/// Splits `signal[first_index..]` into consecutive periods of `period_length`
/// samples; each period becomes one column. Any trailing partial period is
/// dropped.
pub fn reshape_to_mmode(
    signal: &[f64],
    period_length: usize,
    first_index: usize,
) -> Result<MMode, LabError> {
    if period_length == 0 {
        return Err(LabError::NonIntegral {
            name: "period_length",
            value: 0.0,
        });
    }
    if first_index > signal.len() {
        return Err(LabError::BufferSize {
            expected: signal.len(),
            actual: first_index,
        });
    }
    let available = signal.len() - first_index;
    // floor((len - first + 1) / period), but never more than fits
    let periods = ((available + 1) / period_length).min(available / period_length);
    let used = periods * period_length;
    let data = signal[first_index..first_index + used].to_vec();
    let matrix = Array2::from_shape_vec((period_length, periods).f(), data)
        .map_err(|e| LabError::InvalidConfig(format!("m-mode shape: {e}")))?;
    Ok(MMode {
        matrix,
        discarded_leading: first_index,
        discarded_trailing: available - used,
    })
}

/// Same as [`reshape_to_mmode`] for parameters that arrive as floats, e.g.
/// from a period estimate.
pub fn reshape_to_mmode_f64(
    signal: &[f64],
    period_length: f64,
    first_index: f64,
) -> Result<MMode, LabError> {
    let period = integral(period_length, "period_length")?;
    let first = integral(first_index, "first_index")?;
    reshape_to_mmode(signal, period, first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_follows_period_count() {
        let signal: Vec<f64> = (0..1234).map(|v| v as f64).collect();
        let mmode = reshape_to_mmode(&signal, 400, 0).unwrap();
        assert_eq!(mmode.matrix.dim(), (400, 3));
        assert_eq!(mmode.discarded_trailing, 1234 % 400);
        assert_eq!(mmode.discarded_leading, 0);
    }

    #[test]
    fn columns_are_consecutive_periods() {
        let signal: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let mmode = reshape_to_mmode(&signal, 3, 1).unwrap();
        assert_eq!(mmode.matrix.dim(), (3, 3));
        assert_eq!(mmode.matrix[[0, 0]], 1.0);
        assert_eq!(mmode.matrix[[2, 0]], 3.0);
        assert_eq!(mmode.matrix[[0, 1]], 4.0);
        assert_eq!(mmode.matrix[[2, 2]], 9.0);
        assert_eq!(mmode.discarded_trailing, 0);
    }

    #[test]
    fn never_reads_past_the_end() {
        // len - first + 1 is a multiple of the period here
        let signal = vec![0.0; 11];
        let mmode = reshape_to_mmode(&signal, 4, 0).unwrap();
        assert_eq!(mmode.periods(), 2);
        assert!(mmode.period_length() * mmode.periods() <= signal.len());
    }

    #[test]
    fn rejects_fractional_parameters() {
        let signal = vec![0.0; 1000];
        assert!(matches!(
            reshape_to_mmode_f64(&signal, 400.5, 0.0),
            Err(LabError::NonIntegral { name: "period_length", .. })
        ));
        assert!(matches!(
            reshape_to_mmode_f64(&signal, 400.0, -1.0),
            Err(LabError::NonIntegral { name: "first_index", .. })
        ));
        assert_eq!(reshape_to_mmode_f64(&signal, 400.0, 0.0).unwrap().periods(), 2);
    }

    #[test]
    fn short_input_gives_empty_matrix() {
        let mmode = reshape_to_mmode(&[1.0, 2.0], 400, 0).unwrap();
        assert_eq!(mmode.matrix.dim(), (400, 0));
        assert_eq!(mmode.discarded_trailing, 2);
        assert!(reshape_to_mmode(&[1.0], 4, 2).is_err());
    }
}
