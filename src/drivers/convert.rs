use serde::{Deserialize, Serialize};

/// Number of distinct codes in a 16-bit sample; the instrument maps its full
/// input range onto this span.
pub const FULL_SCALE_COUNTS: f64 = 65536.0;

/// Per-channel (range, offset) pair needed to turn raw counts into volts.
///
/// Read it back from the instrument while the device is still open: after the
/// handle is closed the getters return stale values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageScale {
    pub range: f64,
    pub offset: f64,
}

impl VoltageScale {
    pub fn new(range: f64, offset: f64) -> Self {
        Self { range, offset }
    }

    #[inline]
    pub fn to_volts(&self, raw: i16) -> f64 {
        f64::from(raw) * self.range / FULL_SCALE_COUNTS + self.offset
    }

    /// Inverse of [`to_volts`](Self::to_volts), saturating at the i16 limits.
    pub fn to_raw(&self, volts: f64) -> i16 {
        if self.range == 0.0 {
            return 0;
        }
        let counts = ((volts - self.offset) * FULL_SCALE_COUNTS / self.range).round();
        counts.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

/// Converts a whole buffer. Raw values are neither clipped nor validated.
pub fn convert(raw: &[i16], scale: VoltageScale) -> Vec<f64> {
    raw.iter().map(|&r| scale.to_volts(r)).collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl SignalStats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (min, max, sum) = values.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(lo, hi, sum), &v| (lo.min(v), hi.max(v), sum + v),
        );
        Some(Self {
            min,
            max,
            mean: sum / values.len() as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_reference_samples() {
        let volts = convert(&[0, 16384, -16384, 32767], VoltageScale::new(5.0, 0.0));
        let expected = [0.0, 1.25, -1.25, 2.499924];
        for (v, e) in volts.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6, "{v} != {e}");
        }
    }

    #[test]
    fn matches_affine_map_for_every_code() {
        let scale = VoltageScale::new(5.538410, 0.000291);
        for raw in (i16::MIN..=i16::MAX).step_by(97) {
            let expected = raw as f64 * 5.538410 / 65536.0 + 0.000291;
            assert!((scale.to_volts(raw) - expected).abs() < 1e-9);
        }
        // extremes must not overflow
        assert!((scale.to_volts(i16::MIN) - (-5.538410 / 2.0 + 0.000291)).abs() < 1e-9);
    }

    #[test]
    fn conversion_is_idempotent() {
        let raw: Vec<i16> = (-500..500).map(|v| v * 37).collect();
        let scale = VoltageScale::new(25.0, -0.5);
        assert_eq!(convert(&raw, scale), convert(&raw, scale));
        assert_eq!(convert(&raw, scale).len(), raw.len());
    }

    #[test]
    fn to_raw_saturates() {
        let scale = VoltageScale::new(5.0, 0.0);
        assert_eq!(scale.to_raw(100.0), i16::MAX);
        assert_eq!(scale.to_raw(-100.0), i16::MIN);
        assert_eq!(scale.to_raw(1.25), 16384);
    }

    #[test]
    fn stats_of_signal() {
        let stats = SignalStats::of(&[1.0, -2.0, 4.0]).unwrap();
        assert_eq!(stats.min, -2.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.mean - 1.0).abs() < 1e-12);
        assert!(SignalStats::of(&[]).is_none());
    }
}
