use crate::drivers::LabError;

/// Speed of sound in water, m/s.
pub const C_WATER: f64 = 1482.3;
/// Speed of sound in air, m/s.
pub const C_AIR: f64 = 343.0;
/// Speed of sound in soft tissue, m/s.
pub const C_TISSUE: f64 = 1540.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Medium {
    Water,
    Air,
    Tissue,
}

impl Medium {
    pub fn speed_of_sound(self) -> f64 {
        match self {
            Medium::Water => C_WATER,
            Medium::Air => C_AIR,
            Medium::Tissue => C_TISSUE,
        }
    }
}

/// Travel distance in metres for a time of flight `t` at speed `c`.
pub fn sec_to_dist(t: f64, c: f64) -> f64 {
    c * t
}

/// Converts a whole time axis to path length `c·t` in millimetres. Echo
/// times give the round trip, not the depth.
pub fn distance_axis_mm(time_s: &[f64], medium: Medium) -> Vec<f64> {
    let c = medium.speed_of_sound();
    time_s.iter().map(|&t| 1000.0 * sec_to_dist(t, c)).collect()
}

/// Sample-by-sample comparison of two equally long signals (`b - a`).
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDifference {
    pub difference: Vec<f64>,
    pub norm: f64,
    pub min_abs: f64,
    pub max_abs: f64,
}

impl ChannelDifference {
    pub fn between(a: &[f64], b: &[f64]) -> Result<Self, LabError> {
        if a.len() != b.len() {
            return Err(LabError::BufferSize {
                expected: a.len(),
                actual: b.len(),
            });
        }
        let difference: Vec<f64> = a.iter().zip(b).map(|(x, y)| y - x).collect();
        let norm = difference.iter().map(|d| d * d).sum::<f64>().sqrt();
        let (min_abs, max_abs) = difference
            .iter()
            .map(|d| d.abs())
            .fold((f64::INFINITY, 0.0f64), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Ok(Self {
            difference,
            norm,
            min_abs: if min_abs.is_finite() { min_abs } else { 0.0 },
            max_abs,
        })
    }

    pub fn is_identical(&self) -> bool {
        self.max_abs == 0.0
    }
}

/// Agreement between two measurements of the same quantity.
#[derive(Clone, Debug, PartialEq)]
pub struct BlandAltman {
    pub means: Vec<f64>,
    pub differences: Vec<f64>,
    pub bias: f64,
    pub sd: f64,
}

impl BlandAltman {
    pub fn compute(a: &[f64], b: &[f64]) -> Result<Self, LabError> {
        if a.len() != b.len() {
            return Err(LabError::BufferSize {
                expected: a.len(),
                actual: b.len(),
            });
        }
        if a.len() < 2 {
            return Err(LabError::InvalidConfig(
                "Bland-Altman needs at least two paired samples".into(),
            ));
        }
        let means: Vec<f64> = a.iter().zip(b).map(|(x, y)| 0.5 * (x + y)).collect();
        let differences: Vec<f64> = a.iter().zip(b).map(|(x, y)| y - x).collect();
        let n = differences.len() as f64;
        let bias = differences.iter().sum::<f64>() / n;
        let var = differences.iter().map(|d| (d - bias).powi(2)).sum::<f64>() / (n - 1.0);
        Ok(Self {
            means,
            differences,
            bias,
            sd: var.sqrt(),
        })
    }

    /// 95 % limits of agreement.
    pub fn limits(&self) -> (f64, f64) {
        (self.bias - 1.96 * self.sd, self.bias + 1.96 * self.sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difference_statistics() {
        let diff = ChannelDifference::between(&[1.0, 2.0, 3.0], &[1.0, 2.5, 1.0]).unwrap();
        assert_eq!(diff.difference, vec![0.0, 0.5, -2.0]);
        assert!((diff.norm - (0.25f64 + 4.0).sqrt()).abs() < 1e-12);
        assert_eq!(diff.min_abs, 0.0);
        assert_eq!(diff.max_abs, 2.0);
        assert!(!diff.is_identical());
        assert!(ChannelDifference::between(&[1.0], &[]).is_err());
    }

    #[test]
    fn bland_altman_bias_and_limits() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.5, 2.5, 3.5, 4.5];
        let ba = BlandAltman::compute(&a, &b).unwrap();
        assert!((ba.bias - 0.5).abs() < 1e-12);
        assert!(ba.sd.abs() < 1e-12);
        assert_eq!(ba.means[0], 1.25);
        let (lo, hi) = ba.limits();
        assert!((lo - 0.5).abs() < 1e-12 && (hi - 0.5).abs() < 1e-12);
    }

    #[test]
    fn bland_altman_uses_sample_sd() {
        let ba = BlandAltman::compute(&[0.0, 0.0], &[1.0, 3.0]).unwrap();
        assert!((ba.bias - 2.0).abs() < 1e-12);
        assert!((ba.sd - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn echo_time_gives_full_path_length() {
        // 100 us in water: the whole c·t path, the reflector sits at half of it
        let mm = distance_axis_mm(&[0.0, 100e-6], Medium::Water);
        assert!((mm[1] - 148.23).abs() < 1e-9);
        assert_eq!(sec_to_dist(1.0, Medium::Air.speed_of_sound()), 343.0);
    }
}
