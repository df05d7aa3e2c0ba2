// src/types.rs
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::drivers::VoltageScale;

// 示波器采集状态 (DwfState)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum InstrumentStatus {
    Ready,
    Config,
    Prefill,
    Armed,
    Wait,
    Triggered,
    Done,
}

impl InstrumentStatus {
    pub fn from_raw(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ready),
            1 => Some(Self::Armed),
            2 => Some(Self::Done),
            3 => Some(Self::Triggered),
            4 => Some(Self::Config),
            5 => Some(Self::Prefill),
            7 => Some(Self::Wait),
            _ => None,
        }
    }
}

// 触发边沿
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSlope {
    #[default]
    Rise,
    Fall,
    Either,
}

// 触发源
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    AnalogIn,
    External1,
}

// 触发滤波
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerFilter {
    Decimate,
    #[default]
    Average,
}

// 波形发生器输出函数
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveFunction {
    #[default]
    Square,
    Sine,
    /// One sine period loaded as a custom table, played at the carrier frequency.
    CustomSine,
}

/// Lost / corrupted sample counters reported by the instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleLoss {
    pub lost: u64,
    pub corrupted: u64,
}

impl SampleLoss {
    pub fn is_clean(&self) -> bool {
        self.lost == 0 && self.corrupted == 0
    }
}

impl AddAssign for SampleLoss {
    fn add_assign(&mut self, rhs: Self) {
        self.lost += rhs.lost;
        self.corrupted += rhs.corrupted;
    }
}

/// Host-side time of a trigger as reported by the instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTime {
    pub trig_utc_sec: u32,
    pub trig_ticks: u32,
    pub ticks_per_sec: u32,
}

impl TriggerTime {
    pub fn seconds(&self) -> f64 {
        let frac = if self.ticks_per_sec == 0 {
            0.0
        } else {
            f64::from(self.trig_ticks) / f64::from(self.ticks_per_sec)
        };
        f64::from(self.trig_utc_sec) + frac
    }
}

/// Scope settings needed to turn saved raw counts back into volts.
/// Field names double as the metadata CSV header.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopeParams {
    pub ch1_v_range: f64,
    pub ch2_v_range: f64,
    pub ch1_v_offset: f64,
    pub ch2_v_offset: f64,
    pub ch1_attenuation: f64,
    pub ch2_attenuation: f64,
    pub trigger_pos: f64,
    pub trigger_holdoff_time: f64,
    pub trigger_timeout: f64,
}

impl Default for ScopeParams {
    fn default() -> Self {
        Self {
            ch1_v_range: f64::NAN,
            ch2_v_range: f64::NAN,
            ch1_v_offset: f64::NAN,
            ch2_v_offset: f64::NAN,
            ch1_attenuation: f64::NAN,
            ch2_attenuation: f64::NAN,
            trigger_pos: f64::NAN,
            trigger_holdoff_time: f64::NAN,
            trigger_timeout: f64::NAN,
        }
    }
}

impl ScopeParams {
    pub fn scale(&self, channel: usize) -> Option<VoltageScale> {
        let (range, offset) = match channel {
            0 => (self.ch1_v_range, self.ch1_v_offset),
            1 => (self.ch2_v_range, self.ch2_v_offset),
            _ => return None,
        };
        if range.is_nan() || offset.is_nan() {
            return None;
        }
        Some(VoltageScale::new(range, offset))
    }

    pub fn set_scale(&mut self, channel: usize, scale: VoltageScale) {
        match channel {
            0 => {
                self.ch1_v_range = scale.range;
                self.ch1_v_offset = scale.offset;
            }
            1 => {
                self.ch2_v_range = scale.range;
                self.ch2_v_offset = scale.offset;
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Span {
    pub min: f64,
    pub max: f64,
    pub steps: f64,
}

/// Fixed hardware limits of the analog input.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScopeCapabilities {
    pub voltage_range: Span,
    pub voltage_offset: Span,
    pub trigger_position: Span,
    pub trigger_holdoff: Span,
    pub trigger_timeout: Span,
    pub buffer_size_min: usize,
    pub buffer_size_max: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_time_combines_ticks() {
        let t = TriggerTime {
            trig_utc_sec: 1_646_147_000,
            trig_ticks: 250,
            ticks_per_sec: 1000,
        };
        assert!((t.seconds() - 1_646_147_000.25).abs() < 1e-6);
    }

    #[test]
    fn scope_params_scale_requires_both_values() {
        let mut params = ScopeParams::default();
        assert!(params.scale(0).is_none());
        params.set_scale(1, VoltageScale::new(5.0, 0.1));
        assert_eq!(params.scale(1), Some(VoltageScale::new(5.0, 0.1)));
        assert!(params.scale(2).is_none());
    }

    #[test]
    fn loss_accumulates() {
        let mut total = SampleLoss::default();
        total += SampleLoss { lost: 3, corrupted: 1 };
        total += SampleLoss { lost: 2, corrupted: 0 };
        assert_eq!(total, SampleLoss { lost: 5, corrupted: 1 });
        assert!(!total.is_clean());
    }
}
