// src/drivers/mod.rs
// 声明同级目录下的子模块文件
pub mod acquisition;
pub mod analysis;
pub mod convert;
pub mod error;
pub mod fft;
pub mod frame;
pub mod instrument;
pub mod mmode;
pub mod plot;
pub mod session;
// 公开导出这些模块里的结构体，方便外部调用
pub use acquisition::{
    record, AcquisitionReport, AcquisitionState, CancelToken, WindowedAcquisition,
};
pub use analysis::{BlandAltman, ChannelDifference, Medium};
pub use convert::{convert, SignalStats, VoltageScale, FULL_SCALE_COUNTS};
pub use error::LabError;
pub use fft::{FrequencySpectrum, SpectrumBuilder};
pub use frame::{channel_label, TimeSeriesFrame};
pub use instrument::{Instrument, SimulatedInstrument, SimulationProfile};
pub use mmode::{integral, reshape_to_mmode, reshape_to_mmode_f64, MMode};
pub use plot::{
    render_bland_altman_png, render_intervals_png, render_mmode_png, render_spectrum_png,
    render_waveform_png, PlotStyle, XAxis,
};
pub use session::AcquisitionSession;
