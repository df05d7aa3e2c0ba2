use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("no instrument found: {0}")]
    DeviceNotFound(String),
    #[error("{context} failed: {message}")]
    Instrument { context: String, message: String },
    #[error("invalid description {0:?}: must be non-empty and contain no underscore")]
    InvalidDescription(String),
    #[error("output file already exists: {}", .0.display())]
    OutputExists(PathBuf),
    #[error("{name} must be a non-negative integer, got {value}")]
    NonIntegral { name: &'static str, value: f64 },
    #[error("channel {channel} out of range (instrument has {available})")]
    ChannelOutOfRange { channel: usize, available: usize },
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("buffer size mismatch: expected {expected} samples, got {actual}")]
    BufferSize { expected: usize, actual: usize },
    #[error("no trigger within {timeout_s} s while waiting for window {window}")]
    TriggerTimeout { window: usize, timeout_s: f64 },
    #[error("{}:{line}: {message}", .path.display())]
    MalformedCsv {
        path: PathBuf,
        line: u64,
        message: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for LabError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        LabError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for LabError {
    fn from(value: image::ImageError) -> Self {
        LabError::Plot(value.to_string())
    }
}
