use std::path::PathBuf;

use thiserror::Error;

use crate::tensor::NumericEncoding;

/// Errors surfaced by model construction, input adaptation and prediction.
///
/// Nothing in this crate aborts the process; every failure the runtime can
/// report comes back through one of these variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("runtime mode {code} is not supported: {reason}")]
    UnsupportedMode { code: i32, reason: &'static str },

    #[error("batch size {0} is not supported, only batch size 1 is")]
    UnsupportedBatch(i64),

    #[error("unsupported tensor element type: {0}")]
    UnsupportedEncoding(String),

    #[error("unsupported model input: {0}")]
    UnsupportedInput(String),

    #[error("model expects {expected} input but {requested} data was supplied")]
    EncodingMismatch {
        expected: NumericEncoding,
        requested: &'static str,
    },

    #[error("source has {source_channels} channels but the model expects {target_channels}")]
    ChannelMismatch {
        source_channels: usize,
        target_channels: usize,
    },

    #[error("input buffer holds {actual} elements, expected {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("image data is empty")]
    EmptyInput,

    #[error("invalid tensor shape {height}x{width}x{channels}")]
    InvalidShape {
        height: usize,
        width: usize,
        channels: usize,
    },

    #[error("model produced no outputs")]
    MissingOutput,

    #[error("empty predictions")]
    EmptyPredictions,

    #[error("label file has {labels} entries but the model predicts {predictions} classes")]
    LabelCount { labels: usize, predictions: usize },

    #[error("failed to build session for {}: {source}", .path.display())]
    SessionBuild {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Runtime(#[from] ort::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
