//! Prediction context: the handle-oriented facade the FFI layer exposes.

use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;
use crate::session::{InferenceSession, SessionOptions};
use crate::tensor::ImageInput;

/// One model, one runtime, one prediction buffer.
///
/// Contexts are independent; run one per thread to predict concurrently.
pub struct PredictionContext {
    session: InferenceSession,
}

impl PredictionContext {
    /// Load `model_path` with the given batch size and runtime mode code.
    pub fn create(
        model_path: impl AsRef<Path>,
        batch: i64,
        mode: i32,
        verbose: bool,
        profile: bool,
    ) -> Result<Self> {
        let options = SessionOptions {
            batch,
            mode,
            verbose,
            profile,
            ..SessionOptions::default()
        };
        Self::with_options(model_path, &options)
    }

    pub fn with_options(model_path: impl AsRef<Path>, options: &SessionOptions) -> Result<Self> {
        let session = InferenceSession::open(model_path, options)?;
        let spec = session.input_spec();
        info!(
            height = spec.height,
            width = spec.width,
            channels = spec.channels,
            encoding = %spec.encoding,
            "Prediction context created"
        );
        Ok(Self { session })
    }

    pub fn from_session(session: InferenceSession) -> Self {
        Self { session }
    }

    /// Predict from data already at the model's input shape.
    pub fn predict(
        &mut self,
        quantized: &[i32],
        floats: &[f32],
        use_quantized: bool,
    ) -> Result<()> {
        self.predict_with_shape(quantized, floats, use_quantized, 0, 0, 0)
    }

    /// Predict from an HWC image of the given shape. A zero dimension means
    /// the model's own.
    pub fn predict_with_shape(
        &mut self,
        quantized: &[i32],
        floats: &[f32],
        use_quantized: bool,
        height: usize,
        width: usize,
        channels: usize,
    ) -> Result<()> {
        let or_model = |given: usize, model: usize| if given == 0 { model } else { given };
        let height = or_model(height, self.height());
        let width = or_model(width, self.width());
        let channels = or_model(channels, self.channels());

        let input = if use_quantized {
            ImageInput::quantized(quantized, height, width, channels)
        } else {
            ImageInput::float(floats, height, width, channels)
        };
        self.session.predict(&input)?;
        Ok(())
    }

    pub fn predictions(&self) -> Option<&[f32]> {
        self.session.predictions()
    }

    /// Model input width.
    pub fn width(&self) -> usize {
        self.session.input_spec().width
    }

    pub fn height(&self) -> usize {
        self.session.input_spec().height
    }

    pub fn channels(&self) -> usize {
        self.session.input_spec().channels
    }

    /// Length of the current predictions; 0 before a successful predict.
    pub fn output_length(&self) -> usize {
        self.session.output_len()
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }
}

impl Drop for PredictionContext {
    fn drop(&mut self) {
        debug!(target_runtime = %self.session.selection().target, "Prediction context destroyed");
    }
}
