//! Inference session: one loaded model, its runtime selection, and the
//! prediction buffer of the last successful run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::backend_for;
use crate::engine::{InferenceEngine, OrtEngine};
use crate::error::{Error, Result};
use crate::profile::report_profile;
use crate::resize::{ResizeStrategy, Resizer};
use crate::selector::{select_runtime, RuntimeMode, RuntimeSelection};
use crate::tensor::{extract_output, ImageInput, TensorSpec};

/// Construction parameters for [`InferenceSession::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Only 1 is accepted.
    pub batch: i64,
    /// Runtime mode code, see [`RuntimeMode::from_code`].
    pub mode: i32,
    /// Log load and inference timings at `info` instead of `debug`.
    pub verbose: bool,
    /// Capture per-operator timings for the first prediction.
    pub profile: bool,
    pub resize: ResizeStrategy,
    /// Where the runtime writes its trace; the system temp dir when unset.
    pub profile_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            batch: 1,
            mode: 4,
            verbose: false,
            profile: false,
            resize: ResizeStrategy::default(),
            profile_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No successful prediction is held.
    Constructed,
    /// The prediction buffer holds the output of the last run.
    Ready,
}

pub struct InferenceSession {
    engine: Box<dyn InferenceEngine>,
    selection: RuntimeSelection,
    resizer: Resizer,
    predictions: Vec<f32>,
    state: SessionState,
    verbose: bool,
}

fn log_elapsed(verbose: bool, stage: &'static str, started: Instant) {
    let elapsed_us = started.elapsed().as_micros() as u64;
    if verbose {
        info!(stage, elapsed_us, "Timing");
    } else {
        debug!(stage, elapsed_us, "Timing");
    }
}

fn profile_prefix(dir: Option<&Path>, model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    dir.map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("edgepred_{stem}"))
}

impl InferenceSession {
    /// Load `model_path` for the runtime chosen by `options.mode`.
    pub fn open(model_path: impl AsRef<Path>, options: &SessionOptions) -> Result<Self> {
        let model_path = model_path.as_ref();

        let mode = RuntimeMode::from_code(options.mode)?;
        if options.batch != 1 {
            return Err(Error::UnsupportedBatch(options.batch));
        }
        if !model_path.is_file() {
            return Err(Error::ModelNotFound(model_path.to_path_buf()));
        }

        let backend = backend_for(mode.backend());
        let selection = select_runtime(mode, |target| backend.is_available(target));

        let prefix = options
            .profile
            .then(|| profile_prefix(options.profile_dir.as_deref(), model_path));
        if let Some(dir) = prefix.as_deref().and_then(Path::parent) {
            std::fs::create_dir_all(dir)?;
        }

        let started = Instant::now();
        let engine = OrtEngine::load(model_path, selection, prefix.as_deref())?;
        log_elapsed(options.verbose, "model_load", started);

        info!(
            model = %model_path.display(),
            backend = %selection.backend,
            target = %selection.target,
            fell_back = selection.fell_back,
            "Model loaded"
        );

        Ok(Self::with_engine(Box::new(engine), selection, options))
    }

    /// Wrap an already loaded engine.
    pub fn with_engine(
        engine: Box<dyn InferenceEngine>,
        selection: RuntimeSelection,
        options: &SessionOptions,
    ) -> Self {
        Self {
            engine,
            selection,
            resizer: Resizer::new(options.resize),
            predictions: Vec::new(),
            state: SessionState::Constructed,
            verbose: options.verbose,
        }
    }

    pub fn selection(&self) -> RuntimeSelection {
        self.selection
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn input_spec(&self) -> &TensorSpec {
        self.engine.input_spec()
    }

    pub fn output_shape(&self) -> &[i64] {
        self.engine.output_shape()
    }

    /// Run one image through the model. The previous prediction is
    /// discarded first, whatever the outcome.
    pub fn predict(&mut self, input: &ImageInput<'_>) -> Result<&[f32]> {
        self.predictions.clear();
        self.state = SessionState::Constructed;

        let spec = *self.engine.input_spec();
        let tensor = self.resizer.prepare_input(input, &spec)?;

        let started = Instant::now();
        let raw = self.engine.run(&tensor)?;
        log_elapsed(self.verbose, "inference", started);

        match self.engine.end_profiling() {
            Ok(Some(trace)) => {
                report_profile(&trace);
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Failed to collect profiling trace"),
        }

        self.predictions = extract_output(&raw)?;
        self.state = SessionState::Ready;
        Ok(&self.predictions)
    }

    /// Output of the last successful [`predict`](Self::predict).
    pub fn predictions(&self) -> Option<&[f32]> {
        match self.state {
            SessionState::Ready => Some(&self.predictions),
            SessionState::Constructed => {
                warn!("Predictions requested before a successful predict");
                None
            }
        }
    }

    /// Length of the current prediction buffer; 0 before a successful run.
    pub fn output_len(&self) -> usize {
        self.predictions.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::selector::RuntimeTarget;
    use crate::tensor::{InputTensor, NumericEncoding, RawOutput, TensorData};

    /// Engine that averages its input into every output slot.
    pub(crate) struct MeanEngine {
        pub spec: TensorSpec,
        pub output_shape: Vec<i64>,
        pub output_encoding: NumericEncoding,
        pub runs: Arc<AtomicUsize>,
    }

    impl MeanEngine {
        pub fn classifier(spec: TensorSpec, classes: i64) -> Self {
            Self {
                spec,
                output_shape: vec![1, classes],
                output_encoding: NumericEncoding::Float32,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl InferenceEngine for MeanEngine {
        fn input_spec(&self) -> &TensorSpec {
            &self.spec
        }

        fn output_shape(&self) -> &[i64] {
            &self.output_shape
        }

        fn run(&mut self, input: &InputTensor) -> Result<RawOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            assert_eq!(input.dims, self.spec.dims());
            let mean = match &input.data {
                TensorData::Float32(v) => v.iter().sum::<f32>() / v.len() as f32,
                TensorData::UInt8(v) => v.iter().map(|&x| x as f32).sum::<f32>() / v.len() as f32,
                TensorData::Int8(v) => v.iter().map(|&x| x as f32).sum::<f32>() / v.len() as f32,
            };
            let n = *self.output_shape.last().unwrap() as usize;
            let data = match self.output_encoding {
                NumericEncoding::Float32 => TensorData::Float32(vec![mean; n]),
                NumericEncoding::UInt8Quantized => TensorData::UInt8(vec![mean as u8; n]),
                NumericEncoding::Int8Quantized => TensorData::Int8(vec![mean as i8; n]),
            };
            Ok(RawOutput {
                data,
                shape: self.output_shape.clone(),
            })
        }
    }

    pub(crate) fn cpu_selection() -> RuntimeSelection {
        RuntimeSelection {
            backend: crate::selector::BackendKind::Delegate,
            requested: RuntimeTarget::Cpu { threads: 1 },
            target: RuntimeTarget::Cpu { threads: 1 },
            fell_back: false,
        }
    }

    pub(crate) fn direct_options() -> SessionOptions {
        SessionOptions {
            resize: ResizeStrategy::Direct,
            ..SessionOptions::default()
        }
    }

    fn session(engine: MeanEngine) -> InferenceSession {
        InferenceSession::with_engine(Box::new(engine), cpu_selection(), &direct_options())
    }

    fn imagenet_spec() -> TensorSpec {
        TensorSpec::nhwc(224, 224, 3, NumericEncoding::Float32)
    }

    #[test]
    fn predictions_absent_before_predict() {
        let session = session(MeanEngine::classifier(imagenet_spec(), 1000));
        assert_eq!(session.state(), SessionState::Constructed);
        assert!(session.predictions().is_none());
        assert_eq!(session.output_len(), 0);
    }

    #[test]
    fn constant_input_yields_finite_outputs() {
        let mut session = session(MeanEngine::classifier(imagenet_spec(), 1000));
        let image = vec![0.5f32; 224 * 224 * 3];

        let out = session
            .predict(&ImageInput::float(&image, 224, 224, 3))
            .unwrap();
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|v| v.is_finite()));

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.output_len(), 1000);
        assert_eq!(session.predictions().unwrap()[0], 0.5);
    }

    #[test]
    fn larger_input_is_resized_to_model_shape() {
        let mut session = session(MeanEngine::classifier(imagenet_spec(), 1000));
        let image = vec![0.25f32; 512 * 512 * 3];

        let out = session
            .predict(&ImageInput::float(&image, 512, 512, 3))
            .unwrap();
        assert_eq!(out.len(), 1000);
        assert_eq!(out[0], 0.25);
        assert_eq!(session.input_spec().height, 224);
        assert_eq!(session.input_spec().width, 224);
    }

    #[test]
    fn failed_predict_clears_previous_output() {
        let mut session = session(MeanEngine::classifier(imagenet_spec(), 10));
        let image = vec![0.5f32; 224 * 224 * 3];
        session
            .predict(&ImageInput::float(&image, 224, 224, 3))
            .unwrap();

        let err = session
            .predict(&ImageInput::float(&[], 224, 224, 3))
            .unwrap_err();
        assert!(matches!(err, Error::EmptyInput));
        assert!(session.predictions().is_none());
        assert_eq!(session.output_len(), 0);
    }

    #[test]
    fn encoding_mismatch_does_not_run_the_model() {
        let engine = MeanEngine::classifier(imagenet_spec(), 10);
        let runs = engine.runs.clone();
        let mut session = session(engine);

        let quantized = vec![1i32; 224 * 224 * 3];
        let err = session
            .predict(&ImageInput::quantized(&quantized, 224, 224, 3))
            .unwrap_err();
        assert!(matches!(err, Error::EncodingMismatch { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn quantized_model_outputs_are_normalized() {
        let spec = TensorSpec::nhwc(4, 4, 1, NumericEncoding::UInt8Quantized);
        let mut engine = MeanEngine::classifier(spec, 3);
        engine.output_encoding = NumericEncoding::UInt8Quantized;
        let mut session = session(engine);

        let image = vec![255i32; 16];
        let out = session
            .predict(&ImageInput::quantized(&image, 4, 4, 1))
            .unwrap();
        assert_eq!(out, &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn open_rejects_mode_ten_before_touching_the_file() {
        let options = SessionOptions {
            mode: 10,
            ..SessionOptions::default()
        };
        let err = InferenceSession::open("/nonexistent/model.onnx", &options)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedMode { code: 10, .. }));
    }

    #[test]
    fn open_rejects_batch_above_one() {
        let options = SessionOptions {
            batch: 2,
            ..SessionOptions::default()
        };
        let err = InferenceSession::open("/nonexistent/model.onnx", &options)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedBatch(2)));
    }

    #[test]
    fn open_reports_missing_model() {
        let err = InferenceSession::open("/nonexistent/model.onnx", &SessionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::ModelNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/model.onnx"));
    }

    #[test]
    fn profile_prefix_uses_model_stem() {
        let prefix = profile_prefix(
            Some(Path::new("/tmp/profiles")),
            Path::new("/m/mobilenet.onnx"),
        );
        assert_eq!(prefix, PathBuf::from("/tmp/profiles/edgepred_mobilenet"));
    }
}
