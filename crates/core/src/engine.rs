//! Inference engines: a loaded model that maps one input tensor to one output.

use std::path::{Path, PathBuf};

use ort::session::Session;
use ort::value::ValueType;
use tracing::debug;

use crate::backend::{build_session, SessionConfig};
use crate::error::{Error, Result};
use crate::selector::RuntimeSelection;
use crate::tensor::{InputTensor, NumericEncoding, RawOutput, TensorData, TensorSpec};

/// A loaded model with a single image input and a single output.
pub trait InferenceEngine: Send {
    fn input_spec(&self) -> &TensorSpec;

    /// Declared output shape; `-1` marks dynamic dimensions.
    fn output_shape(&self) -> &[i64];

    fn run(&mut self, input: &InputTensor) -> Result<RawOutput>;

    /// Stop runtime profiling and return the trace file, if one was written.
    fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// [`InferenceEngine`] over an `ort::Session`.
pub struct OrtEngine {
    session: Session,
    input_name: String,
    output_name: String,
    output_encoding: NumericEncoding,
    spec: TensorSpec,
    output_shape: Vec<i64>,
    profiling: bool,
}

fn tensor_type(value_type: &ValueType, what: &str) -> Result<(NumericEncoding, Vec<i64>)> {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => Ok((
            NumericEncoding::from_element_type(*ty)?,
            shape.iter().copied().collect(),
        )),
        other => Err(Error::UnsupportedInput(format!(
            "{what} is not a tensor: {other:?}"
        ))),
    }
}

impl OrtEngine {
    pub fn load(
        model_path: &Path,
        selection: RuntimeSelection,
        profile_prefix: Option<&Path>,
    ) -> Result<Self> {
        let config = SessionConfig {
            model_path,
            selection,
            profile_prefix,
        };
        let session = build_session(&config).map_err(|e| Error::SessionBuild {
            path: model_path.to_path_buf(),
            source: e.into(),
        })?;
        Self::from_session(session, profile_prefix.is_some())
    }

    pub fn from_session(session: Session, profiling: bool) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .ok_or_else(|| Error::UnsupportedInput("model declares no inputs".into()))?;
        let output = session.outputs().first().ok_or(Error::MissingOutput)?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let (input_encoding, input_shape) = tensor_type(input.dtype(), "model input")?;
        let (output_encoding, output_shape) = tensor_type(output.dtype(), "model output")?;
        let spec = TensorSpec::from_shape(&input_shape, input_encoding)?;

        debug!(
            %input_name,
            ?input_shape,
            input_encoding = %input_encoding,
            %output_name,
            ?output_shape,
            output_encoding = %output_encoding,
            "Detected model IO"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            output_encoding,
            spec,
            output_shape,
            profiling,
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn input_spec(&self) -> &TensorSpec {
        &self.spec
    }

    fn output_shape(&self) -> &[i64] {
        &self.output_shape
    }

    fn run(&mut self, input: &InputTensor) -> Result<RawOutput> {
        let value = input.to_value()?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])?;
        let output = &outputs[self.output_name.as_str()];

        let (data, shape) = match self.output_encoding {
            NumericEncoding::Float32 => {
                let view = output.try_extract_array::<f32>()?;
                (TensorData::Float32(view.iter().copied().collect()), view.shape().to_vec())
            }
            NumericEncoding::UInt8Quantized => {
                let view = output.try_extract_array::<u8>()?;
                (TensorData::UInt8(view.iter().copied().collect()), view.shape().to_vec())
            }
            NumericEncoding::Int8Quantized => {
                let view = output.try_extract_array::<i8>()?;
                (TensorData::Int8(view.iter().copied().collect()), view.shape().to_vec())
            }
        };

        Ok(RawOutput {
            data,
            shape: shape.into_iter().map(|d| d as i64).collect(),
        })
    }

    fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        if !self.profiling {
            return Ok(None);
        }
        self.profiling = false;
        let file = self.session.end_profiling()?;
        Ok(Some(PathBuf::from(file)))
    }
}
