//! Tensor specs, prepared input tensors and output normalization.

use std::fmt;

use ndarray::Array4;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor};
use serde::Serialize;

use crate::error::{Error, Result};

/// Numeric encoding of a model input or output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericEncoding {
    Float32,
    #[serde(rename = "uint8")]
    UInt8Quantized,
    #[serde(rename = "int8")]
    Int8Quantized,
}

impl NumericEncoding {
    pub fn from_element_type(ty: TensorElementType) -> Result<Self> {
        match ty {
            TensorElementType::Float32 => Ok(Self::Float32),
            TensorElementType::Uint8 => Ok(Self::UInt8Quantized),
            TensorElementType::Int8 => Ok(Self::Int8Quantized),
            other => Err(Error::UnsupportedEncoding(format!("{other:?}"))),
        }
    }

    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::Float32)
    }
}

impl fmt::Display for NumericEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::UInt8Quantized => write!(f, "uint8"),
            Self::Int8Quantized => write!(f, "int8"),
        }
    }
}

/// Memory layout of a rank-4 image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    Nhwc,
    Nchw,
}

/// Shape and encoding a model requires of its input. Always batch 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TensorSpec {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub encoding: NumericEncoding,
    pub layout: TensorLayout,
}

/// Largest channel count accepted when guessing the layout of a shape.
const MAX_IMAGE_CHANNELS: i64 = 4;

impl TensorSpec {
    pub fn nhwc(height: usize, width: usize, channels: usize, encoding: NumericEncoding) -> Self {
        Self {
            height,
            width,
            channels,
            encoding,
            layout: TensorLayout::Nhwc,
        }
    }

    /// Derive a spec from a declared input shape. `-1` marks a dynamic dim.
    ///
    /// The batch dim must be 1 or dynamic. NHWC wins when the last dim looks
    /// like a channel count; NCHW is assumed only when dim 1 does and the
    /// last dim does not.
    pub fn from_shape(shape: &[i64], encoding: NumericEncoding) -> Result<Self> {
        let [batch, d1, d2, d3] = shape else {
            return Err(Error::UnsupportedInput(format!(
                "expected a rank-4 image tensor, got shape {shape:?}"
            )));
        };

        if *batch != 1 && *batch != -1 {
            return Err(Error::UnsupportedBatch(*batch));
        }

        let looks_like_channels = |d: i64| (1..=MAX_IMAGE_CHANNELS).contains(&d);
        let (layout, h, w, c) = if looks_like_channels(*d3) || !looks_like_channels(*d1) {
            (TensorLayout::Nhwc, *d1, *d2, *d3)
        } else {
            (TensorLayout::Nchw, *d2, *d3, *d1)
        };

        if h <= 0 || w <= 0 || c <= 0 {
            return Err(Error::UnsupportedInput(format!(
                "dynamic spatial dimensions are not supported, got shape {shape:?}"
            )));
        }

        Ok(Self {
            height: h as usize,
            width: w as usize,
            channels: c as usize,
            encoding,
            layout,
        })
    }

    pub fn element_count(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// Tensor dims in the model's own layout.
    pub fn dims(&self) -> [usize; 4] {
        match self.layout {
            TensorLayout::Nhwc => [1, self.height, self.width, self.channels],
            TensorLayout::Nchw => [1, self.channels, self.height, self.width],
        }
    }
}

/// Caller-supplied pixel data, quantized or float.
#[derive(Debug, Clone, Copy)]
pub enum InputData<'a> {
    Quantized(&'a [i32]),
    Float(&'a [f32]),
}

impl InputData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Quantized(data) => data.len(),
            Self::Float(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Quantized(_) => "quantized",
            Self::Float(_) => "float",
        }
    }
}

/// An HWC image buffer of arbitrary resolution.
#[derive(Debug, Clone, Copy)]
pub struct ImageInput<'a> {
    pub data: InputData<'a>,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl<'a> ImageInput<'a> {
    pub fn float(data: &'a [f32], height: usize, width: usize, channels: usize) -> Self {
        Self {
            data: InputData::Float(data),
            height,
            width,
            channels,
        }
    }

    pub fn quantized(data: &'a [i32], height: usize, width: usize, channels: usize) -> Self {
        Self {
            data: InputData::Quantized(data),
            height,
            width,
            channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::EmptyInput);
        }
        let expected = self
            .height
            .checked_mul(self.width)
            .and_then(|hw| hw.checked_mul(self.channels))
            .filter(|&len| len > 0)
            .ok_or(Error::InvalidShape {
                height: self.height,
                width: self.width,
                channels: self.channels,
            })?;
        if self.data.len() != expected {
            return Err(Error::BufferLength {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Element storage for one tensor, in one of the supported encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(Vec<f32>),
    UInt8(Vec<u8>),
    Int8(Vec<i8>),
}

impl TensorData {
    pub fn encoding(&self) -> NumericEncoding {
        match self {
            Self::Float32(_) => NumericEncoding::Float32,
            Self::UInt8(_) => NumericEncoding::UInt8Quantized,
            Self::Int8(_) => NumericEncoding::Int8Quantized,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::UInt8(v) => v.len(),
            Self::Int8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode float HWC values for `encoding`, truncating toward zero and
    /// saturating for the quantized encodings.
    pub fn encode(values: Vec<f32>, encoding: NumericEncoding) -> Self {
        match encoding {
            NumericEncoding::Float32 => Self::Float32(values),
            NumericEncoding::UInt8Quantized => {
                Self::UInt8(values.into_iter().map(truncate_u8).collect())
            }
            NumericEncoding::Int8Quantized => {
                Self::Int8(values.into_iter().map(truncate_i8).collect())
            }
        }
    }

    fn to_chw(&self, height: usize, width: usize, channels: usize) -> Self {
        match self {
            Self::Float32(v) => Self::Float32(hwc_to_chw(v, height, width, channels)),
            Self::UInt8(v) => Self::UInt8(hwc_to_chw(v, height, width, channels)),
            Self::Int8(v) => Self::Int8(hwc_to_chw(v, height, width, channels)),
        }
    }
}

/// Float-to-int `as` casts truncate toward zero and saturate.
pub fn truncate_u8(value: f32) -> u8 {
    value as u8
}

pub fn truncate_i8(value: f32) -> i8 {
    value as i8
}

pub(crate) fn hwc_to_chw<T: Copy>(
    data: &[T],
    height: usize,
    width: usize,
    channels: usize,
) -> Vec<T> {
    let plane = height * width;
    let mut out = Vec::with_capacity(data.len());
    for c in 0..channels {
        out.extend((0..plane).map(|p| data[p * channels + c]));
    }
    out
}

/// A model-ready input tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub data: TensorData,
    pub dims: [usize; 4],
}

impl InputTensor {
    /// Wrap HWC data prepared for `spec`, reordering to CHW if the model
    /// wants NCHW.
    pub fn from_hwc(data: TensorData, spec: &TensorSpec) -> Self {
        let data = match spec.layout {
            TensorLayout::Nhwc => data,
            TensorLayout::Nchw => data.to_chw(spec.height, spec.width, spec.channels),
        };
        Self {
            data,
            dims: spec.dims(),
        }
    }

    pub fn to_value(&self) -> Result<DynValue> {
        let dims = (self.dims[0], self.dims[1], self.dims[2], self.dims[3]);
        let value = match &self.data {
            TensorData::Float32(v) => {
                Tensor::from_array(Array4::from_shape_vec(dims, v.clone())?)?.into_dyn()
            }
            TensorData::UInt8(v) => {
                Tensor::from_array(Array4::from_shape_vec(dims, v.clone())?)?.into_dyn()
            }
            TensorData::Int8(v) => {
                Tensor::from_array(Array4::from_shape_vec(dims, v.clone())?)?.into_dyn()
            }
        };
        Ok(value)
    }
}

/// Raw output tensor as the runtime produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub data: TensorData,
    pub shape: Vec<i64>,
}

impl RawOutput {
    /// Declared output size: the last dimension of the output shape.
    pub fn output_len(&self) -> usize {
        match self.shape.last() {
            Some(&d) if d > 0 => d as usize,
            _ => self.data.len(),
        }
    }
}

/// Normalization divisor for quantized outputs.
pub const QUANTIZED_OUTPUT_SCALE: f32 = 255.0;

/// Convert a raw output tensor into `output_len()` normalized floats.
///
/// Float32 passes through. UInt8 and Int8 are divided by 255; the Int8 rule
/// keeps the sign and is not a scale/zero-point dequantization.
pub fn extract_output(raw: &RawOutput) -> Result<Vec<f32>> {
    let len = raw.output_len();
    if raw.data.len() < len {
        return Err(Error::BufferLength {
            expected: len,
            actual: raw.data.len(),
        });
    }

    let values = match &raw.data {
        TensorData::Float32(v) => v[..len].to_vec(),
        TensorData::UInt8(v) => v[..len]
            .iter()
            .map(|&x| x as f32 / QUANTIZED_OUTPUT_SCALE)
            .collect(),
        TensorData::Int8(v) => v[..len]
            .iter()
            .map(|&x| x as f32 / QUANTIZED_OUTPUT_SCALE)
            .collect(),
    };
    Ok(values)
}
