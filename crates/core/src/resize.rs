//! Input adaptation: bilinear resize of HWC images to a model's input shape.
//!
//! The default [`ResizeStrategy::Graph`] runs a one-op `Resize` graph through
//! ONNX Runtime. [`ResizeStrategy::Direct`] computes the same asymmetric
//! bilinear sampling in Rust and needs no runtime library.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use ndarray::{Array1, Array4};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::build_session_from_memory;
use crate::error::{Error, Result};
use crate::onnx::{bilinear_resize_model, RESIZE_INPUT, RESIZE_OUTPUT, RESIZE_SIZES};
use crate::selector::DEFAULT_CPU_THREADS;
use crate::tensor::{
    truncate_i8, truncate_u8, ImageInput, InputData, InputTensor, TensorData, TensorSpec,
};

/// How bilinear resizing is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeStrategy {
    /// Single-op `Resize` graph executed by ONNX Runtime.
    #[default]
    Graph,
    /// Bilinear sampling computed in Rust.
    Direct,
}

impl ResizeStrategy {
    /// Parse from string (case-insensitive). Returns `Graph` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "native" | "rust" => Self::Direct,
            _ => Self::Graph,
        }
    }
}

impl fmt::Display for ResizeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph => write!(f, "graph"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Height, width and channel count of an HWC image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Element count. Overflows for shapes that fail [`Self::checked_len`].
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// Element count, or `None` if it does not fit in `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.height
            .checked_mul(self.width)?
            .checked_mul(self.channels)
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0 || self.channels == 0
    }

    fn invalid(&self) -> Error {
        Error::InvalidShape {
            height: self.height,
            width: self.width,
            channels: self.channels,
        }
    }

    /// Non-empty and addressable.
    fn validate(&self) -> Result<usize> {
        match self.checked_len() {
            Some(len) if len > 0 => Ok(len),
            _ => Err(self.invalid()),
        }
    }

    fn check_buffer(&self, actual: usize) -> Result<()> {
        let expected = self.validate()?;
        if actual != expected {
            return Err(Error::BufferLength { expected, actual });
        }
        Ok(())
    }
}

impl From<&TensorSpec> for ImageShape {
    fn from(spec: &TensorSpec) -> Self {
        Self::new(spec.height, spec.width, spec.channels)
    }
}

/// Compiled resize graph for one source/target shape pair.
struct ResizeGraph {
    session: Session,
    from: ImageShape,
    to: ImageShape,
}

impl ResizeGraph {
    fn new(from: ImageShape, to: ImageShape) -> Result<Self> {
        let model = bilinear_resize_model(
            [from.height, from.width, from.channels],
            [to.height, to.width],
        );
        let session = build_session_from_memory(&model, DEFAULT_CPU_THREADS).map_err(|e| {
            Error::SessionBuild {
                path: PathBuf::from("<resize graph>"),
                source: e.into(),
            }
        })?;
        debug!(?from, ?to, "Built resize graph");
        Ok(Self { session, from, to })
    }

    fn run(&mut self, src: &[f32]) -> Result<Vec<f32>> {
        let from = self.from;
        let image = Tensor::from_array(Array4::from_shape_vec(
            (1, from.height, from.width, from.channels),
            src.to_vec(),
        )?)?;
        let sizes = Tensor::from_array(Array1::from_vec(vec![
            self.to.height as i64,
            self.to.width as i64,
        ]))?;

        let outputs = self
            .session
            .run(ort::inputs![RESIZE_INPUT => image, RESIZE_SIZES => sizes])?;
        let resized = outputs[RESIZE_OUTPUT].try_extract_array::<f32>()?;
        let data: Vec<f32> = resized.iter().copied().collect();
        self.to.check_buffer(data.len())?;
        Ok(data)
    }
}

/// Resizes HWC images to model input shapes, caching one graph per shape pair.
pub struct Resizer {
    strategy: ResizeStrategy,
    graphs: HashMap<(ImageShape, ImageShape), ResizeGraph>,
}

impl Default for Resizer {
    fn default() -> Self {
        Self::new(ResizeStrategy::default())
    }
}

impl Resizer {
    pub fn new(strategy: ResizeStrategy) -> Self {
        Self {
            strategy,
            graphs: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> ResizeStrategy {
        self.strategy
    }

    /// Number of resize graphs built so far.
    pub fn cached_graphs(&self) -> usize {
        self.graphs.len()
    }

    /// Resample `src` from `from` to the spatial size of `to`. Equal shapes
    /// return a copy.
    pub fn resample(&mut self, src: &[f32], from: ImageShape, to: ImageShape) -> Result<Vec<f32>> {
        from.validate()?;
        to.validate()?;
        from.check_buffer(src.len())?;
        if from.channels != to.channels {
            return Err(Error::ChannelMismatch {
                source_channels: from.channels,
                target_channels: to.channels,
            });
        }
        if from == to {
            return Ok(src.to_vec());
        }

        match self.strategy {
            ResizeStrategy::Direct => Ok(bilinear_resize(src, from, to)),
            ResizeStrategy::Graph => {
                let graph = match self.graphs.entry((from, to)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(ResizeGraph::new(from, to)?)
                    }
                };
                graph.run(src)
            }
        }
    }

    pub fn resize_float(
        &mut self,
        src: &[f32],
        from: ImageShape,
        dst: &mut [f32],
        to: ImageShape,
    ) -> Result<()> {
        to.check_buffer(dst.len())?;
        let resized = self.resample(src, from, to)?;
        dst.copy_from_slice(&resized);
        Ok(())
    }

    pub fn resize_to_u8(
        &mut self,
        src: &[i32],
        from: ImageShape,
        dst: &mut [u8],
        to: ImageShape,
    ) -> Result<()> {
        to.check_buffer(dst.len())?;
        let resized = self.resample(&widen(src), from, to)?;
        for (d, v) in dst.iter_mut().zip(resized) {
            *d = truncate_u8(v);
        }
        Ok(())
    }

    pub fn resize_to_i8(
        &mut self,
        src: &[i32],
        from: ImageShape,
        dst: &mut [i8],
        to: ImageShape,
    ) -> Result<()> {
        to.check_buffer(dst.len())?;
        let resized = self.resample(&widen(src), from, to)?;
        for (d, v) in dst.iter_mut().zip(resized) {
            *d = truncate_i8(v);
        }
        Ok(())
    }

    /// Adapt a caller image to `spec`: resize when the shapes differ, encode
    /// for the model's input type, then lay out for the model.
    ///
    /// Float images require a float model and quantized images a quantized
    /// one.
    pub fn prepare_input(
        &mut self,
        input: &ImageInput<'_>,
        spec: &TensorSpec,
    ) -> Result<InputTensor> {
        input.validate()?;

        let values: Vec<f32> = match (&input.data, spec.encoding.is_quantized()) {
            (InputData::Float(data), false) => data.to_vec(),
            (InputData::Quantized(data), true) => widen(data),
            (data, _) => {
                return Err(Error::EncodingMismatch {
                    expected: spec.encoding,
                    requested: data.kind(),
                })
            }
        };

        let from = ImageShape::new(input.height, input.width, input.channels);
        let to = ImageShape::from(spec);
        let values = self.resample(&values, from, to)?;
        if from != to {
            debug!(?from, ?to, strategy = %self.strategy, "Resized input");
        }

        let data = TensorData::encode(values, spec.encoding);
        Ok(InputTensor::from_hwc(data, spec))
    }
}

/// Quantized pixel values as floats for resampling.
fn widen(src: &[i32]) -> Vec<f32> {
    src.iter().map(|&x| x as f32).collect()
}

/// Bilinear resize for f32 HWC data with any channel count.
///
/// Output pixel `x` samples source coordinate `x * in / out` (asymmetric,
/// corners not aligned); the far neighbour clamps at the edge.
pub fn bilinear_resize(src: &[f32], from: ImageShape, to: ImageShape) -> Vec<f32> {
    let c = from.channels;
    let mut dst = vec![0.0f32; to.len()];

    let scale_y = from.height as f32 / to.height as f32;
    let scale_x = from.width as f32 / to.width as f32;

    for dst_y in 0..to.height {
        let src_yf = (dst_y as f32 * scale_y).min((from.height - 1) as f32);
        let src_y0 = src_yf.floor() as usize;
        let src_y1 = (src_y0 + 1).min(from.height - 1);
        let fy = src_yf - src_y0 as f32;

        for dst_x in 0..to.width {
            let src_xf = (dst_x as f32 * scale_x).min((from.width - 1) as f32);
            let src_x0 = src_xf.floor() as usize;
            let src_x1 = (src_x0 + 1).min(from.width - 1);
            let fx = src_xf - src_x0 as f32;

            let di = (dst_y * to.width + dst_x) * c;

            for ch in 0..c {
                let p00 = src[(src_y0 * from.width + src_x0) * c + ch];
                let p10 = src[(src_y0 * from.width + src_x1) * c + ch];
                let p01 = src[(src_y1 * from.width + src_x0) * c + ch];
                let p11 = src[(src_y1 * from.width + src_x1) * c + ch];

                let top = p00 + (p10 - p00) * fx;
                let bot = p01 + (p11 - p01) * fx;
                dst[di + ch] = top + (bot - top) * fy;
            }
        }
    }

    dst
}

/// Resize `src` into `dst` as f32 using a fresh graph resizer.
pub fn resize_float(src: &[f32], from: ImageShape, dst: &mut [f32], to: ImageShape) -> Result<()> {
    Resizer::default().resize_float(src, from, dst, to)
}

/// Resize quantized `src` into `dst`, truncating each value to u8.
pub fn resize_to_u8(src: &[i32], from: ImageShape, dst: &mut [u8], to: ImageShape) -> Result<()> {
    Resizer::default().resize_to_u8(src, from, dst, to)
}

/// Resize quantized `src` into `dst`, truncating each value to i8.
pub fn resize_to_i8(src: &[i32], from: ImageShape, dst: &mut [i8], to: ImageShape) -> Result<()> {
    Resizer::default().resize_to_i8(src, from, dst, to)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::tensor::{NumericEncoding, TensorLayout, TensorSpec};

    fn direct() -> Resizer {
        Resizer::new(ResizeStrategy::Direct)
    }

    #[test]
    fn test_strategy_from_str_lossy() {
        assert_eq!(ResizeStrategy::from_str_lossy("direct"), ResizeStrategy::Direct);
        assert_eq!(ResizeStrategy::from_str_lossy("DIRECT"), ResizeStrategy::Direct);
        assert_eq!(ResizeStrategy::from_str_lossy("graph"), ResizeStrategy::Graph);
        assert_eq!(ResizeStrategy::from_str_lossy("bogus"), ResizeStrategy::Graph);
        assert_eq!(ResizeStrategy::default().to_string(), "graph");
    }

    #[test]
    fn test_asymmetric_upscale_row() {
        let src = [0.0, 10.0];
        let out = bilinear_resize(&src, ImageShape::new(1, 2, 1), ImageShape::new(1, 4, 1));
        assert_eq!(out, vec![0.0, 5.0, 10.0, 10.0]);
    }

    #[test]
    fn test_downscale_takes_top_left_samples() {
        // 4x4 ramp down to 2x2 lands exactly on source pixels 0 and 2.
        let src: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let out = bilinear_resize(&src, ImageShape::new(4, 4, 1), ImageShape::new(2, 2, 1));
        assert_eq!(out, vec![0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn test_resize_dimensions() {
        let from = ImageShape::new(512, 512, 3);
        let to = ImageShape::new(224, 224, 3);
        let src = vec![0.25f32; from.len()];
        let out = direct().resample(&src, from, to).unwrap();
        assert_eq!(out.len(), 224 * 224 * 3);
    }

    #[test]
    fn test_channel_mismatch_is_rejected() {
        let err = direct()
            .resample(&[0.0; 12], ImageShape::new(2, 2, 3), ImageShape::new(4, 4, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ChannelMismatch {
                source_channels: 3,
                target_channels: 1
            }
        ));
    }

    #[test]
    fn test_wrong_source_length_is_rejected() {
        let err = direct()
            .resample(&[0.0; 5], ImageShape::new(2, 2, 1), ImageShape::new(4, 4, 1))
            .unwrap_err();
        assert!(matches!(err, Error::BufferLength { expected: 4, actual: 5 }));
    }

    #[test]
    fn test_zero_sized_target_is_rejected() {
        let err = direct()
            .resample(&[0.0; 4], ImageShape::new(2, 2, 1), ImageShape::new(0, 4, 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));
    }

    #[test]
    fn test_resize_to_u8_truncates() {
        let mut dst = [0u8; 4];
        direct()
            .resize_to_u8(
                &[0, 11],
                ImageShape::new(1, 2, 1),
                &mut dst,
                ImageShape::new(1, 4, 1),
            )
            .unwrap();
        assert_eq!(dst, [0, 5, 11, 11]);
    }

    #[test]
    fn test_resize_to_i8_saturates() {
        let mut dst = [0i8; 2];
        direct()
            .resize_to_i8(
                &[-300, 300],
                ImageShape::new(1, 2, 1),
                &mut dst,
                ImageShape::new(1, 2, 1),
            )
            .unwrap();
        assert_eq!(dst, [-128, 127]);
    }

    #[test]
    fn test_destination_length_checked_first() {
        let mut dst = [0.0f32; 3];
        let err = direct()
            .resize_float(
                &[0.0; 4],
                ImageShape::new(2, 2, 1),
                &mut dst,
                ImageShape::new(2, 2, 1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BufferLength { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_prepare_input_equal_shape_is_copy() {
        let spec = TensorSpec::nhwc(2, 2, 1, NumericEncoding::Float32);
        let data = [0.1, 0.2, 0.3, 0.4];
        let tensor = direct()
            .prepare_input(&ImageInput::float(&data, 2, 2, 1), &spec)
            .unwrap();
        assert_eq!(tensor.data, TensorData::Float32(data.to_vec()));
        assert_eq!(tensor.dims, [1, 2, 2, 1]);
    }

    #[test]
    fn test_prepare_input_quantized_copy() {
        let spec = TensorSpec::nhwc(1, 3, 1, NumericEncoding::UInt8Quantized);
        let data = [0, 128, 255];
        let tensor = direct()
            .prepare_input(&ImageInput::quantized(&data, 1, 3, 1), &spec)
            .unwrap();
        assert_eq!(tensor.data, TensorData::UInt8(vec![0, 128, 255]));
    }

    #[test]
    fn test_prepare_input_encoding_mismatch() {
        let quantized = TensorSpec::nhwc(1, 1, 1, NumericEncoding::Int8Quantized);
        let err = direct()
            .prepare_input(&ImageInput::float(&[0.5], 1, 1, 1), &quantized)
            .unwrap_err();
        assert!(matches!(err, Error::EncodingMismatch { .. }));

        let float = TensorSpec::nhwc(1, 1, 1, NumericEncoding::Float32);
        let err = direct()
            .prepare_input(&ImageInput::quantized(&[1], 1, 1, 1), &float)
            .unwrap_err();
        assert!(matches!(err, Error::EncodingMismatch { .. }));
    }

    #[test]
    fn test_prepare_input_nchw_resized_and_reordered() {
        let spec = TensorSpec {
            layout: TensorLayout::Nchw,
            ..TensorSpec::nhwc(2, 2, 2, NumericEncoding::Float32)
        };
        // 1x1 RGB-ish pixel upscaled to 2x2 then split into planes.
        let tensor = direct()
            .prepare_input(&ImageInput::float(&[1.0, 2.0], 1, 1, 2), &spec)
            .unwrap();
        assert_eq!(tensor.dims, [1, 2, 2, 2]);
        assert_eq!(
            tensor.data,
            TensorData::Float32(vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0])
        );
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        let huge = ImageShape::new(usize::MAX / 2, 3, 1);
        assert_eq!(huge.checked_len(), None);
        assert_eq!(ImageShape::new(2, 3, 4).checked_len(), Some(24));

        let err = direct()
            .resample(&[0.0; 4], huge, ImageShape::new(2, 2, 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));

        let mut dst = [0u8; 4];
        let err = direct()
            .resize_to_u8(&[0; 4], ImageShape::new(2, 2, 1), &mut dst, huge)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));
    }

    #[test]
    fn test_graph_strategy_same_shape_needs_no_graph() {
        let mut resizer = Resizer::new(ResizeStrategy::Graph);
        let shape = ImageShape::new(3, 2, 2);
        let src: Vec<f32> = (0..12).map(|v| v as f32).collect();
        assert_eq!(resizer.resample(&src, shape, shape).unwrap(), src);
        assert_eq!(resizer.cached_graphs(), 0);
    }

    #[test]
    fn test_direct_strategy_builds_no_graphs() {
        let mut resizer = direct();
        resizer
            .resample(&[0.0; 4], ImageShape::new(2, 2, 1), ImageShape::new(3, 3, 1))
            .unwrap();
        assert_eq!(resizer.cached_graphs(), 0);
    }

    fn shape() -> impl Strategy<Value = ImageShape> {
        (1usize..12, 1usize..12, 1usize..4).prop_map(|(h, w, c)| ImageShape::new(h, w, c))
    }

    proptest! {
        #[test]
        fn constant_image_stays_constant(
            from in shape(),
            (th, tw) in (1usize..12, 1usize..12),
            value in -1000.0f32..1000.0,
        ) {
            let to = ImageShape::new(th, tw, from.channels);
            let src = vec![value; from.len()];
            let out = direct().resample(&src, from, to).unwrap();
            prop_assert_eq!(out.len(), to.len());
            prop_assert!(out.iter().all(|&v| v == value));
        }

        #[test]
        fn same_shape_is_identity(
            from in shape(),
            seed in proptest::collection::vec(-1.0f32..1.0, 1..432),
        ) {
            let src: Vec<f32> = (0..from.len()).map(|i| seed[i % seed.len()]).collect();
            prop_assert_eq!(bilinear_resize(&src, from, from), src.clone());
            prop_assert_eq!(direct().resample(&src, from, from).unwrap(), src);
        }

        #[test]
        fn quantized_constant_image_stays_constant(
            from in shape(),
            (th, tw) in (1usize..12, 1usize..12),
            value in 0i32..=255,
        ) {
            let to = ImageShape::new(th, tw, from.channels);
            let mut resizer = direct();
            let src = vec![value; from.len()];
            let mut dst = vec![0u8; to.len()];
            resizer.resize_to_u8(&src, from, &mut dst, to).unwrap();
            prop_assert!(dst.iter().all(|&v| i32::from(v) == value));

            // Same resizer, same shapes: the second call must agree.
            let mut again = vec![0u8; to.len()];
            resizer.resize_to_u8(&src, from, &mut again, to).unwrap();
            prop_assert_eq!(dst, again);
        }

        #[test]
        fn graph_resizer_same_shape_is_identity(
            from in shape(),
            seed in proptest::collection::vec(-1.0f32..1.0, 1..432),
        ) {
            let src: Vec<f32> = (0..from.len()).map(|i| seed[i % seed.len()]).collect();
            let mut resizer = Resizer::new(ResizeStrategy::Graph);
            let mut dst = vec![0.0f32; from.len()];
            resizer.resize_float(&src, from, &mut dst, from).unwrap();
            prop_assert_eq!(dst, src);
            prop_assert_eq!(resizer.cached_graphs(), 0);
        }

        #[test]
        fn output_stays_within_source_range(
            from in shape(),
            (th, tw) in (1usize..12, 1usize..12),
            seed in proptest::collection::vec(0.0f32..255.0, 1..64),
        ) {
            let to = ImageShape::new(th, tw, from.channels);
            let src: Vec<f32> = (0..from.len()).map(|i| seed[i % seed.len()]).collect();
            let lo = src.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let out = bilinear_resize(&src, from, to);
            prop_assert!(out.iter().all(|&v| v >= lo - 1e-3 && v <= hi + 1e-3));
        }
    }
}
