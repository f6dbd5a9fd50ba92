//! On-device image-model inference over ONNX Runtime.
//!
//! A [`PredictionContext`] owns one model loaded for the runtime chosen by a
//! mode code, adapts caller images to the model's input shape and encoding,
//! and keeps the normalized output of the last prediction.

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod labels;
pub mod logging;
pub mod onnx;
pub mod profile;
pub mod resize;
pub mod runtime;
pub mod selector;
pub mod session;
pub mod tensor;

pub use context::PredictionContext;
pub use error::{Error, Result};
pub use resize::{resize_float, resize_to_i8, resize_to_u8, ImageShape, ResizeStrategy, Resizer};
pub use selector::{RuntimeMode, RuntimeSelection, RuntimeTarget};
pub use session::{InferenceSession, SessionOptions};
pub use tensor::{ImageInput, NumericEncoding, TensorSpec};
