//! ONNX model inspection and in-memory graph construction.

use std::path::Path;

use anyhow::{Context, Result};
use prost::Message;
use serde::Serialize;

/// Generated ONNX protobuf types from `proto/onnx.proto3`.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

use proto::attribute_proto::AttributeType;

/// `TensorProto.DataType` values used by this crate.
pub mod elem {
    pub const FLOAT: i32 = 1;
    pub const UINT8: i32 = 2;
    pub const INT8: i32 = 3;
    pub const INT64: i32 = 7;
}

/// IR version 8 pairs with opsets up to 18.
pub const IR_VERSION: i64 = 8;
/// Opset 18 is the first whose `Resize` takes an `axes` attribute.
pub const OPSET_VERSION: i64 = 18;

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    /// Human-readable data type, e.g. "float32", "uint8".
    pub data_type: String,
    /// Dimensions. `-1` represents a dynamic/symbolic dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInspection {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    /// Sum of all initializer tensor element counts.
    pub param_count: u64,
    pub op_count: usize,
    /// Distinct operator types in first-seen order.
    pub op_types: Vec<String>,
}

fn data_type_name(dt: i32) -> String {
    match dt {
        1 => "float32".into(),
        2 => "uint8".into(),
        3 => "int8".into(),
        6 => "int32".into(),
        7 => "int64".into(),
        10 => "float16".into(),
        11 => "float64".into(),
        16 => "bfloat16".into(),
        _ => format!("unknown({dt})"),
    }
}

fn value_info_to_tensor(vi: &proto::ValueInfoProto) -> TensorInfo {
    let (data_type, shape) = vi
        .r#type
        .as_ref()
        .and_then(|tp| tp.value.as_ref())
        .map(|val| match val {
            proto::type_proto::Value::TensorType(t) => {
                let dims = t
                    .shape
                    .as_ref()
                    .map(|s| {
                        s.dim
                            .iter()
                            .map(|d| match &d.value {
                                Some(proto::tensor_shape_proto::dimension::Value::DimValue(v)) => {
                                    *v
                                }
                                _ => -1,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (data_type_name(t.elem_type), dims)
            }
        })
        .unwrap_or_else(|| ("unknown".into(), vec![]));

    TensorInfo {
        name: vi.name.clone(),
        data_type,
        shape,
    }
}

fn tensor_element_count(dims: &[i64]) -> u64 {
    if dims.is_empty() {
        return 0;
    }
    dims.iter()
        .map(|&d| if d > 0 { d as u64 } else { 1 })
        .product()
}

/// Inspect an ONNX model file without loading it into a runtime.
pub fn inspect_onnx(path: &Path) -> Result<ModelInspection> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read ONNX file: {}", path.display()))?;

    inspect_onnx_bytes(&bytes)
}

pub fn inspect_onnx_bytes(bytes: &[u8]) -> Result<ModelInspection> {
    let model = proto::ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);

    let graph = model.graph.as_ref().context("ONNX model has no graph")?;

    // Initializers may also be listed as graph inputs; those are weights.
    let inputs: Vec<TensorInfo> = graph
        .input
        .iter()
        .filter(|vi| !graph.initializer.iter().any(|t| t.name == vi.name))
        .map(value_info_to_tensor)
        .collect();
    let outputs: Vec<TensorInfo> = graph.output.iter().map(value_info_to_tensor).collect();

    let mut op_types: Vec<String> = Vec::new();
    for node in &graph.node {
        if !op_types.contains(&node.op_type) {
            op_types.push(node.op_type.clone());
        }
    }

    let param_count: u64 = graph
        .initializer
        .iter()
        .map(|t| tensor_element_count(&t.dims))
        .sum();

    Ok(ModelInspection {
        ir_version: model.ir_version,
        opset_version,
        producer_name: model.producer_name,
        producer_version: model.producer_version,
        inputs,
        outputs,
        param_count,
        op_count: graph.node.len(),
        op_types,
    })
}

/// Declares a tensor-typed graph input or output. `-1` dims become symbolic.
pub fn tensor_value_info(name: &str, elem_type: i32, dims: &[i64]) -> proto::ValueInfoProto {
    use proto::tensor_shape_proto::{dimension, Dimension};

    let dim = dims
        .iter()
        .enumerate()
        .map(|(i, &d)| Dimension {
            value: Some(if d >= 0 {
                dimension::Value::DimValue(d)
            } else {
                dimension::Value::DimParam(format!("d{i}"))
            }),
        })
        .collect();

    proto::ValueInfoProto {
        name: name.into(),
        r#type: Some(proto::TypeProto {
            value: Some(proto::type_proto::Value::TensorType(
                proto::type_proto::Tensor {
                    elem_type,
                    shape: Some(proto::TensorShapeProto { dim }),
                },
            )),
        }),
    }
}

pub fn attr_string(name: &str, value: &str) -> proto::AttributeProto {
    proto::AttributeProto {
        name: name.into(),
        s: value.as_bytes().to_vec(),
        r#type: AttributeType::String as i32,
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> proto::AttributeProto {
    proto::AttributeProto {
        name: name.into(),
        i: value,
        r#type: AttributeType::Int as i32,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> proto::AttributeProto {
    proto::AttributeProto {
        name: name.into(),
        ints: values.to_vec(),
        r#type: AttributeType::Ints as i32,
        ..Default::default()
    }
}

/// Minimal builder for single-purpose graphs executed from memory.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: proto::GraphProto,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: proto::GraphProto {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn input(mut self, name: &str, elem_type: i32, dims: &[i64]) -> Self {
        self.graph
            .input
            .push(tensor_value_info(name, elem_type, dims));
        self
    }

    pub fn output(mut self, name: &str, elem_type: i32, dims: &[i64]) -> Self {
        self.graph
            .output
            .push(tensor_value_info(name, elem_type, dims));
        self
    }

    pub fn node(
        mut self,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
        attribute: Vec<proto::AttributeProto>,
    ) -> Self {
        let index = self.graph.node.len();
        self.graph.node.push(proto::NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            name: format!("{}_{index}", op_type.to_ascii_lowercase()),
            op_type: op_type.into(),
            attribute,
            domain: String::new(),
        });
        self
    }

    pub fn initializer_i64(mut self, name: &str, dims: &[i64], values: &[i64]) -> Self {
        self.graph.initializer.push(proto::TensorProto {
            dims: dims.to_vec(),
            data_type: elem::INT64,
            int64_data: values.to_vec(),
            name: name.into(),
            ..Default::default()
        });
        self
    }

    pub fn initializer_f32(mut self, name: &str, dims: &[i64], values: &[f32]) -> Self {
        self.graph.initializer.push(proto::TensorProto {
            dims: dims.to_vec(),
            data_type: elem::FLOAT,
            float_data: values.to_vec(),
            name: name.into(),
            ..Default::default()
        });
        self
    }

    pub fn into_model(self) -> proto::ModelProto {
        proto::ModelProto {
            ir_version: IR_VERSION,
            producer_name: env!("CARGO_PKG_NAME").into(),
            producer_version: env!("CARGO_PKG_VERSION").into(),
            graph: Some(self.graph),
            opset_import: vec![proto::OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            ..Default::default()
        }
    }

    pub fn encode(self) -> Vec<u8> {
        self.into_model().encode_to_vec()
    }
}

pub const RESIZE_INPUT: &str = "image";
pub const RESIZE_SIZES: &str = "sizes";
pub const RESIZE_OUTPUT: &str = "resized";

/// One-op bilinear `Resize` over the spatial axes of an NHWC float tensor.
///
/// `coordinate_transformation_mode = asymmetric` maps output pixel `x` to
/// source `x * in / out`, i.e. `align_corners = false` without half-pixel
/// centers.
pub fn bilinear_resize_model(src: [usize; 3], dst_hw: [usize; 2]) -> Vec<u8> {
    let [h, w, c] = src.map(|d| d as i64);
    let [oh, ow] = dst_hw.map(|d| d as i64);

    GraphBuilder::new("bilinear_resize")
        .input(RESIZE_INPUT, elem::FLOAT, &[1, h, w, c])
        .input(RESIZE_SIZES, elem::INT64, &[2])
        .output(RESIZE_OUTPUT, elem::FLOAT, &[1, oh, ow, c])
        .node(
            "Resize",
            &[RESIZE_INPUT, "", "", RESIZE_SIZES],
            &[RESIZE_OUTPUT],
            vec![
                attr_string("mode", "linear"),
                attr_string("coordinate_transformation_mode", "asymmetric"),
                attr_ints("axes", &[1, 2]),
            ],
        )
        .encode()
}
