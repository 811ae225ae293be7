use bytes::Bytes;
use stepport_core::{DType, IOName, Tensor, TensorInfo};

use crate::codec::{encode_model, tensor_to_proto};
use crate::onnx::{
    attribute_type, AttributeProto, Dimension, GraphProto, ModelProto, NodeProto,
    OperatorSetIdProto, TensorShapeProto, TensorTypeProto, TypeProto, ValueInfoProto,
};

const OPSET_VERSION: i64 = 11;

/// Builds models in code, one op at a time.
///
/// Every op returns the name of its output tensor, generated from the op
/// type and a running counter (`MatMul:0`, `Relu:1`, ...).
#[derive(Debug, Default)]
pub struct ModelBuilder {
    graph: GraphProto,
    next_id: usize,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: GraphProto {
                name: name.to_string(),
                ..GraphProto::default()
            },
            next_id: 0,
        }
    }

    pub fn add_input_tensor(&mut self, name: &str, info: &TensorInfo) -> IOName {
        self.graph.input.push(value_info(name, Some(info)));
        IOName::from(name)
    }

    /// An input whose `None` dims are left for the session's `InputShapeInfo`.
    pub fn add_dynamic_input_tensor(
        &mut self,
        name: &str,
        dtype: DType,
        dims: &[Option<usize>],
    ) -> IOName {
        self.graph.input.push(ValueInfoProto {
            name: name.to_string(),
            r#type: Some(tensor_type(dtype, dims)),
        });
        IOName::from(name)
    }

    /// A weight: listed both as an initializer and as a graph input.
    pub fn add_initialized_input_tensor(&mut self, name: &str, init: &Tensor) -> IOName {
        let id = IOName::from(name);
        self.graph.initializer.push(tensor_to_proto(&id, init));
        self.graph.input.push(value_info(name, Some(&init.info)));
        id
    }

    pub fn add_output_tensor(&mut self, name: &IOName) {
        self.graph.output.push(value_info(name.as_str(), None));
    }

    pub fn matmul(&mut self, lhs: &IOName, rhs: &IOName) -> IOName {
        self.op("MatMul", &[lhs, rhs], Vec::new())
    }

    pub fn add(&mut self, lhs: &IOName, rhs: &IOName) -> IOName {
        self.op("Add", &[lhs, rhs], Vec::new())
    }

    pub fn relu(&mut self, x: &IOName) -> IOName {
        self.op("Relu", &[x], Vec::new())
    }

    pub fn identity(&mut self, x: &IOName) -> IOName {
        self.op("Identity", &[x], Vec::new())
    }

    pub fn scale(&mut self, x: &IOName, factor: f32) -> IOName {
        let attr = AttributeProto {
            name: "scale".to_string(),
            f: factor,
            r#type: attribute_type::FLOAT,
            ..AttributeProto::default()
        };
        self.op("Scale", &[x], vec![attr])
    }

    fn op(&mut self, op_type: &str, inputs: &[&IOName], attribute: Vec<AttributeProto>) -> IOName {
        let out = format!("{op_type}:{}", self.next_id);
        self.next_id += 1;
        self.graph.node.push(NodeProto {
            input: inputs.iter().map(|n| n.0.clone()).collect(),
            output: vec![out.clone()],
            name: out.clone(),
            op_type: op_type.to_string(),
            attribute,
            domain: String::new(),
        });
        IOName(out)
    }

    pub fn model(&self) -> ModelProto {
        ModelProto {
            ir_version: 6,
            producer_name: "stepport".to_string(),
            graph: Some(self.graph.clone()),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        encode_model(&self.model())
    }
}

fn value_info(name: &str, info: Option<&TensorInfo>) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: info.map(|info| {
            let dims: Vec<_> = info.shape().dims().iter().map(|&d| Some(d)).collect();
            tensor_type(info.dtype(), &dims)
        }),
    }
}

fn tensor_type(dtype: DType, dims: &[Option<usize>]) -> TypeProto {
    let dim = dims
        .iter()
        .enumerate()
        .map(|(axis, d)| match d {
            Some(v) => Dimension {
                dim_value: Some(*v as i64),
                dim_param: None,
            },
            None => Dimension {
                dim_value: None,
                dim_param: Some(format!("d{axis}")),
            },
        })
        .collect();
    TypeProto {
        tensor_type: Some(TensorTypeProto {
            elem_type: dtype.onnx_code(),
            shape: Some(TensorShapeProto { dim }),
        }),
    }
}
