use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use prost::Message;
use stepport_core::{
    bytes_from_f32, DType, Error, Graph, GraphArtifact, IOName, InputShapeInfo, Shape, Tensor,
    TensorSpec, WeightStore,
};
use tracing::{debug, warn};

use crate::onnx::{GraphProto, ModelProto, TensorProto, ValueInfoProto};

pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    ModelProto::decode(bytes).context("failed to decode model protobuf")
}

pub fn encode_model(model: &ModelProto) -> Bytes {
    Bytes::from(model.encode_to_vec())
}

pub fn model_graph(model: &ModelProto) -> Result<&GraphProto> {
    model.graph.as_ref().context("model has no graph")
}

pub fn tensor_from_proto(proto: &TensorProto) -> Result<Tensor> {
    let dtype = DType::from_onnx_code(proto.data_type).with_context(|| {
        format!(
            "tensor `{}` has unsupported data type {}",
            proto.name, proto.data_type
        )
    })?;
    let dims = proto
        .dims
        .iter()
        .map(|&d| {
            usize::try_from(d).with_context(|| format!("negative dim {d} in `{}`", proto.name))
        })
        .collect::<Result<Vec<_>>>()?;
    let shape = Shape::from_slice(&dims);

    let data = if !proto.raw_data.is_empty() {
        proto.raw_data.clone()
    } else if !proto.float_data.is_empty() {
        if dtype != DType::F32 {
            bail!("tensor `{}` stores float_data but is {dtype}", proto.name);
        }
        bytes_from_f32(&proto.float_data)
    } else {
        Bytes::new()
    };

    let tensor = Tensor::from_cpu_bytes(dtype, shape, data);
    let expected = tensor.info.nbytes();
    if tensor.data.len() != expected {
        bail!(
            "tensor `{}` holds {} bytes, expected {expected} for {}",
            proto.name,
            tensor.data.len(),
            tensor.info
        );
    }
    Ok(tensor)
}

pub fn tensor_to_proto(name: &IOName, tensor: &Tensor) -> TensorProto {
    TensorProto {
        dims: tensor.shape().dims().iter().map(|&d| d as i64).collect(),
        data_type: tensor.dtype().onnx_code(),
        float_data: Vec::new(),
        name: name.0.clone(),
        raw_data: tensor.data.clone(),
    }
}

pub fn value_info_spec(info: &ValueInfoProto) -> Result<TensorSpec> {
    let tensor_type = info
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .with_context(|| format!("value `{}` is not a tensor", info.name))?;
    let dtype = DType::from_onnx_code(tensor_type.elem_type).with_context(|| {
        format!(
            "value `{}` has unsupported element type {}",
            info.name, tensor_type.elem_type
        )
    })?;
    let dims = tensor_type
        .shape
        .as_ref()
        .map(|s| {
            s.dim
                .iter()
                .map(|d| d.dim_value.and_then(|v| usize::try_from(v).ok()))
                .collect()
        })
        .unwrap_or_default();

    Ok(TensorSpec {
        name: IOName(info.name.clone()),
        dtype,
        dims,
    })
}

pub fn graph_weights(graph: &GraphProto) -> Result<WeightStore> {
    graph
        .initializer
        .iter()
        .map(|t| Ok((IOName(t.name.clone()), tensor_from_proto(t)?)))
        .collect()
}

/// Initializers of a serialized model, by name.
pub fn read_weights(bytes: &[u8]) -> Result<WeightStore> {
    let model = decode_model(bytes)?;
    graph_weights(model_graph(&model)?)
}

/// Reads a model and resolves its streamed inputs.
///
/// Inputs listed as initializers are weights, not streamed inputs. Shapes in
/// `shapes` take precedence over the model's own value infos; naming anything
/// but a streamed input there fails with [`Error::UnknownTensor`].
pub fn load_graph(artifact: &GraphArtifact, shapes: &InputShapeInfo) -> Result<Graph> {
    let bytes = artifact.read().context("failed to read model")?;
    let model = decode_model(&bytes)?;
    let graph = model_graph(&model)?;

    let weights = graph_weights(graph)?;

    let mut inputs = BTreeMap::new();
    for value in &graph.input {
        let name = IOName(value.name.clone());
        if weights.contains(&name) {
            continue;
        }
        let info = match shapes.get(&name) {
            Some(info) => info.clone(),
            None => value_info_spec(value)?.resolve()?,
        };
        inputs.insert(name, info);
    }

    if let Some((name, _)) = shapes.iter().find(|(n, _)| !inputs.contains_key(*n)) {
        let hint = if weights.contains(name) {
            "it is a weight; only streamed inputs take a shape"
        } else {
            "it is not an input of the graph"
        };
        return Err(Error::UnknownTensor {
            name: name.clone(),
            hint: Some(hint.to_string()),
        }
        .into());
    }

    debug!(
        graph = %graph.name,
        inputs = inputs.len(),
        weights = weights.len(),
        "loaded graph"
    );
    Ok(Graph {
        bytes,
        inputs,
        weights,
    })
}

/// Replaces the payload of every initializer named in `weights` and
/// re-serializes the model.
pub fn merge_weights(bytes: &[u8], weights: &WeightStore) -> Result<Bytes> {
    let mut model = decode_model(bytes)?;
    let graph = model.graph.as_mut().context("model has no graph")?;

    let mut merged = HashSet::new();
    for init in graph.initializer.iter_mut() {
        let name = IOName(init.name.clone());
        if let Some(tensor) = weights.get(&name) {
            *init = tensor_to_proto(&name, tensor);
            merged.insert(name);
        }
    }
    for name in weights.names().filter(|n| !merged.contains(*n)) {
        warn!(weight = %name, "weight has no initializer in the model; not exported");
    }

    Ok(encode_model(&model))
}
