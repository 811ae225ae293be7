use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, ensure, Context, Result};
use stepport_core::{
    DType, Graph, GraphSpec, IOName, Loss, SessionKind, TensorInfo, GRADIENT_PREFIX,
};
use stepport_proto::onnx::NodeProto;
use stepport_proto::{decode_model, model_graph};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    MatMul,
    Add,
    Relu,
    Identity,
    Scale(f32),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<String>,
    pub output: String,
}

/// A graph lowered for host execution: nodes in execution order plus the
/// info of every tensor they touch.
#[derive(Clone, Debug)]
pub struct Program {
    pub nodes: Vec<Node>,
    pub losses: Vec<Loss>,
    pub infos: BTreeMap<String, TensorInfo>,
    pub weights: Vec<String>,
    /// Weights that receive a gradient from some loss.
    pub trainable: BTreeSet<String>,
    pub spec: GraphSpec,
}

impl Program {
    pub fn compile(graph: &Graph, kind: &SessionKind) -> Result<Self> {
        let model = decode_model(&graph.bytes)?;
        let proto = model_graph(&model)?;

        let mut infos = BTreeMap::new();
        for (name, info) in &graph.inputs {
            infos.insert(name.0.clone(), info.clone());
        }
        for (name, tensor) in graph.weights.iter() {
            infos.insert(name.0.clone(), tensor.info.clone());
        }
        for (name, info) in &infos {
            ensure!(
                info.dtype() == DType::F32,
                "cpu device only executes FLOAT tensors; `{name}` is {info}"
            );
        }

        let mut nodes = Vec::with_capacity(proto.node.len());
        for node in &proto.node {
            let node = lower_node(node)?;
            let input_infos = node
                .inputs
                .iter()
                .map(|name| {
                    infos.get(name).with_context(|| {
                        format!("`{}` reads `{name}` before it is produced", node.output)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let out = infer_shape(node.op, &input_infos)
                .with_context(|| format!("shape inference failed for `{}`", node.output))?;
            ensure!(
                infos.insert(node.output.clone(), out).is_none(),
                "tensor `{}` is produced twice",
                node.output
            );
            nodes.push(node);
        }

        let losses = kind.losses().to_vec();
        for loss in &losses {
            ensure!(
                infos.contains_key(loss.input().as_str()),
                "loss reads unknown tensor `{}`",
                loss.input()
            );
            ensure!(
                infos
                    .insert(loss.output().0.clone(), TensorInfo::f32(&[]))
                    .is_none(),
                "loss output `{}` collides with a graph tensor",
                loss.output()
            );
        }
        if kind.is_training() {
            ensure!(!losses.is_empty(), "a training session needs at least one loss");
        }

        let weights: Vec<String> = graph.weights.names().map(|n| n.0.clone()).collect();
        let trainable = if kind.is_training() {
            upstream_of(&nodes, &losses)
                .into_iter()
                .filter(|name| weights.contains(name))
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut outputs: BTreeMap<IOName, TensorInfo> = infos
            .iter()
            .map(|(name, info)| (IOName(name.clone()), info.clone()))
            .collect();
        for name in &trainable {
            outputs.insert(
                IOName(format!("{GRADIENT_PREFIX}{name}")),
                infos[name].clone(),
            );
        }

        Ok(Self {
            nodes,
            losses,
            spec: GraphSpec {
                inputs: graph.inputs.clone(),
                outputs,
            },
            infos,
            weights,
            trainable,
        })
    }
}

fn lower_node(node: &NodeProto) -> Result<Node> {
    let op = match node.op_type.as_str() {
        "MatMul" => Op::MatMul,
        "Add" => Op::Add,
        "Relu" => Op::Relu,
        "Identity" => Op::Identity,
        "Scale" => {
            let factor = node
                .attribute
                .iter()
                .find(|a| a.name == "scale")
                .map(|a| a.f)
                .context("Scale node needs a `scale` attribute")?;
            Op::Scale(factor)
        }
        other => bail!("cpu device does not implement op `{other}`"),
    };

    let arity = match op {
        Op::MatMul | Op::Add => 2,
        Op::Relu | Op::Identity | Op::Scale(_) => 1,
    };
    ensure!(
        node.input.len() == arity,
        "{} expects {arity} inputs, got {}",
        node.op_type,
        node.input.len()
    );
    let [output] = node.output.as_slice() else {
        bail!("{} must have exactly one output", node.op_type);
    };

    Ok(Node {
        op,
        inputs: node.input.clone(),
        output: output.clone(),
    })
}

fn infer_shape(op: Op, inputs: &[&TensorInfo]) -> Result<TensorInfo> {
    match op {
        Op::MatMul => {
            let (a, b) = (inputs[0].shape().dims(), inputs[1].shape().dims());
            let ([n, k], [k2, m]) = (a, b) else {
                bail!("MatMul needs rank-2 operands, got {} and {}", inputs[0], inputs[1]);
            };
            ensure!(k == k2, "MatMul inner dims differ: {k} vs {k2}");
            Ok(TensorInfo::f32(&[*n, *m]))
        }
        Op::Add => {
            let (a, b) = (inputs[0].shape(), inputs[1].shape());
            let bias = b.rank() == 1 && a.rank() == 2 && a.dims()[1] == b.dims()[0];
            ensure!(a == b || bias, "Add cannot broadcast {b} onto {a}");
            Ok(inputs[0].clone())
        }
        Op::Relu | Op::Identity | Op::Scale(_) => Ok(inputs[0].clone()),
    }
}

/// Every tensor some loss depends on.
fn upstream_of(nodes: &[Node], losses: &[Loss]) -> BTreeSet<String> {
    let mut live: BTreeSet<String> = losses.iter().map(|l| l.input().0.clone()).collect();
    for node in nodes.iter().rev() {
        if live.contains(&node.output) {
            live.extend(node.inputs.iter().cloned());
        }
    }
    live
}
