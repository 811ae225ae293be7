mod kernels;
mod program;

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, ensure, Context, Result};
use stepport_core::{
    Backend, BackendCapabilities, Device, DeviceTarget, Graph, GraphSpec, IOName, Loss,
    LossReduction, Optimizer, SessionKind, Shape, Tensor, WeightStore, GRADIENT_PREFIX,
};
use tracing::{debug, info};

pub use program::{Op, Program};

const MAX_SIMULATED_PARTITIONS: u32 = 16;

/// Runs graphs on the host, either as a plain CPU target or as a simulated
/// multi-partition accelerator.
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpuDevice {
    target: DeviceTarget,
    program: Program,
    training: bool,
    attached: bool,
    weights: Option<BTreeMap<String, Vec<f32>>>,
    optimizer: Option<Optimizer>,
}

impl Backend for CpuBackend {
    type Device = CpuDevice;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_training: true,
            max_partitions: MAX_SIMULATED_PARTITIONS,
        }
    }

    fn compile(&self, graph: &Graph, kind: &SessionKind, target: DeviceTarget) -> Result<CpuDevice> {
        let program = Program::compile(graph, kind).context("failed to compile graph for cpu")?;
        debug!(
            %target,
            nodes = program.nodes.len(),
            anchorable = program.spec.outputs.len(),
            "compiled graph"
        );
        Ok(CpuDevice {
            target,
            program,
            training: kind.is_training(),
            attached: false,
            weights: None,
            optimizer: None,
        })
    }
}

impl Device for CpuDevice {
    fn target(&self) -> &DeviceTarget {
        &self.target
    }

    fn spec(&self) -> &GraphSpec {
        &self.program.spec
    }

    fn acquire(&mut self) -> Result<()> {
        match self.target {
            DeviceTarget::Cpu => {}
            DeviceTarget::Simulated { partitions } => ensure!(
                partitions <= MAX_SIMULATED_PARTITIONS,
                "simulator supports at most {MAX_SIMULATED_PARTITIONS} partitions, requested {partitions}"
            ),
            DeviceTarget::Accelerator { index } => {
                bail!("no physical accelerator {index} is attached to this host")
            }
        }
        self.attached = true;
        info!(target = %self.target, "device attached");
        Ok(())
    }

    fn release(&mut self) {
        if self.attached {
            self.attached = false;
            self.weights = None;
            self.optimizer = None;
            info!(target = %self.target, "device released");
        }
    }

    fn weights_from_host(&mut self, weights: &WeightStore) -> Result<()> {
        ensure!(self.attached, "device is not attached");
        let mut device = BTreeMap::new();
        for name in &self.program.weights {
            let tensor = weights
                .get(&IOName(name.clone()))
                .with_context(|| format!("host has no value for weight `{name}`"))?;
            ensure!(
                tensor.info == self.program.infos[name],
                "weight `{name}` is {}, device expects {}",
                tensor.info,
                self.program.infos[name]
            );
            device.insert(name.clone(), tensor.to_f32()?);
        }
        self.weights = Some(device);
        Ok(())
    }

    fn weights_to_host(&mut self) -> Result<WeightStore> {
        let weights = self.weights.as_ref().context("device holds no weights")?;
        Ok(weights
            .iter()
            .map(|(name, values)| {
                let shape = self.program.infos[name].shape().clone();
                (IOName(name.clone()), Tensor::from_f32(shape, values))
            })
            .collect())
    }

    fn optimizer_from_host(&mut self, optimizer: &Optimizer) -> Result<()> {
        ensure!(self.attached, "device is not attached");
        self.optimizer = Some(*optimizer);
        Ok(())
    }

    fn execute(&mut self, inputs: &[(IOName, Tensor)], fetch: &[IOName]) -> Result<Vec<Tensor>> {
        ensure!(self.attached, "device is not attached");
        let weights = self.weights.as_mut().context("weights were never written to the device")?;

        let mut values: HashMap<String, Vec<f32>> = HashMap::new();
        for (name, tensor) in inputs {
            values.insert(name.0.clone(), tensor.to_f32()?);
        }
        for (name, w) in weights.iter() {
            values.insert(name.clone(), w.clone());
        }

        forward(&self.program, &mut values)?;

        let mut grads = HashMap::new();
        if self.training {
            let optimizer = self
                .optimizer
                .context("optimizer was never written to the device")?;
            grads = backward(&self.program, &values)?;
            for name in &self.program.trainable {
                let Some(grad) = grads.get(name) else {
                    continue;
                };
                let w = weights.get_mut(name).context("weight vanished")?;
                let (lr, wd) = (optimizer.learning_rate(), optimizer.weight_decay());
                for (w, g) in w.iter_mut().zip(grad) {
                    *w -= lr * (g + wd * *w);
                }
            }
        }

        fetch
            .iter()
            .map(|name| {
                let (data, info_key) = match name.as_str().strip_prefix(GRADIENT_PREFIX) {
                    Some(w) if self.program.trainable.contains(w) => (
                        grads.get(w).cloned().unwrap_or_else(|| {
                            vec![0.0; self.program.infos[w].numel()]
                        }),
                        w,
                    ),
                    _ => (
                        values
                            .get(name.as_str())
                            .cloned()
                            .with_context(|| format!("tensor `{name}` was not computed"))?,
                        name.as_str(),
                    ),
                };
                let shape: Shape = self
                    .program
                    .infos
                    .get(info_key)
                    .with_context(|| format!("no info for `{name}`"))?
                    .shape()
                    .clone();
                Ok(Tensor::from_f32(shape, &data))
            })
            .collect()
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn dims2(program: &Program, name: &str) -> Result<(usize, usize)> {
    match program.infos[name].shape().dims() {
        [r, c] => Ok((*r, *c)),
        other => bail!("`{name}` is not rank 2: {other:?}"),
    }
}

fn value<'a>(values: &'a HashMap<String, Vec<f32>>, name: &str) -> Result<&'a [f32]> {
    values
        .get(name)
        .map(Vec::as_slice)
        .with_context(|| format!("`{name}` is not available"))
}

fn forward(program: &Program, values: &mut HashMap<String, Vec<f32>>) -> Result<()> {
    for node in &program.nodes {
        let arg = |i: usize| value(&*values, &node.inputs[i]);
        let out = match node.op {
            Op::MatMul => {
                let (n, k) = dims2(program, &node.inputs[0])?;
                let (_, m) = dims2(program, &node.inputs[1])?;
                kernels::matmul(arg(0)?, arg(1)?, n, k, m)
            }
            Op::Add => kernels::add(arg(0)?, arg(1)?),
            Op::Relu => kernels::relu(arg(0)?),
            Op::Identity => arg(0)?.to_vec(),
            Op::Scale(f) => kernels::scale(arg(0)?, f),
        };
        values.insert(node.output.clone(), out);
    }

    for loss in &program.losses {
        let Loss::L1 {
            input,
            output,
            lambda,
            reduction,
        } = loss;
        let x = value(values, input.as_str())?;
        let total: f32 = x.iter().map(|v| v.abs()).sum();
        let loss_value = match reduction {
            LossReduction::Sum => lambda * total,
            LossReduction::Mean => lambda * total / x.len().max(1) as f32,
        };
        values.insert(output.0.clone(), vec![loss_value]);
    }
    Ok(())
}

fn backward(
    program: &Program,
    values: &HashMap<String, Vec<f32>>,
) -> Result<HashMap<String, Vec<f32>>> {
    let mut grads: HashMap<String, Vec<f32>> = HashMap::new();

    for loss in &program.losses {
        let Loss::L1 {
            input,
            lambda,
            reduction,
            ..
        } = loss;
        let x = value(values, input.as_str())?;
        let scale = match reduction {
            LossReduction::Sum => *lambda,
            LossReduction::Mean => lambda / x.len().max(1) as f32,
        };
        let g: Vec<f32> = x.iter().map(|v| scale * sign(*v)).collect();
        kernels::accumulate(grads.entry(input.0.clone()).or_default(), &g);
    }

    for node in program.nodes.iter().rev() {
        let Some(dy) = grads.get(&node.output).cloned() else {
            continue;
        };
        let x = |i: usize| value(values, &node.inputs[i]);
        let mut push = |i: usize, g: &[f32]| {
            kernels::accumulate(grads.entry(node.inputs[i].clone()).or_default(), g)
        };
        match node.op {
            Op::MatMul => {
                let (n, k) = dims2(program, &node.inputs[0])?;
                let (_, m) = dims2(program, &node.inputs[1])?;
                let (da, db) = kernels::matmul_grad(x(0)?, x(1)?, &dy, n, k, m);
                push(0, &da);
                push(1, &db);
            }
            Op::Add => {
                let db = kernels::unbroadcast(&dy, x(1)?.len());
                push(0, &dy);
                push(1, &db);
            }
            Op::Relu => push(0, &kernels::relu_grad(x(0)?, &dy)),
            Op::Identity => push(0, &dy),
            Op::Scale(f) => push(0, &kernels::scale(&dy, f)),
        }
    }
    Ok(grads)
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
