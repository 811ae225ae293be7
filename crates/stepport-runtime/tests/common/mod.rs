#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{bail, Result};
use bytes::Bytes;
use stepport_backend_cpu::CpuBackend;
use stepport_core::{
    Backend, BackendCapabilities, DataFlow, Device, DeviceTarget, Graph, GraphArtifact,
    GraphSpec, IOName, InputShapeInfo, Loss, Optimizer, SessionKind, Shape, Tensor, TensorInfo,
    WeightStore,
};
use stepport_proto::{load_graph, ModelBuilder};
use stepport_runtime::{Session, SessionOptions};

/// `Relu(x · w)` with `x: [2, 3]` and `w: [3, 4]` padding each row with a zero.
pub fn dense_model() -> Bytes {
    let mut b = ModelBuilder::new("dense");
    let x = b.add_input_tensor("x", &TensorInfo::f32(&[2, 3]));
    let w = b.add_initialized_input_tensor(
        "w",
        &Tensor::from_f32(
            Shape::from_slice(&[3, 4]),
            &[
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        ),
    );
    let y = b.matmul(&x, &w);
    let out = b.relu(&y);
    b.add_output_tensor(&out);
    b.to_bytes()
}

pub fn dense_graph() -> Result<Graph> {
    load_graph(&GraphArtifact::OnnxBytes(dense_model()), &InputShapeInfo::new())
}

/// `samples` rows of three features counting up from zero.
pub fn ramp(samples: usize) -> Tensor {
    let values: Vec<f32> = (0..samples * 3).map(|v| v as f32).collect();
    Tensor::from_f32(Shape::from_slice(&[samples, 3]), &values)
}

pub fn training() -> SessionKind {
    SessionKind::Training {
        losses: vec![Loss::l1("MatMul:0", "loss", 0.1)],
        optimizer: Optimizer::sgd(0.05),
    }
}

/// A cpu session with its device prepared and weights (and optimizer) pushed.
pub fn ready_session(dataflow: DataFlow, kind: SessionKind, options: SessionOptions) -> Result<Session> {
    let training = kind.is_training();
    let mut session = Session::new(
        &CpuBackend::new(),
        dense_graph()?,
        dataflow,
        DeviceTarget::Cpu,
        kind,
        options,
    )?;
    session.prepare_device()?;
    session.weights_from_host()?;
    if training {
        session.optimizer_from_host()?;
    }
    Ok(session)
}

/// Counters shared between a [`MockBackend`] and the test that built it.
#[derive(Clone, Default)]
pub struct MockProbe {
    pub acquire_failures: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub executions: Arc<AtomicUsize>,
}

impl MockProbe {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Echo device: anchor `y` is input `x`, both `FLOAT[2]`.
pub struct MockBackend {
    pub probe: MockProbe,
    /// Execution (0-based, counted across steps) that fails.
    pub fail_at: Option<usize>,
    /// `(entered, resume)`: execute signals `entered` then blocks on `resume`.
    pub gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl MockBackend {
    pub fn new(probe: MockProbe) -> Self {
        Self {
            probe,
            fail_at: None,
            gate: Mutex::new(None),
        }
    }

    pub fn graph() -> Graph {
        Graph {
            bytes: Bytes::new(),
            inputs: BTreeMap::from([(IOName::from("x"), TensorInfo::f32(&[2]))]),
            weights: WeightStore::new(),
        }
    }
}

pub struct MockDevice {
    target: DeviceTarget,
    spec: GraphSpec,
    probe: MockProbe,
    fail_at: Option<usize>,
    gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl Backend for MockBackend {
    type Device = MockDevice;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_training: false,
            max_partitions: 1,
        }
    }

    fn compile(&self, graph: &Graph, _kind: &SessionKind, target: DeviceTarget) -> Result<MockDevice> {
        let info = TensorInfo::f32(&[2]);
        Ok(MockDevice {
            target,
            spec: GraphSpec {
                inputs: graph.inputs.clone(),
                outputs: BTreeMap::from([
                    (IOName::from("x"), info.clone()),
                    (IOName::from("y"), info),
                ]),
            },
            probe: self.probe.clone(),
            fail_at: self.fail_at,
            gate: self.gate.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.take(),
        })
    }
}

impl Device for MockDevice {
    fn target(&self) -> &DeviceTarget {
        &self.target
    }

    fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    fn acquire(&mut self) -> Result<()> {
        let pending = &self.probe.acquire_failures;
        if pending.load(Ordering::SeqCst) > 0 {
            pending.fetch_sub(1, Ordering::SeqCst);
            bail!("device busy");
        }
        Ok(())
    }

    fn release(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn weights_from_host(&mut self, _weights: &WeightStore) -> Result<()> {
        Ok(())
    }

    fn weights_to_host(&mut self) -> Result<WeightStore> {
        Ok(WeightStore::new())
    }

    fn optimizer_from_host(&mut self, _optimizer: &Optimizer) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, inputs: &[(IOName, Tensor)], fetch: &[IOName]) -> Result<Vec<Tensor>> {
        let call = self.probe.executions.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, resume)) = &self.gate {
            entered.send(())?;
            resume.recv()?;
        }
        if self.fail_at == Some(call) {
            bail!("link reset during execution {call}");
        }
        let x = inputs[0].1.clone();
        Ok(fetch.iter().map(|_| x.clone()).collect())
    }
}
