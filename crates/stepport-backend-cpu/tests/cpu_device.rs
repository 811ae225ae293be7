use anyhow::{ensure, Context, Result};
use stepport_backend_cpu::CpuBackend;
use stepport_core::{
    Backend, DType, Device, DeviceTarget, Graph, GraphArtifact, IOName, InputShapeInfo, Loss,
    Optimizer, SessionKind, Shape, Tensor, TensorInfo,
};
use stepport_proto::{encode_model, load_graph, ModelBuilder};

fn dense_graph() -> Result<Graph> {
    let mut b = ModelBuilder::new("dense");
    let x = b.add_input_tensor("x", &TensorInfo::f32(&[2, 3]));
    let w = b.add_initialized_input_tensor(
        "w",
        &Tensor::from_f32(Shape::from_slice(&[3, 2]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    );
    let y = b.matmul(&x, &w);
    let out = b.relu(&y);
    b.add_output_tensor(&out);
    load_graph(&GraphArtifact::OnnxBytes(b.to_bytes()), &InputShapeInfo::new())
}

fn x() -> Tensor {
    Tensor::from_f32(Shape::from_slice(&[2, 3]), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
}

fn training() -> SessionKind {
    SessionKind::Training {
        losses: vec![Loss::l1("MatMul:0", "loss", 1.0)],
        optimizer: Optimizer::sgd(0.01),
    }
}

#[test]
fn forward_matches_hand_computation() -> Result<()> {
    let graph = dense_graph()?;
    let mut device = CpuBackend::new().compile(&graph, &SessionKind::Inference, DeviceTarget::Cpu)?;
    device.acquire()?;
    device.weights_from_host(&graph.weights)?;

    let out = device.execute(&[(IOName::from("x"), x())], &[IOName::from("Relu:1")])?;
    assert_eq!(out[0].shape().dims(), &[2, 2]);
    assert_eq!(out[0].to_f32()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn training_steps_lower_the_loss() -> Result<()> {
    let graph = dense_graph()?;
    let mut device = CpuBackend::new().compile(&graph, &training(), DeviceTarget::Cpu)?;
    device.acquire()?;
    device.weights_from_host(&graph.weights)?;
    device.optimizer_from_host(&Optimizer::sgd(0.01))?;

    let fetch = [IOName::from("loss")];
    let first = device.execute(&[(IOName::from("x"), x())], &fetch)?[0].to_f32()?[0];
    let second = device.execute(&[(IOName::from("x"), x())], &fetch)?[0].to_f32()?[0];
    assert_eq!(first, 10.0);
    ensure!(second < first, "loss did not decrease: {first} -> {second}");

    let updated = device.weights_to_host()?;
    let w = updated.get(&IOName::from("w")).context("missing w")?.to_f32()?;
    ensure!(w[4] == 5.0 && w[5] == 6.0, "rows without input must not move: {w:?}");
    Ok(())
}

#[test]
fn weight_gradients_are_anchorable() -> Result<()> {
    let graph = dense_graph()?;
    let mut device = CpuBackend::new().compile(&graph, &training(), DeviceTarget::Cpu)?;
    let grad = IOName::from("d__w");
    ensure!(device.spec().output(&grad).is_some(), "d__w should be anchorable");
    ensure!(
        device.spec().output(&IOName::from("d__x")).is_none(),
        "graph inputs have no gradient anchor"
    );

    device.acquire()?;
    device.weights_from_host(&graph.weights)?;
    device.optimizer_from_host(&Optimizer::sgd(0.01))?;
    let out = device.execute(&[(IOName::from("x"), x())], &[grad])?;
    assert_eq!(out[0].to_f32()?, vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn inference_sessions_expose_no_gradients() -> Result<()> {
    let graph = dense_graph()?;
    let device = CpuBackend::new().compile(&graph, &SessionKind::Inference, DeviceTarget::Cpu)?;
    ensure!(
        device.spec().outputs.keys().all(|n| !n.as_str().starts_with("d__")),
        "no gradients without a loss"
    );
    ensure!(device.spec().output(&IOName::from("MatMul:0")).is_some());
    Ok(())
}

#[test]
fn physical_accelerators_cannot_be_acquired() -> Result<()> {
    let graph = dense_graph()?;
    let backend = CpuBackend::new();

    let mut hw = backend.compile(&graph, &SessionKind::Inference, DeviceTarget::Accelerator { index: 0 })?;
    ensure!(hw.acquire().is_err());

    let mut wide = backend.compile(
        &graph,
        &SessionKind::Inference,
        DeviceTarget::Simulated { partitions: 64 },
    )?;
    ensure!(wide.acquire().is_err());

    let mut sim = backend.compile(&graph, &SessionKind::Inference, DeviceTarget::Simulated { partitions: 4 })?;
    sim.acquire()?;
    Ok(())
}

#[test]
fn execute_requires_weights_on_device() -> Result<()> {
    let graph = dense_graph()?;
    let mut device = CpuBackend::new().compile(&graph, &SessionKind::Inference, DeviceTarget::Cpu)?;
    ensure!(device.execute(&[], &[]).is_err(), "not attached yet");
    device.acquire()?;
    ensure!(device.execute(&[(IOName::from("x"), x())], &[]).is_err());
    Ok(())
}

#[test]
fn rejects_unknown_ops_and_dtypes() -> Result<()> {
    let mut b = ModelBuilder::new("odd");
    let x = b.add_input_tensor("x", &TensorInfo::f32(&[2]));
    let y = b.relu(&x);
    b.add_output_tensor(&y);
    let mut model = b.model();
    model.graph.as_mut().context("graph")?.node[0].op_type = "Softmax".to_string();
    let graph = load_graph(
        &GraphArtifact::OnnxBytes(encode_model(&model)),
        &InputShapeInfo::new(),
    )?;
    let err = CpuBackend::new()
        .compile(&graph, &SessionKind::Inference, DeviceTarget::Cpu)
        .err()
        .context("Softmax should not compile")?;
    ensure!(format!("{err:#}").contains("Softmax"), "{err:#}");

    let mut b = ModelBuilder::new("ints");
    let x = b.add_input_tensor("x", &TensorInfo::new(DType::I32, Shape::from_slice(&[2])));
    let y = b.identity(&x);
    b.add_output_tensor(&y);
    let graph = load_graph(&GraphArtifact::OnnxBytes(b.to_bytes()), &InputShapeInfo::new())?;
    ensure!(CpuBackend::new()
        .compile(&graph, &SessionKind::Inference, DeviceTarget::Cpu)
        .is_err());
    Ok(())
}
