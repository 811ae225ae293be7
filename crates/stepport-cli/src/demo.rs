use anyhow::{ensure, Result};
use stepport_core::{DType, Shape, Tensor, TensorInfo};
use stepport_proto::ModelBuilder;

pub const FEATURES: usize = 4;
const HIDDEN: usize = 8;
const CLASSES: usize = 2;

/// Deterministic values in `[-0.5, 0.5)` so runs are reproducible.
fn pattern(len: usize, salt: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + salt * 13 + 3) % 17) as f32 / 17.0 - 0.5)
        .collect()
}

/// `MatMul(Relu(x · w1 + b1), w2)`: tensors `MatMul:0`, `Add:1`, `Relu:2`,
/// `MatMul:3`.
pub fn demo_model(batch_size: usize) -> ModelBuilder {
    let mut b = ModelBuilder::new("demo");
    let x = b.add_input_tensor("x", &TensorInfo::f32(&[batch_size, FEATURES]));
    let w1 = b.add_initialized_input_tensor(
        "w1",
        &Tensor::from_f32(Shape::from_slice(&[FEATURES, HIDDEN]), &pattern(FEATURES * HIDDEN, 1)),
    );
    let b1 = b.add_initialized_input_tensor(
        "b1",
        &Tensor::from_f32(Shape::from_slice(&[HIDDEN]), &[0.1; HIDDEN]),
    );
    let w2 = b.add_initialized_input_tensor(
        "w2",
        &Tensor::from_f32(Shape::from_slice(&[HIDDEN, CLASSES]), &pattern(HIDDEN * CLASSES, 2)),
    );
    let h = b.matmul(&x, &w1);
    let h = b.add(&h, &b1);
    let h = b.relu(&h);
    let y = b.matmul(&h, &w2);
    b.add_output_tensor(&y);
    b
}

/// `samples` rows of input shaped like `micro_batch` along its outer axis.
pub fn synthetic_input(micro_batch: &TensorInfo, samples: usize, salt: usize) -> Result<Tensor> {
    ensure!(
        micro_batch.dtype() == DType::F32,
        "synthetic data is only generated for FLOAT inputs, got {micro_batch}"
    );
    ensure!(micro_batch.shape().rank() > 0, "scalar inputs have no sample axis");
    let shape = micro_batch.shape().with_leading(samples);
    let values = pattern(shape.numel(), salt);
    Ok(Tensor::from_f32(shape, &values))
}
