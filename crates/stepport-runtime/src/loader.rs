use anyhow::{ensure, Context, Result};
use stepport_core::{IOName, Tensor, TensorInfo};
use tracing::debug;

use crate::{add_step_dimension, StepInputs};

/// Cuts a dataset into step-sized inputs.
///
/// Every tensor of the dataset holds samples along its outer axis. Each step
/// takes `micro_batches * batch_size` consecutive samples; a trailing
/// remainder too short for a full step is dropped.
#[derive(Clone, Debug)]
pub struct StepLoader {
    dataset: Vec<(IOName, Tensor)>,
    micro_batches: usize,
    samples_per_step: usize,
    samples: usize,
    stepped: bool,
    cursor: usize,
}

impl StepLoader {
    pub fn new(dataset: StepInputs, micro_batches: usize, batch_size: usize) -> Result<Self> {
        ensure!(micro_batches > 0 && batch_size > 0, "micro-batches and batch size must be positive");
        ensure!(!dataset.is_empty(), "dataset is empty");

        let mut samples = None;
        for (name, tensor) in dataset.iter() {
            let n = tensor
                .shape()
                .leading()
                .with_context(|| format!("dataset tensor `{name}` is a scalar"))?;
            match samples {
                None => samples = Some(n),
                Some(m) => ensure!(m == n, "dataset tensor `{name}` has {n} samples, expected {m}"),
            }
        }
        let samples = samples.unwrap_or_default();
        let samples_per_step = micro_batches * batch_size;
        ensure!(
            samples >= samples_per_step,
            "dataset of {samples} samples is smaller than one step of {samples_per_step}"
        );
        debug!(samples, samples_per_step, steps = samples / samples_per_step, "step loader ready");

        Ok(Self {
            dataset: dataset.iter().map(|(n, t)| (n.clone(), t.clone())).collect(),
            micro_batches,
            samples_per_step,
            samples,
            stepped: false,
            cursor: 0,
        })
    }

    /// Emit `[k, b, ...]` tensors instead of flat `[k * b, ...]` ones.
    pub fn with_step_dimension(mut self, stepped: bool) -> Self {
        self.stepped = stepped;
        self
    }

    /// Full steps per pass over the dataset.
    pub fn steps(&self) -> usize {
        self.samples / self.samples_per_step
    }

    /// Starts the next pass from the first sample.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn slice(&self, tensor: &Tensor, start: usize) -> Result<Tensor> {
        let row = tensor.info.nbytes() / self.samples;
        let info = TensorInfo::new(
            tensor.dtype(),
            tensor.shape().with_leading(self.samples_per_step),
        );
        let step = tensor.view(start * row, info)?;
        if self.stepped {
            add_step_dimension(&step, self.micro_batches)
        } else {
            Ok(step)
        }
    }
}

impl Iterator for StepLoader {
    type Item = Result<StepInputs>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + self.samples_per_step > self.samples {
            return None;
        }
        let start = self.cursor;
        self.cursor += self.samples_per_step;
        Some(
            self.dataset
                .iter()
                .map(|(name, tensor)| Ok((name.clone(), self.slice(tensor, start)?)))
                .collect(),
        )
    }
}
