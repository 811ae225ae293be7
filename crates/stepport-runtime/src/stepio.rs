use std::collections::BTreeMap;

use stepport_core::{
    derive_shape, Error, IOName, ReductionPolicy, Result, Tensor, TensorInfo,
};

/// Host data for one step, by graph input name.
///
/// Each tensor carries every micro-batch of the step along its outer axis,
/// either flat (`[k * b, ...]`) or with an explicit step axis (`[k, b, ...]`).
#[derive(Clone, Debug, Default)]
pub struct StepInputs {
    tensors: BTreeMap<IOName, Tensor>,
}

impl StepInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<IOName>, tensor: Tensor) -> &mut Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    pub fn with(mut self, name: impl Into<IOName>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &IOName) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IOName, &Tensor)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl FromIterator<(IOName, Tensor)> for StepInputs {
    fn from_iter<T: IntoIterator<Item = (IOName, Tensor)>>(iter: T) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Reshapes a flat `[k * b, ...]` tensor to `[k, b, ...]`.
pub fn add_step_dimension(tensor: &Tensor, micro_batches: usize) -> anyhow::Result<Tensor> {
    anyhow::ensure!(micro_batches > 0, "micro-batch count must be at least 1");
    let Some(outer) = tensor.shape().leading() else {
        anyhow::bail!("cannot add a step dimension to a scalar");
    };
    anyhow::ensure!(
        outer % micro_batches == 0,
        "outer dimension {outer} is not divisible into {micro_batches} micro-batches"
    );
    let shape = tensor
        .shape()
        .with_leading(outer / micro_batches)
        .prepend(micro_batches);
    tensor.reshape(shape)
}

/// A validated step input, ready to be cut into micro-batches.
#[derive(Clone, Debug)]
pub(crate) struct Stream {
    pub name: IOName,
    pub tensor: Tensor,
    pub micro_batch: TensorInfo,
}

impl Stream {
    /// Zero-copy view of micro-batch `index`. Both accepted layouts place
    /// micro-batches contiguously.
    pub fn micro_batch(&self, index: usize) -> anyhow::Result<Tensor> {
        self.tensor
            .view(index * self.micro_batch.nbytes(), self.micro_batch.clone())
    }
}

/// Checks `inputs` against the graph's per-micro-batch input infos.
///
/// Nothing is copied; the returned streams share the callers' payloads.
pub(crate) fn validate_inputs(
    expected: &BTreeMap<IOName, TensorInfo>,
    inputs: &StepInputs,
    micro_batches: usize,
) -> Result<Vec<Stream>> {
    if let Some(name) = inputs.tensors.keys().find(|n| !expected.contains_key(*n)) {
        return Err(Error::UnknownTensor {
            name: name.clone(),
            hint: Some("it is not an input of the graph".to_string()),
        });
    }

    let mut streams = Vec::with_capacity(expected.len());
    for (name, micro_batch) in expected {
        let tensor = inputs
            .get(name)
            .ok_or_else(|| Error::MissingInput(name.clone()))?;

        let flat = TensorInfo::new(
            micro_batch.dtype(),
            derive_shape(micro_batch.shape(), ReductionPolicy::All, micro_batches)?,
        );
        let stepped = TensorInfo::new(
            micro_batch.dtype(),
            micro_batch.shape().prepend(micro_batches),
        );
        let layout = if tensor.info == flat {
            flat
        } else if tensor.info == stepped {
            stepped
        } else {
            return Err(Error::ShapeMismatch {
                name: name.clone(),
                expected: format!("{flat} or {stepped}"),
                actual: tensor.info.to_string(),
            });
        };
        layout.validate(name, tensor)?;

        streams.push(Stream {
            name: name.clone(),
            tensor: tensor.clone(),
            micro_batch: micro_batch.clone(),
        });
    }
    Ok(streams)
}
