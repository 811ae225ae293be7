use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;

use crate::{IOName, TensorInfo, WeightStore};

#[derive(Clone, Debug)]
pub enum GraphArtifact {
    OnnxBytes(Bytes),
    OnnxPath(PathBuf),
}

impl GraphArtifact {
    pub fn read(&self) -> std::io::Result<Bytes> {
        match self {
            GraphArtifact::OnnxBytes(bytes) => Ok(bytes.clone()),
            GraphArtifact::OnnxPath(path) => std::fs::read(path).map(Bytes::from),
        }
    }
}

/// A graph as handed over by its supplier: the serialized model, the
/// resolved shapes of its streamed inputs, and its initial weights.
#[derive(Clone, Debug)]
pub struct Graph {
    pub bytes: Bytes,
    pub inputs: BTreeMap<IOName, TensorInfo>,
    pub weights: WeightStore,
}
