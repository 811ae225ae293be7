use std::collections::BTreeMap;
use std::fmt;

use crate::{DType, Error, Shape, TensorInfo};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IOName(pub String);

impl IOName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IOName {
    fn from(s: &str) -> Self {
        IOName(s.to_string())
    }
}

impl From<String> for IOName {
    fn from(s: String) -> Self {
        IOName(s)
    }
}

/// Tensor declaration as read from a model; dims may be left dynamic.
#[derive(Clone, Debug)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    pub fn resolve(&self) -> crate::Result<TensorInfo> {
        let dims = self
            .dims
            .iter()
            .map(|d| {
                d.ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "input `{}` has a dynamic dimension; supply it through InputShapeInfo",
                        self.name
                    ))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(TensorInfo::new(self.dtype, Shape::from_slice(&dims)))
    }
}

/// Caller-declared shapes for graph inputs, taking precedence over the model.
#[derive(Clone, Debug, Default)]
pub struct InputShapeInfo {
    infos: BTreeMap<IOName, TensorInfo>,
}

impl InputShapeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<IOName>, info: TensorInfo) -> &mut Self {
        self.infos.insert(name.into(), info);
        self
    }

    pub fn get(&self, name: &IOName) -> Option<&TensorInfo> {
        self.infos.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IOName, &TensorInfo)> {
        self.infos.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Per-micro-batch tensor declarations of a compiled graph.
///
/// `outputs` lists every tensor the device can hand back as an anchor, not
/// only the graph's declared outputs.
#[derive(Clone, Debug, Default)]
pub struct GraphSpec {
    pub inputs: BTreeMap<IOName, TensorInfo>,
    pub outputs: BTreeMap<IOName, TensorInfo>,
}

impl GraphSpec {
    pub fn input(&self, name: &IOName) -> Option<&TensorInfo> {
        self.inputs.get(name)
    }

    pub fn output(&self, name: &IOName) -> Option<&TensorInfo> {
        self.outputs.get(name)
    }
}
