use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::{Error, IOName, Result, Shape, TensorInfo};

/// Prefix the engine gives to gradient tensors.
pub const GRADIENT_PREFIX: &str = "d__";

/// How the values an anchor takes across one step's micro-batches are folded
/// into the single buffer returned to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReductionPolicy {
    /// Keep every micro-batch's value, stacked along the leading dim.
    All,
    /// Element-wise running sum over micro-batches. Samples are also summed
    /// across groups: sample `i` of every micro-batch lands in row `i % (b0 / k)`.
    Sum,
    /// Keep only the last micro-batch's value.
    Final,
}

impl ReductionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ReductionPolicy::All => "ALL",
            ReductionPolicy::Sum => "SUM",
            ReductionPolicy::Final => "FINAL",
        }
    }
}

impl fmt::Display for ReductionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReductionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(ReductionPolicy::All),
            "SUM" => Ok(ReductionPolicy::Sum),
            "FINAL" => Ok(ReductionPolicy::Final),
            _ => Err(Error::UnsupportedReduction(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchorSpec {
    pub name: IOName,
    pub policy: ReductionPolicy,
}

impl AnchorSpec {
    pub fn new(name: impl Into<IOName>, policy: ReductionPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }
}

/// Host-side buffer shape for an anchor whose per-micro-batch value has
/// shape `base`, over `micro_batches` micro-batches per step.
///
/// Rank-0 bases have no leading dim to scale: `All` yields `[k]`, `Sum` and
/// `Final` yield a scalar.
pub fn derive_shape(base: &Shape, policy: ReductionPolicy, micro_batches: usize) -> Result<Shape> {
    if micro_batches == 0 {
        return Err(Error::InvalidConfiguration(
            "micro-batches per step must be at least 1".to_string(),
        ));
    }

    let Some(leading) = base.leading() else {
        return Ok(match policy {
            ReductionPolicy::All => Shape::from_slice(&[micro_batches]),
            ReductionPolicy::Sum | ReductionPolicy::Final => Shape::scalar(),
        });
    };

    let shape = match policy {
        ReductionPolicy::All => {
            let stacked = leading.checked_mul(micro_batches).ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "ALL anchor leading dim {leading} overflows over {micro_batches} micro-batches"
                ))
            })?;
            base.with_leading(stacked)
        }
        ReductionPolicy::Sum => {
            if leading % micro_batches != 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "SUM anchor leading dim {leading} is not divisible by {micro_batches} micro-batches"
                )));
            }
            base.with_leading(leading / micro_batches)
        }
        ReductionPolicy::Final => base.clone(),
    };
    if shape.checked_numel().is_none() {
        return Err(Error::InvalidConfiguration(format!(
            "anchor buffer {shape} has more elements than fit in memory"
        )));
    }
    Ok(shape)
}

/// Per-anchor buffer layout: the micro-batch value and the folded host buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchorLayout {
    pub name: IOName,
    pub policy: ReductionPolicy,
    pub micro_batch: TensorInfo,
    pub buffer: TensorInfo,
}

/// Anchors requested for a session, checked against what the graph produces.
#[derive(Clone, Debug)]
pub struct AnchorRegistry {
    available: BTreeMap<IOName, TensorInfo>,
    anchors: Vec<AnchorSpec>,
    index: HashMap<IOName, usize>,
}

impl AnchorRegistry {
    pub fn new(available: BTreeMap<IOName, TensorInfo>) -> Self {
        Self {
            available,
            anchors: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<IOName>, policy: ReductionPolicy) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicateAnchor(name));
        }
        if !self.available.contains_key(&name) {
            let hint = self.unknown_hint(&name);
            return Err(Error::UnknownTensor { name, hint });
        }
        self.index.insert(name.clone(), self.anchors.len());
        self.anchors.push(AnchorSpec { name, policy });
        Ok(())
    }

    fn unknown_hint(&self, name: &IOName) -> Option<String> {
        let stripped = name.as_str().strip_prefix(GRADIENT_PREFIX)?;
        self.available.contains_key(&IOName::from(stripped)).then(|| {
            format!(
                "`{stripped}` exists, but not every gradient can be anchored: \
                 a tensor that does not lead to the loss has no gradient"
            )
        })
    }

    pub fn get(&self, name: &IOName) -> Option<&AnchorSpec> {
        self.index.get(name).map(|&i| &self.anchors[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnchorSpec> {
        self.anchors.iter()
    }

    pub fn names(&self) -> Vec<IOName> {
        self.anchors.iter().map(|a| a.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Buffer layouts in registration order.
    pub fn layouts(&self, micro_batches: usize) -> Result<Vec<AnchorLayout>> {
        self.anchors
            .iter()
            .map(|anchor| {
                let micro_batch = self.available[&anchor.name].clone();
                let shape = derive_shape(micro_batch.shape(), anchor.policy, micro_batches)?;
                Ok(AnchorLayout {
                    name: anchor.name.clone(),
                    policy: anchor.policy,
                    buffer: TensorInfo::new(micro_batch.dtype(), shape),
                    micro_batch,
                })
            })
            .collect()
    }
}
