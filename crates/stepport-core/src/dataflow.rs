use std::collections::HashSet;

use crate::{AnchorSpec, Error, IOName, ReductionPolicy, Result};

/// What the host exchanges with the device each step: how many micro-batches
/// make up a step and which tensors come back.
#[derive(Clone, Debug)]
pub struct DataFlow {
    batches_per_step: usize,
    anchors: Vec<AnchorSpec>,
}

impl DataFlow {
    pub fn new<I, N>(batches_per_step: usize, anchors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, ReductionPolicy)>,
        N: Into<IOName>,
    {
        if batches_per_step == 0 {
            return Err(Error::InvalidConfiguration(
                "batches per step must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        for (name, policy) in anchors {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(Error::DuplicateAnchor(name));
            }
            specs.push(AnchorSpec { name, policy });
        }

        Ok(Self {
            batches_per_step,
            anchors: specs,
        })
    }

    /// Like [`DataFlow::new`] with policies given by name (`"ALL"`, `"SUM"`, `"FINAL"`).
    pub fn from_names<'a, I>(batches_per_step: usize, anchors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let parsed = anchors
            .into_iter()
            .map(|(name, policy)| Ok((name, policy.parse::<ReductionPolicy>()?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(batches_per_step, parsed)
    }

    pub fn batches_per_step(&self) -> usize {
        self.batches_per_step
    }

    pub fn anchors(&self) -> &[AnchorSpec] {
        &self.anchors
    }

    pub fn n_anchors(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_anchored(&self, name: &IOName) -> bool {
        self.anchors.iter().any(|a| &a.name == name)
    }
}
