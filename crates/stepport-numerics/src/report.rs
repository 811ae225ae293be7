use std::fmt::Write as _;

use stepport_core::{IOName, Tensor, WeightStore};
use stepport_proto::read_weights;
use tracing::debug;

use crate::{check_result, relative_error, tensor_values, NumericsError, Result};

/// Compares how two training runs moved the same weights.
///
/// Run A goes from `a0` to `a1`, run B from `b0` to `b1`. For every weight
/// all four models share, the report holds the relative error between the
/// updates `a1 - a0` and `b1 - b0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NumericsReport {
    errors: Vec<(IOName, f64)>,
}

impl NumericsReport {
    /// Builds the report from four serialized models.
    pub fn from_models(a0: &[u8], a1: &[u8], b0: &[u8], b1: &[u8]) -> Result<Self> {
        let read = |bytes: &[u8]| read_weights(bytes).map_err(|e| NumericsError::Model(format!("{e:#}")));
        Self::from_weights(&read(a0)?, &read(a1)?, &read(b0)?, &read(b1)?)
    }

    pub fn from_weights(
        a0: &WeightStore,
        a1: &WeightStore,
        b0: &WeightStore,
        b1: &WeightStore,
    ) -> Result<Self> {
        let mut errors = Vec::new();
        for (name, a0_t) in a0.iter() {
            let (Some(a1_t), Some(b0_t), Some(b1_t)) = (a1.get(name), b0.get(name), b1.get(name))
            else {
                continue;
            };
            let update = |from: &Tensor, to: &Tensor| -> Result<Vec<f64>> {
                let (from, to) = (tensor_values(from)?, tensor_values(to)?);
                if from.len() != to.len() {
                    return Err(NumericsError::LengthMismatch {
                        name: Some(name.clone()),
                        left: from.len(),
                        right: to.len(),
                    });
                }
                Ok(to.iter().zip(&from).map(|(t, f)| t - f).collect())
            };
            let error = relative_error(&update(a0_t, a1_t)?, &update(b0_t, b1_t)?)
                .map_err(|e| e.named(name))?;
            debug!(weight = %name, error, "update compared");
            errors.push((name.clone(), error));
        }
        Ok(Self { errors })
    }

    pub fn get(&self, name: &IOName) -> Option<f64> {
        self.errors.iter().find(|(n, _)| n == name).map(|(_, e)| *e)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Sum of the per-weight errors.
    pub fn total(&self) -> f64 {
        self.errors.iter().map(|(_, e)| e).sum()
    }

    /// One `name : error` line per weight.
    pub fn full_report(&self) -> String {
        let width = self.errors.iter().map(|(n, _)| n.as_str().len()).max().unwrap_or(0);
        let mut out = String::new();
        for (name, error) in &self.errors {
            let _ = writeln!(out, "{:<width$} : {error:e}", name.as_str());
        }
        out
    }

    /// Fails on the first weight whose update error exceeds `tolerance`.
    pub fn assert_within(&self, tolerance: f64) -> Result<()> {
        for (name, error) in &self.errors {
            check_result(name, *error, tolerance)?;
        }
        Ok(())
    }
}
