use std::collections::BTreeMap;

use stepport_core::{DType, IOName, Tensor};

use crate::{NumericsError, Result};

/// Keeps all-zero inputs from dividing by zero.
pub const EPSILON: f64 = 1e-8;

/// `‖a − b‖ / (√(‖a‖² · ‖b‖²) + ε)`, accumulated in `f64`.
///
/// Zero for identical inputs and symmetric in its arguments.
pub fn relative_error(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(NumericsError::LengthMismatch {
            name: None,
            left: a.len(),
            right: b.len(),
        });
    }
    let (mut diff, mut ss_a, mut ss_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        diff += (x - y) * (x - y);
        ss_a += x * x;
        ss_b += y * y;
    }
    let error = diff.sqrt() / ((ss_a * ss_b).sqrt() + EPSILON);
    if error.is_nan() {
        return Err(NumericsError::NaNResult { name: None });
    }
    Ok(error)
}

/// Element values of a numeric tensor, widened to `f64`.
pub fn tensor_values(tensor: &Tensor) -> Result<Vec<f64>> {
    let data = &tensor.data;
    let values = match tensor.dtype() {
        DType::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            .collect(),
        DType::I32 => data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            .collect(),
        DType::I64 => data
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                i64::from_le_bytes(raw) as f64
            })
            .collect(),
        DType::U8 => data.iter().map(|&b| b as f64).collect(),
        DType::F16 => {
            return Err(NumericsError::Model(
                "FLOAT16 tensors cannot be compared".to_string(),
            ))
        }
    };
    Ok(values)
}

pub fn tensor_error(name: &IOName, a: &Tensor, b: &Tensor) -> Result<f64> {
    relative_error(&tensor_values(a)?, &tensor_values(b)?).map_err(|e| e.named(name))
}

/// Fails when `error` is NaN or above `margin`.
pub fn check_result(name: &IOName, error: f64, margin: f64) -> Result<()> {
    if error.is_nan() {
        return Err(NumericsError::NaNResult {
            name: Some(name.clone()),
        });
    }
    if error > margin {
        return Err(NumericsError::ToleranceExceeded {
            name: name.clone(),
            error,
            tolerance: margin,
        });
    }
    Ok(())
}

/// Relative error of every tensor name two runs share, in name order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Comparison {
    errors: Vec<(IOName, f64)>,
}

impl Comparison {
    pub fn get(&self, name: &IOName) -> Option<f64> {
        self.errors.iter().find(|(n, _)| n == name).map(|(_, e)| *e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IOName, f64)> {
        self.errors.iter().map(|(n, e)| (n, *e))
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The largest error and its tensor.
    pub fn worst(&self) -> Option<(&IOName, f64)> {
        self.iter().max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Compares two sets of named tensors.
///
/// Names present on one side only are skipped. Any NaN error is reported
/// before tolerance is checked; otherwise the first tensor (by name) above
/// `tolerance` fails the comparison.
pub fn compare<'a, A, B>(a: A, b: B, tolerance: f64) -> Result<Comparison>
where
    A: IntoIterator<Item = (&'a IOName, &'a Tensor)>,
    B: IntoIterator<Item = (&'a IOName, &'a Tensor)>,
{
    let a: BTreeMap<&IOName, &Tensor> = a.into_iter().collect();
    let b: BTreeMap<&IOName, &Tensor> = b.into_iter().collect();

    let mut errors = Vec::new();
    for (name, left) in &a {
        let Some(right) = b.get(name) else {
            continue;
        };
        errors.push(((*name).clone(), tensor_error(name, left, right)?));
    }

    let comparison = Comparison { errors };
    for (name, error) in comparison.iter() {
        check_result(name, error, tolerance)?;
    }
    Ok(comparison)
}
