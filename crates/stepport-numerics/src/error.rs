use stepport_core::IOName;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NumericsError>;

#[derive(Debug, Error)]
pub enum NumericsError {
    #[error("cannot compare {left} elements with {right}{}", render_name(.name))]
    LengthMismatch {
        name: Option<IOName>,
        left: usize,
        right: usize,
    },
    #[error("relative error is NaN{}", render_name(.name))]
    NaNResult { name: Option<IOName> },
    #[error("relative error {error:e} for `{name}` exceeds tolerance {tolerance:e}")]
    ToleranceExceeded {
        name: IOName,
        error: f64,
        tolerance: f64,
    },
    #[error("cannot read model: {0}")]
    Model(String),
}

fn render_name(name: &Option<IOName>) -> String {
    name.as_ref().map(|n| format!(" for `{n}`")).unwrap_or_default()
}

impl NumericsError {
    pub(crate) fn named(self, tensor: &IOName) -> Self {
        match self {
            NumericsError::LengthMismatch { left, right, .. } => NumericsError::LengthMismatch {
                name: Some(tensor.clone()),
                left,
                right,
            },
            NumericsError::NaNResult { .. } => NumericsError::NaNResult {
                name: Some(tensor.clone()),
            },
            other => other,
        }
    }
}
