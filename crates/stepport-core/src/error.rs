use thiserror::Error;

use crate::IOName;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("anchor `{0}` is already registered")]
    DuplicateAnchor(IOName),
    #[error("tensor `{name}` is not produced by the graph{}", render_hint(.hint))]
    UnknownTensor { name: IOName, hint: Option<String> },
    #[error("no data supplied for graph input `{0}`")]
    MissingInput(IOName),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unsupported reduction `{0}` (expected ALL, SUM or FINAL)")]
    UnsupportedReduction(String),
    #[error("shape mismatch for `{name}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: IOName,
        expected: String,
        actual: String,
    },
    #[error("device `{target}` is unavailable: {reason}")]
    DeviceUnavailable { target: String, reason: String },
    #[error("device is already prepared")]
    AlreadyPrepared,
    #[error("device has not been prepared")]
    DeviceNotPrepared,
    #[error("host weights changed since the last weights_from_host")]
    WeightsStale,
    #[error("optimizer changed since the last optimizer_from_host")]
    OptimizerStale,
    #[error("session is faulted and must be rebuilt")]
    SessionFaulted,
    #[error("another step is already running on this session")]
    ConcurrentAccess,
    #[error("anchor `{0}` holds a non-finite value")]
    Numerical(IOName),
    #[error("model error: {0}")]
    Model(String),
    #[error("device error: {0:#}")]
    Device(anyhow::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_hint(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(". {h}")).unwrap_or_default()
}

impl Error {
    /// Errors raised while configuring a session, never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateAnchor(_)
                | Error::UnknownTensor { .. }
                | Error::InvalidConfiguration(_)
                | Error::UnsupportedReduction(_)
        )
    }
}
