use std::path::{Path, PathBuf};

/// Per-session knobs. Passed to [`crate::Session::new`]; there is no
/// process-wide configuration.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Where exported models are written.
    pub log_dir: Option<PathBuf>,
    /// Fail the step (and fault the session) when an anchor holds NaN or Inf.
    pub check_numerics: bool,
    /// Write the trained model to `log_dir` when the device is released.
    pub export_on_release: bool,
}

impl SessionOptions {
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_check_numerics(mut self, enabled: bool) -> Self {
        self.check_numerics = enabled;
        self
    }

    pub fn with_export_on_release(mut self, enabled: bool) -> Self {
        self.export_on_release = enabled;
        self
    }

    pub(crate) fn export_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_deref()
            .filter(|_| self.export_on_release)
            .map(|dir: &Path| dir.join("model.onnx"))
    }
}
