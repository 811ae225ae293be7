use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::{Error, Graph, GraphSpec, IOName, Optimizer, SessionKind, Tensor, WeightStore};

/// Where a session's graph runs. Opaque to the session itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceTarget {
    Cpu,
    /// Software-simulated accelerator split into `partitions` parts.
    Simulated { partitions: u32 },
    Accelerator { index: u32 },
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTarget::Cpu => f.write_str("cpu"),
            DeviceTarget::Simulated { partitions } => write!(f, "sim:{partitions}"),
            DeviceTarget::Accelerator { index } => write!(f, "hw:{index}"),
        }
    }
}

impl FromStr for DeviceTarget {
    type Err = Error;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("cpu") {
            return Ok(DeviceTarget::Cpu);
        }

        let invalid = || {
            Error::InvalidConfiguration(format!(
                "unsupported device: {raw} (expected cpu, sim:N or hw:N)"
            ))
        };
        if let Some(rest) = raw.strip_prefix("sim:") {
            let partitions: u32 = rest.parse().map_err(|_| invalid())?;
            if partitions == 0 {
                return Err(invalid());
            }
            return Ok(DeviceTarget::Simulated { partitions });
        }
        if let Some(rest) = raw.strip_prefix("hw:") {
            let index: u32 = rest.parse().map_err(|_| invalid())?;
            return Ok(DeviceTarget::Accelerator { index });
        }

        Err(invalid())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub supports_training: bool,
    pub max_partitions: u32,
}

pub trait Backend: Send + Sync + 'static {
    type Device: Device;

    fn name(&self) -> &'static str;
    fn capabilities(&self) -> BackendCapabilities;

    /// Compiles `graph` for `target`. No hardware is touched until
    /// [`Device::acquire`].
    fn compile(&self, graph: &Graph, kind: &SessionKind, target: DeviceTarget)
        -> Result<Self::Device>;
}

/// A compiled graph bound to a device target.
///
/// Object-safe so sessions can hold any backend's device.
pub trait Device: Send + 'static {
    fn target(&self) -> &DeviceTarget;

    /// Every tensor the device can return, with its per-micro-batch info.
    fn spec(&self) -> &GraphSpec;

    /// Blocks until the hardware is attached.
    fn acquire(&mut self) -> Result<()>;
    fn release(&mut self);

    fn weights_from_host(&mut self, weights: &WeightStore) -> Result<()>;
    fn weights_to_host(&mut self) -> Result<WeightStore>;
    fn optimizer_from_host(&mut self, optimizer: &Optimizer) -> Result<()>;

    /// Runs one micro-batch and returns the `fetch` tensors in order.
    fn execute(&mut self, inputs: &[(IOName, Tensor)], fetch: &[IOName]) -> Result<Vec<Tensor>>;
}
