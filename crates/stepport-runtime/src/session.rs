use std::path::Path;

use bytes::Bytes;
use stepport_core::{
    AnchorRegistry, Backend, DataFlow, Device, DeviceTarget, Error, Graph, IOName, Optimizer,
    Result, SessionKind, WeightStore,
};
use stepport_proto::{merge_weights, read_weights};
use tracing::{debug, error, info, warn};

use crate::anchors::{AnchorBuffer, AnchorBuffers};
use crate::stepio::{validate_inputs, Stream};
use crate::{SessionOptions, StepInputs};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unbuilt,
    DevicePrepared,
    Running,
    /// A step failed part-way; only `release_device` is still allowed.
    Faulted,
    Stopped,
}

/// Whether the device copy of some host-owned state is current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightSync {
    Synced,
    Stale,
}

/// Binds a compiled graph to a device and runs it one step at a time.
///
/// A step feeds `k` micro-batches through the device and folds each
/// anchored tensor into its host buffer. Host weights and optimizer are
/// owned here and only reach the device through explicit transfers.
pub struct Session {
    device: Box<dyn Device>,
    graph: Graph,
    dataflow: DataFlow,
    registry: AnchorRegistry,
    buffers: AnchorBuffers,
    fetch: Vec<IOName>,
    weights: WeightStore,
    optimizer: Option<Optimizer>,
    weight_sync: WeightSync,
    optimizer_sync: WeightSync,
    state: SessionState,
    acquired: bool,
    steps: u64,
    options: SessionOptions,
}

impl Session {
    /// Compiles `graph` for `target` and allocates the anchor buffers. The
    /// device itself is not touched until [`Session::prepare_device`].
    pub fn new<B: Backend>(
        backend: &B,
        graph: Graph,
        dataflow: DataFlow,
        target: DeviceTarget,
        kind: SessionKind,
        options: SessionOptions,
    ) -> Result<Self> {
        let capabilities = backend.capabilities();
        if !kind.is_training() && dataflow.n_anchors() == 0 {
            return Err(Error::InvalidConfiguration(
                "an inference session needs at least one anchor".to_string(),
            ));
        }
        if kind.is_training() && !capabilities.supports_training {
            return Err(Error::InvalidConfiguration(format!(
                "backend `{}` cannot train",
                backend.name()
            )));
        }
        if let DeviceTarget::Simulated { partitions } = target {
            if partitions > capabilities.max_partitions {
                return Err(Error::InvalidConfiguration(format!(
                    "backend `{}` supports at most {} partitions, requested {partitions}",
                    backend.name(),
                    capabilities.max_partitions
                )));
            }
        }

        let device = backend
            .compile(&graph, &kind, target)
            .map_err(|e| Error::Model(format!("{e:#}")))?;

        let mut registry = AnchorRegistry::new(device.spec().outputs.clone());
        for anchor in dataflow.anchors() {
            registry.register(anchor.name.clone(), anchor.policy)?;
        }
        let buffers = AnchorBuffers::new(registry.layouts(dataflow.batches_per_step())?)?;
        let fetch = registry.names();

        let optimizer = match &kind {
            SessionKind::Training { optimizer, .. } => Some(*optimizer),
            SessionKind::Inference => None,
        };

        info!(
            backend = backend.name(),
            target = %device.target(),
            batches_per_step = dataflow.batches_per_step(),
            anchors = fetch.len(),
            training = kind.is_training(),
            "session built"
        );

        Ok(Self {
            weights: graph.weights.clone(),
            device: Box::new(device),
            graph,
            dataflow,
            registry,
            buffers,
            fetch,
            optimizer,
            weight_sync: WeightSync::Stale,
            optimizer_sync: WeightSync::Stale,
            state: SessionState::Unbuilt,
            acquired: false,
            steps: 0,
            options,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn weight_sync(&self) -> WeightSync {
        self.weight_sync
    }

    pub fn optimizer_sync(&self) -> WeightSync {
        self.optimizer_sync
    }

    /// Steps completed since the session was built.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn dataflow(&self) -> &DataFlow {
        &self.dataflow
    }

    pub fn registry(&self) -> &AnchorRegistry {
        &self.registry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn target(&self) -> &DeviceTarget {
        self.device.target()
    }

    /// Host copy of the weights. Changes here reach the device only through
    /// [`Session::weights_from_host`].
    pub fn host_weights(&self) -> &WeightStore {
        &self.weights
    }

    pub fn optimizer(&self) -> Option<&Optimizer> {
        self.optimizer.as_ref()
    }

    /// Anchor buffers as of the last completed step. A faulted session may
    /// hold a partly folded step, so its buffers are not readable.
    pub fn anchors(&self) -> Result<&AnchorBuffers> {
        if self.state == SessionState::Faulted {
            return Err(Error::SessionFaulted);
        }
        Ok(&self.buffers)
    }

    pub fn anchor(&self, name: &IOName) -> Result<Option<&AnchorBuffer>> {
        Ok(self.anchors()?.get(name))
    }

    pub fn prepare_device(&mut self) -> Result<()> {
        match self.state {
            SessionState::Faulted => return Err(Error::SessionFaulted),
            SessionState::DevicePrepared | SessionState::Running => {
                return Err(Error::AlreadyPrepared)
            }
            SessionState::Unbuilt | SessionState::Stopped => {}
        }

        if let Err(e) = self.device.acquire() {
            self.device.release();
            warn!(target = %self.device.target(), error = %format!("{e:#}"), "device acquisition failed");
            return Err(Error::DeviceUnavailable {
                target: self.device.target().to_string(),
                reason: format!("{e:#}"),
            });
        }

        self.acquired = true;
        self.state = SessionState::DevicePrepared;
        self.weight_sync = WeightSync::Stale;
        self.optimizer_sync = WeightSync::Stale;
        info!(target = %self.device.target(), "device prepared");
        Ok(())
    }

    /// Pushes the host weights to the device.
    pub fn weights_from_host(&mut self) -> Result<()> {
        self.require_device()?;
        self.device
            .weights_from_host(&self.weights)
            .map_err(Error::Device)?;
        self.weight_sync = WeightSync::Synced;
        debug!(weights = self.weights.len(), "weights written to device");
        Ok(())
    }

    /// Pulls the device weights into the host copy.
    pub fn weights_to_host(&mut self) -> Result<&WeightStore> {
        self.require_device()?;
        if self.weight_sync == WeightSync::Stale {
            return Err(Error::WeightsStale);
        }
        let device = self.device.weights_to_host().map_err(Error::Device)?;
        for (name, tensor) in device.iter() {
            self.weights.insert(name.clone(), tensor.clone());
        }
        Ok(&self.weights)
    }

    pub fn optimizer_from_host(&mut self) -> Result<()> {
        self.require_device()?;
        let optimizer = self.optimizer.ok_or_else(no_optimizer)?;
        self.device
            .optimizer_from_host(&optimizer)
            .map_err(Error::Device)?;
        self.optimizer_sync = WeightSync::Synced;
        Ok(())
    }

    /// Replaces the host optimizer. The device keeps the old one until
    /// [`Session::optimizer_from_host`].
    pub fn update_optimizer(&mut self, next: Optimizer) -> Result<()> {
        self.require_live()?;
        let current = self.optimizer.ok_or_else(no_optimizer)?;
        current.check_replacement(&next)?;
        self.optimizer = Some(next);
        self.optimizer_sync = WeightSync::Stale;
        info!(
            learning_rate = next.learning_rate(),
            weight_decay = next.weight_decay(),
            "optimizer updated"
        );
        Ok(())
    }

    /// Overwrites the host weights with the initializers of another model.
    ///
    /// Only weights both models share are replaced. Returns how many.
    pub fn reset_host_weights(&mut self, model: &[u8]) -> Result<usize> {
        self.require_live()?;
        let source = read_weights(model).map_err(|e| Error::Model(format!("{e:#}")))?;
        let replaced = self.weights.reset_from(&source)?;
        self.weight_sync = WeightSync::Stale;
        info!(replaced, "host weights reset");
        Ok(replaced)
    }

    /// Runs one step of `k` micro-batches and refreshes every anchor buffer.
    ///
    /// Input errors are reported before the device is touched and leave the
    /// session usable. Any failure once micro-batches start executing faults
    /// the session.
    pub fn run_step(&mut self, inputs: &StepInputs) -> Result<()> {
        match self.state {
            SessionState::Faulted => return Err(Error::SessionFaulted),
            SessionState::Unbuilt | SessionState::Stopped => return Err(Error::DeviceNotPrepared),
            SessionState::DevicePrepared | SessionState::Running => {}
        }
        if self.weight_sync == WeightSync::Stale {
            return Err(Error::WeightsStale);
        }
        if self.optimizer.is_some() && self.optimizer_sync == WeightSync::Stale {
            return Err(Error::OptimizerStale);
        }

        let micro_batches = self.dataflow.batches_per_step();
        let streams = validate_inputs(&self.device.spec().inputs, inputs, micro_batches)?;

        self.state = SessionState::Running;
        self.buffers.begin_step();
        for micro_batch in 0..micro_batches {
            if let Err(e) = self.run_micro_batch(&streams, micro_batch) {
                self.state = SessionState::Faulted;
                error!(
                    step = self.steps,
                    micro_batch,
                    error = %e,
                    "step failed; session faulted"
                );
                return Err(e);
            }
        }

        self.steps += 1;
        debug!(step = self.steps, micro_batches, "step complete");
        Ok(())
    }

    fn run_micro_batch(&mut self, streams: &[Stream], micro_batch: usize) -> Result<()> {
        let feeds = streams
            .iter()
            .map(|s| Ok((s.name.clone(), s.micro_batch(micro_batch)?)))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(Error::Device)?;

        let values = self
            .device
            .execute(&feeds, &self.fetch)
            .map_err(Error::Device)?;
        if values.len() != self.fetch.len() {
            return Err(Error::Device(anyhow::anyhow!(
                "device returned {} tensors for {} anchors",
                values.len(),
                self.fetch.len()
            )));
        }

        for (slot, value) in values.iter().enumerate() {
            self.buffers
                .fold(slot, micro_batch, value, self.options.check_numerics)?;
        }
        Ok(())
    }

    /// The loaded model with the current device weights in place of its
    /// initializers.
    pub fn model_to_host(&mut self) -> Result<Bytes> {
        self.weights_to_host()?;
        merge_weights(&self.graph.bytes, &self.weights).map_err(|e| Error::Model(format!("{e:#}")))
    }

    pub fn write_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.model_to_host()?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!(path = %path.as_ref().display(), bytes = bytes.len(), "model written");
        Ok(())
    }

    /// Detaches the device. Safe to call any number of times, and the only
    /// operation a faulted session still accepts.
    pub fn release_device(&mut self) {
        if !self.acquired {
            return;
        }
        if self.state != SessionState::Faulted {
            if let Some(path) = self.options.export_path() {
                if let Err(e) = self.write_model(&path) {
                    warn!(path = %path.display(), error = %e, "model export on release failed");
                }
            }
            self.state = SessionState::Stopped;
        }
        self.device.release();
        self.acquired = false;
        info!(steps = self.steps, "device released");
    }

    fn require_live(&self) -> Result<()> {
        if self.state == SessionState::Faulted {
            return Err(Error::SessionFaulted);
        }
        Ok(())
    }

    fn require_device(&self) -> Result<()> {
        match self.state {
            SessionState::Faulted => Err(Error::SessionFaulted),
            SessionState::DevicePrepared | SessionState::Running => Ok(()),
            SessionState::Unbuilt | SessionState::Stopped => Err(Error::DeviceNotPrepared),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_device();
    }
}

fn no_optimizer() -> Error {
    Error::InvalidConfiguration("inference sessions have no optimizer".to_string())
}
