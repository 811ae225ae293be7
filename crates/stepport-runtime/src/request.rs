use stepport_core::{IOName, Result, Tensor};
use tokio::sync::oneshot;

use crate::StepInputs;

#[derive(Debug)]
pub struct StepJob {
    pub inputs: StepInputs,
    pub enqueued_at: std::time::Instant,
    pub resp_tx: oneshot::Sender<Result<StepResponse>>,
}

#[derive(Debug)]
pub struct StepResponse {
    /// 1-based index of the step that produced these anchors.
    pub step: u64,
    pub anchors: Vec<(IOName, Tensor)>,
    pub timings: Timings,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub queued_us: u64,
    pub device_us: u64,
}
