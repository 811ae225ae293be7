use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{Session, StepInputs, StepJob, StepResponse, Timings};

/// Owns a session and runs queued steps in arrival order.
pub struct StepWorker {
    pub id: u32,
    pub inbox: mpsc::Receiver<StepJob>,
    pub session: Session,
}

#[derive(Clone)]
pub struct StepHandle {
    tx: mpsc::Sender<StepJob>,
}

impl StepHandle {
    /// Queues a step and waits for its anchors.
    pub async fn submit(&self, inputs: StepInputs) -> Result<StepResponse> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let job = StepJob {
            inputs,
            enqueued_at: std::time::Instant::now(),
            resp_tx,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("step worker has stopped"))?;
        let response = resp_rx
            .await
            .map_err(|_| anyhow!("step worker dropped the job"))??;
        Ok(response)
    }
}

impl StepWorker {
    /// Worker plus the handle that feeds it, with room for `capacity` queued jobs.
    pub fn new(id: u32, session: Session, capacity: usize) -> (Self, StepHandle) {
        let (tx, inbox) = mpsc::channel(capacity);
        (Self { id, inbox, session }, StepHandle { tx })
    }

    /// Runs until every handle is dropped, then hands the session back.
    pub async fn run(mut self) -> Session {
        info!(worker_id = self.id, "step worker started");
        while let Some(job) = self.inbox.recv().await {
            let queued_us = job.enqueued_at.elapsed().as_micros() as u64;
            let t0 = std::time::Instant::now();
            let result = self.session.run_step(&job.inputs).and_then(|()| {
                Ok(StepResponse {
                    step: self.session.steps(),
                    anchors: self.session.anchors()?.snapshot(),
                    timings: Timings {
                        queued_us,
                        device_us: t0.elapsed().as_micros() as u64,
                    },
                })
            });
            if let Err(e) = &result {
                warn!(worker_id = self.id, error = %e, "step failed");
            }
            if job.resp_tx.send(result).is_err() {
                debug!(worker_id = self.id, "step submitter went away");
            }
        }
        info!(worker_id = self.id, steps = self.session.steps(), "step worker stopped");
        self.session
    }
}
