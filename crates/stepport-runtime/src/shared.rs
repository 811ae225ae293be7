use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use stepport_core::{Error, IOName, Result, Tensor};

use crate::{Session, StepInputs};

/// A session several threads may hold.
///
/// Calls never wait for each other: a call made while another is in
/// flight fails with [`Error::ConcurrentAccess`]. Use [`crate::StepWorker`]
/// to queue steps instead.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::ConcurrentAccess),
            Err(TryLockError::Poisoned(_)) => Err(Error::SessionFaulted),
        }
    }

    pub fn run_step(&self, inputs: &StepInputs) -> Result<()> {
        self.lock()?.run_step(inputs)
    }

    /// Runs a step and copies the anchors out while still holding the session.
    pub fn run_step_snapshot(&self, inputs: &StepInputs) -> Result<Vec<(IOName, Tensor)>> {
        let mut session = self.lock()?;
        session.run_step(inputs)?;
        Ok(session.anchors()?.snapshot())
    }

    /// Exclusive access for anything else.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
        f(&mut *self.lock()?)
    }
}
