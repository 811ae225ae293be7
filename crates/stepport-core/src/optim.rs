use crate::{Error, IOName, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossReduction {
    Sum,
    Mean,
}

/// Losses the device appends to the graph for a training session.
#[derive(Clone, Debug, PartialEq)]
pub enum Loss {
    /// `lambda * reduce(|input|)`, written to the scalar tensor `output`.
    L1 {
        input: IOName,
        output: IOName,
        lambda: f32,
        reduction: LossReduction,
    },
}

impl Loss {
    pub fn l1(input: impl Into<IOName>, output: impl Into<IOName>, lambda: f32) -> Self {
        Loss::L1 {
            input: input.into(),
            output: output.into(),
            lambda,
            reduction: LossReduction::Sum,
        }
    }

    pub fn input(&self) -> &IOName {
        match self {
            Loss::L1 { input, .. } => input,
        }
    }

    pub fn output(&self) -> &IOName {
        match self {
            Loss::L1 { output, .. } => output,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Optimizer {
    /// SGD whose hyper-parameters are fixed for the session's lifetime.
    ConstSgd { learning_rate: f32, weight_decay: f32 },
    /// SGD whose hyper-parameters may be replaced between steps.
    Sgd { learning_rate: f32, weight_decay: f32 },
}

impl Optimizer {
    pub fn const_sgd(learning_rate: f32) -> Self {
        Optimizer::ConstSgd {
            learning_rate,
            weight_decay: 0.0,
        }
    }

    pub fn sgd(learning_rate: f32) -> Self {
        Optimizer::Sgd {
            learning_rate,
            weight_decay: 0.0,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match *self {
            Optimizer::ConstSgd { learning_rate, .. } | Optimizer::Sgd { learning_rate, .. } => {
                learning_rate
            }
        }
    }

    pub fn weight_decay(&self) -> f32 {
        match *self {
            Optimizer::ConstSgd { weight_decay, .. } | Optimizer::Sgd { weight_decay, .. } => {
                weight_decay
            }
        }
    }

    /// Whether `next` may replace `self` on a live session.
    pub fn check_replacement(&self, next: &Optimizer) -> Result<()> {
        match (self, next) {
            (Optimizer::Sgd { .. }, Optimizer::Sgd { .. }) => Ok(()),
            (Optimizer::ConstSgd { .. }, _) => Err(Error::InvalidConfiguration(
                "a constant SGD optimizer cannot be updated".to_string(),
            )),
            _ => Err(Error::InvalidConfiguration(
                "replacement optimizer must be of the same kind".to_string(),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionKind {
    Inference,
    Training {
        losses: Vec<Loss>,
        optimizer: Optimizer,
    },
}

impl SessionKind {
    pub fn is_training(&self) -> bool {
        matches!(self, SessionKind::Training { .. })
    }

    pub fn losses(&self) -> &[Loss] {
        match self {
            SessionKind::Inference => &[],
            SessionKind::Training { losses, .. } => losses,
        }
    }
}
