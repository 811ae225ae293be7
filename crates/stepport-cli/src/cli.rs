use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stepport_core::{LossReduction, ReductionPolicy};

#[derive(Parser, Debug)]
#[command(name = "stepport", version, about = "Step-wise graph execution and numerics tooling")]
pub struct Cli {
    /// Log level (RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write the demo two-layer model
    BuildDemo {
        /// Output path for the model
        #[arg(long, default_value = "models/demo.onnx")]
        out: PathBuf,

        /// Samples per micro-batch baked into the model's input shape
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
    },
    /// Run steps of a model on synthetic data
    Run(RunArgs),
    /// Compare the weights of two models
    Compare {
        left: PathBuf,
        right: PathBuf,

        #[arg(long, default_value_t = 1e-6)]
        tolerance: f64,
    },
    /// Compare the weight updates of two training runs
    Report {
        a0: PathBuf,
        a1: PathBuf,
        b0: PathBuf,
        b1: PathBuf,

        /// Fail if any weight's update error exceeds this
        #[arg(long)]
        tolerance: Option<f64>,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the ONNX model file
    #[arg(long, default_value = "models/demo.onnx")]
    pub model: PathBuf,

    /// Device target (cpu, sim:N or hw:N)
    #[arg(long, default_value = "cpu")]
    pub device: String,

    #[arg(long, default_value_t = 1)]
    pub batches_per_step: usize,

    #[arg(long, default_value_t = 1)]
    pub steps: usize,

    /// Tensor to return each step, as NAME=ALL|SUM|FINAL (repeatable)
    #[arg(long = "anchor", value_parser = parse_anchor)]
    pub anchors: Vec<(String, ReductionPolicy)>,

    /// Per-micro-batch shape for a dynamic input, as NAME=D0,D1,... (repeatable)
    #[arg(long = "input-shape", value_parser = parse_input_shape)]
    pub input_shapes: Vec<(String, Vec<usize>)>,

    /// Train with an L1 loss on this tensor
    #[arg(long)]
    pub train_on: Option<String>,

    #[arg(long, default_value_t = 0.1)]
    pub l1_lambda: f32,

    #[arg(long, value_enum, default_value_t = Reduction::Sum)]
    pub loss_reduction: Reduction,

    #[arg(long, default_value_t = 0.01)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f32,

    /// Fail the step when an anchor holds NaN or Inf
    #[arg(long)]
    pub check_numerics: bool,

    /// Directory the trained model is exported to on release
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Write the model with the final device weights here
    #[arg(long)]
    pub save: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Reduction {
    Sum,
    Mean,
}

impl From<Reduction> for LossReduction {
    fn from(r: Reduction) -> Self {
        match r {
            Reduction::Sum => LossReduction::Sum,
            Reduction::Mean => LossReduction::Mean,
        }
    }
}

fn parse_anchor(raw: &str) -> Result<(String, ReductionPolicy), String> {
    let (name, policy) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=POLICY, got `{raw}`"))?;
    let policy = policy.parse().map_err(|e| format!("{e}"))?;
    Ok((name.to_string(), policy))
}

fn parse_input_shape(raw: &str) -> Result<(String, Vec<usize>), String> {
    let (name, dims) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=D0,D1,..., got `{raw}`"))?;
    let dims = dims
        .split(',')
        .filter(|d| !d.is_empty())
        .map(|d| d.trim().parse::<usize>().map_err(|e| format!("bad dim `{d}`: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name.to_string(), dims))
}
