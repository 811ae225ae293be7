mod cli;
mod demo;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, RunArgs};
use stepport_backend_cpu::CpuBackend;
use stepport_core::{
    DataFlow, DeviceTarget, GraphArtifact, InputShapeInfo, Loss, Optimizer, SessionKind,
    TensorInfo,
};
use stepport_numerics::{compare, NumericsReport};
use stepport_proto::{load_graph, read_weights};
use stepport_runtime::{Session, SessionOptions, StepInputs, StepLoader, StepWorker};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    std::env::set_var("RUST_LOG", &cli.log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match cli.command {
        Command::BuildDemo { out, batch_size } => build_demo(&out, batch_size),
        Command::Run(args) => run(args).await,
        Command::Compare {
            left,
            right,
            tolerance,
        } => compare_models(&left, &right, tolerance),
        Command::Report {
            a0,
            a1,
            b0,
            b1,
            tolerance,
        } => report(&[a0, a1, b0, b1], tolerance),
    }
}

fn build_demo(out: &Path, batch_size: usize) -> Result<()> {
    if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let bytes = demo::demo_model(batch_size).to_bytes();
    std::fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), bytes = bytes.len(), batch_size, "demo model written");
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let device: DeviceTarget = args.device.parse()?;

    let mut shapes = InputShapeInfo::new();
    for (name, dims) in &args.input_shapes {
        shapes.add(name.as_str(), TensorInfo::f32(dims));
    }
    let graph = load_graph(&GraphArtifact::OnnxPath(args.model.clone()), &shapes)?;

    let kind = match &args.train_on {
        Some(input) => SessionKind::Training {
            losses: vec![Loss::L1 {
                input: input.as_str().into(),
                output: "loss".into(),
                lambda: args.l1_lambda,
                reduction: args.loss_reduction.into(),
            }],
            optimizer: Optimizer::Sgd {
                learning_rate: args.learning_rate,
                weight_decay: args.weight_decay,
            },
        },
        None => SessionKind::Inference,
    };
    let training = kind.is_training();

    let dataflow = DataFlow::new(
        args.batches_per_step,
        args.anchors.iter().map(|(n, p)| (n.as_str(), *p)),
    )?;

    let mut options = SessionOptions::default().with_check_numerics(args.check_numerics);
    if let Some(dir) = &args.log_dir {
        std::fs::create_dir_all(dir)?;
        options = options.with_log_dir(dir).with_export_on_release(true);
    }

    let inputs = graph.inputs.clone();
    let mut session = Session::new(
        &CpuBackend::new(),
        graph,
        dataflow,
        device,
        kind,
        options,
    )?;
    session.prepare_device()?;
    session.weights_from_host()?;
    if training {
        session.optimizer_from_host()?;
    }

    let dataset = synthetic_dataset(&inputs, args.steps * args.batches_per_step)?;
    let Some(batch_size) = inputs.values().find_map(|info| info.shape().leading()) else {
        bail!("model has no batched input to feed");
    };
    let loader = StepLoader::new(dataset, args.batches_per_step, batch_size)?;

    let (worker, handle) = StepWorker::new(0, session, 4);
    let join = tokio::spawn(worker.run());

    for step in loader.take(args.steps) {
        let response = handle.submit(step?).await?;
        for (name, tensor) in &response.anchors {
            let summary = match tensor.to_f32() {
                Ok(values) => {
                    let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                    format!("mean {mean:.6}")
                }
                Err(_) => format!("{} bytes", tensor.data.len()),
            };
            info!(
                step = response.step,
                anchor = %name,
                shape = %tensor.shape(),
                device_us = response.timings.device_us,
                "{summary}"
            );
        }
    }
    drop(handle);

    let mut session = join.await?;
    if let Some(path) = &args.save {
        session.write_model(path)?;
    }
    session.release_device();
    Ok(())
}

/// A dataset of `micro_batches` worth of samples for every graph input.
fn synthetic_dataset(
    inputs: &std::collections::BTreeMap<stepport_core::IOName, TensorInfo>,
    micro_batches: usize,
) -> Result<StepInputs> {
    inputs
        .iter()
        .enumerate()
        .map(|(salt, (name, info))| {
            let samples = info.shape().leading().unwrap_or(1) * micro_batches;
            Ok((name.clone(), demo::synthetic_input(info, samples, salt)?))
        })
        .collect()
}

fn compare_models(left: &Path, right: &Path, tolerance: f64) -> Result<()> {
    let (a, b) = (read_model_weights(left)?, read_model_weights(right)?);
    let comparison = compare(a.iter(), b.iter(), tolerance)?;
    if comparison.is_empty() {
        warn!("models share no weights");
    }
    for (name, error) in comparison.iter() {
        println!("{name} : {error:e}");
    }
    Ok(())
}

fn report(paths: &[PathBuf; 4], tolerance: Option<f64>) -> Result<()> {
    let models = paths
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("reading {}", p.display())))
        .collect::<Result<Vec<_>>>()?;
    let report = NumericsReport::from_models(&models[0], &models[1], &models[2], &models[3])?;
    print!("{}", report.full_report());
    println!("total : {:e}", report.total());
    if let Some(tolerance) = tolerance {
        report.assert_within(tolerance)?;
    }
    Ok(())
}

fn read_model_weights(path: &Path) -> Result<stepport_core::WeightStore> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    read_weights(&bytes).with_context(|| format!("decoding {}", path.display()))
}
