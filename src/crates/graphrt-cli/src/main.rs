//! graphrt CLI - drive compute-graph sessions from a TOML configuration
//!
//! Every command runs against the loopback collaborators, so a full
//! add → compile → load → run cycle works without a device.

use anyhow::Context;
use clap::{Parser, Subcommand};
use graphrt_core::loopback::loopback_builder;
use graphrt_core::{
    AddressRangeReconciler, Completion, ComputeGraph, ConfigLoader, DType, GlobalContext, GraphConfig, Session,
    SessionConfig, Tensor, TensorDesc,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphrt")]
#[command(about = "graphrt - session control for compute-graph runtimes", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured graph through the full session pipeline
    Run {
        /// Session configuration file
        #[arg(short, long, env = "GRAPHRT_CONFIG")]
        config: PathBuf,

        /// Number of executions
        #[arg(short = 'n', long, default_value_t = 1)]
        iterations: u32,

        /// Submit asynchronously and wait for each completion
        #[arg(long = "async")]
        use_async: bool,
    },

    /// Load a configuration file and validate its options
    CheckConfig {
        /// Session configuration file
        file: PathBuf,
    },

    /// Check that remapped ranges cover a virtual window exactly
    Remap {
        /// Window start (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_u64)]
        va: u64,

        /// Window length in bytes
        #[arg(long, value_parser = parse_u64)]
        len: u64,

        /// Inclusive range reported by a model, as `start:end`
        #[arg(long = "range", value_parser = parse_range, required = true)]
        ranges: Vec<(u64, u64)>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            iterations,
            use_async,
        } => {
            let config = ConfigLoader::new().load_validated(&config).await?;
            init_tracing(config.logging.level.as_deref());
            run(config, iterations, use_async).await
        }
        Commands::CheckConfig { file } => {
            let config = ConfigLoader::new().load(&file).await?;
            init_tracing(config.logging.level.as_deref());
            let resolved = config
                .resolved_options()
                .with_context(|| format!("invalid options in {}", file.display()))?;

            println!("✓ {} is valid", file.display());
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            if let Some(graph) = &config.graph {
                println!(
                    "graph {} '{}': {} inputs, {} outputs",
                    graph.id,
                    graph.name,
                    graph.inputs.len(),
                    graph.outputs.len()
                );
            }
            Ok(())
        }
        Commands::Remap { va, len, ranges } => {
            init_tracing(None);
            let merged = AddressRangeReconciler::merge(ranges.clone());
            for (start, end) in &merged {
                println!("{:#x}..={:#x}", start, end);
            }
            AddressRangeReconciler::reconcile(va, len, ranges)?;
            println!("✓ window {:#x}+{:#x} fully remapped", va, len);
            Ok(())
        }
    }
}

/// `RUST_LOG` wins, then the configured level, then `info`
fn init_tracing(config_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: SessionConfig, iterations: u32, use_async: bool) -> anyhow::Result<()> {
    let graph = config
        .graph
        .clone()
        .context("configuration has no [graph] table")?;

    let global = Arc::new(GlobalContext::new(config.global_options.clone()));
    let mut builder = loopback_builder(global).with_options(config.options.clone());
    if let Some(id) = config.session.id {
        builder = builder.with_session_id(id);
    }
    let session = Arc::new(builder.build()?);
    session.initialize().await?;

    let result = drive(&session, &graph, iterations, use_async).await;
    session.finalize().await?;
    result
}

async fn drive(session: &Session, config: &GraphConfig, iterations: u32, use_async: bool) -> anyhow::Result<()> {
    let mut graph = ComputeGraph::new(config.name.clone()).with_node("sum", "ReduceSum");
    for desc in &config.inputs {
        graph = graph.with_input(desc.clone());
    }
    for desc in &config.outputs {
        graph = graph.with_output(desc.clone());
    }

    session.add_graph(config.id, graph, config.options.clone())?;
    session.compile_graph(config.id, None).await?;
    session
        .load_graph(config.id, Default::default(), None)
        .await?;

    let summary = session.compiled_summary(config.id)?;
    info!(
        graph_id = config.id,
        dynamic = summary.dynamic,
        const_size = summary.memory.const_size,
        feature_size = summary.memory.feature_size,
        "Graph ready"
    );

    for iteration in 0..iterations {
        let inputs = demo_inputs(&config.inputs)?;
        let (completion, outputs) = if use_async {
            let output = session
                .submit_graph(config.id, inputs)
                .await
                .context("run worker dropped the completion")??;
            (output.completion, output.outputs)
        } else {
            (Completion::Success, session.run_graph(config.id, inputs).await?)
        };

        if completion == Completion::EndOfSequence {
            println!("iteration {}: end of sequence", iteration);
            break;
        }
        let descs: Vec<&TensorDesc> = outputs.iter().map(|t| &t.desc).collect();
        println!("iteration {}: {}", iteration, serde_json::to_string(&descs)?);
    }
    Ok(())
}

/// Inputs of the declared descriptors; unknown dims become 1, `f32` elements 1.0
fn demo_inputs(descs: &[TensorDesc]) -> anyhow::Result<Vec<Tensor>> {
    descs
        .iter()
        .map(|declared| {
            let dims: Vec<i64> = declared.dims.iter().map(|d| if *d < 0 { 1 } else { *d }).collect();
            let desc = TensorDesc::new(dims, declared.dtype);
            let tensor = match desc.dtype {
                DType::F32 => {
                    let count = desc.element_count().unwrap_or(0);
                    Tensor::from_f32(desc.dims, &vec![1.0; count])?
                }
                _ => Tensor::zeros(desc)?,
            };
            Ok(tensor)
        })
        .collect()
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

fn parse_range(value: &str) -> Result<(u64, u64), String> {
    let Some((start, end)) = value.split_once(':') else {
        return Err(format!("range '{}' is not start:end", value));
    };
    let (start, end) = (parse_u64(start)?, parse_u64(end)?);
    if end < start {
        return Err(format!("range '{}' ends before it starts", value));
    }
    Ok((start, end))
}
