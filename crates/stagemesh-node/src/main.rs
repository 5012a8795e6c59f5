//! stagemesh binary — local pipeline-parallel training driver.
//!
//! ```bash
//! # Print the GPipe tick table for 2 meshes and 4 micro-batches
//! cargo run --bin stagemesh -- schedule --meshes 2 --micro-batches 4
//!
//! # Train the demo MLP for a few steps and save the compiled plan
//! RUST_LOG=info cargo run --bin stagemesh -- demo --steps 5 --plan-out plan.bin
//!
//! # Show a saved plan
//! cargo run --bin stagemesh -- inspect plan.bin
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stagemesh_pipeline::workloads::{mlp_inputs, mlp_training_step};
use stagemesh_pipeline::{
    compile_pipeline, decode_plan, encode_plan, eval_graph, DependencyGraph, GpipeSchedule,
    InterpreterCompiler, LocalProvisioner, Pipeline,
};
use stagemesh_types::{PipelineConfig, PipelinePlan, Tensor, VirtualMesh};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "stagemesh",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Pipeline-parallel training over device meshes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the GPipe schedule for a forward/backward pipeline.
    Schedule {
        #[arg(long, default_value_t = 2)]
        meshes: usize,

        #[arg(long, default_value_t = 4)]
        micro_batches: usize,

        /// Leave out the per-mesh gradient-application stages.
        #[arg(long)]
        no_apply: bool,
    },

    /// Compile and train the two-layer demo MLP on host meshes.
    Demo {
        #[arg(long, default_value_t = 2)]
        hosts: u32,

        #[arg(long, default_value_t = 1)]
        devices_per_host: u32,

        /// Overrides the value from `--config`.
        #[arg(long)]
        micro_batches: Option<u32>,

        /// Global batch size; must divide evenly into micro-batches.
        #[arg(long, default_value_t = 8)]
        batch: usize,

        #[arg(long, default_value_t = 1)]
        steps: usize,

        #[arg(long, default_value_t = 0.05)]
        lr: f32,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// JSON file holding a `PipelineConfig`.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the compiled plan here (bincode).
        #[arg(long)]
        plan_out: Option<PathBuf>,
    },

    /// Print a plan written by `demo --plan-out`.
    Inspect {
        file: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=stagemesh_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Schedule { meshes, micro_batches, no_apply } =>
            run_schedule(meshes, micro_batches, no_apply),
        Command::Demo {
            hosts,
            devices_per_host,
            micro_batches,
            batch,
            steps,
            lr,
            seed,
            config,
            plan_out,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if micro_batches.is_some() {
                cfg.num_micro_batches = micro_batches;
            }
            let mesh = VirtualMesh::new(hosts, devices_per_host);
            run_demo(&mesh, &cfg, DemoOptions { batch, steps, lr, seed, plan_out }).await
        }
        Command::Inspect { file } => run_inspect(&file),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: PipelineConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

// ── Schedule mode ─────────────────────────────────────────────────────────────

fn run_schedule(meshes: usize, micro_batches: usize, no_apply: bool) -> Result<()> {
    let num_pipeline = 2 * meshes;
    let (dependency, apply) = if no_apply {
        (DependencyGraph::linear(num_pipeline), Vec::new())
    } else {
        let apply: Vec<(usize, usize)> = (0..meshes).map(|m| (num_pipeline + m, m)).collect();
        let dependency = DependencyGraph::linear_with_apply(num_pipeline + meshes, meshes, &apply)?;
        (dependency, apply)
    };

    let schedule = GpipeSchedule::new(&dependency, meshes, &apply, micro_batches)?;
    println!("{schedule}");
    println!(
        "ticks={}  efficiency={:.1}%",
        schedule.num_ticks(),
        schedule.efficiency() * 100.0
    );
    Ok(())
}

// ── Demo mode ─────────────────────────────────────────────────────────────────

struct DemoOptions {
    batch: usize,
    steps: usize,
    lr: f32,
    seed: u64,
    plan_out: Option<PathBuf>,
}

async fn run_demo(mesh: &VirtualMesh, cfg: &PipelineConfig, opts: DemoOptions) -> Result<()> {
    let micro_batches = cfg.num_micro_batches.unwrap_or(1) as usize;
    if micro_batches == 0 || opts.batch % micro_batches != 0 {
        bail!(
            "batch of {} rows does not split into {micro_batches} micro-batches",
            opts.batch
        );
    }

    let step = mlp_training_step(opts.batch / micro_batches, opts.lr)?;
    let pipeline = compile_pipeline(
        step,
        mesh,
        cfg,
        &InterpreterCompiler,
        Arc::new(LocalProvisioner),
    )?;
    println!("{}", pipeline.schedule());

    let plan = pipeline.plan();
    if let Some(path) = &opts.plan_out {
        std::fs::write(path, encode_plan(&plan)?)
            .with_context(|| format!("writing plan {}", path.display()))?;
        info!(path = %path.display(), "plan written");
    }

    println!("{}", serde_json::to_string_pretty(&plan)?);

    let mut args = mlp_inputs(opts.batch, opts.seed)?;
    check_against_reference(&pipeline, &args, opts.batch, opts.lr / micro_batches as f32).await?;

    for step in 0..opts.steps {
        let out = pipeline.run(args.clone()).await?;
        let loss = out[0].data().first().copied().unwrap_or_default();
        info!(step, loss, "training step");
        println!("step {step:>3}  loss(last micro-batch)={loss:.6}");

        // Feed the updated weights into the next step.
        let mut updated = out.into_iter().skip(1);
        for slot in args.iter_mut().skip(2) {
            if let Some(w) = updated.next() {
                *slot = w;
            }
        }
    }
    Ok(())
}

/// Run one step pipelined and once on a single device; the updated weights
/// must agree.
async fn check_against_reference(
    pipeline: &Pipeline,
    args: &[Tensor],
    batch: usize,
    reference_lr: f32,
) -> Result<()> {
    const TOLERANCE: f32 = 1e-4;

    let pipelined = pipeline.run(args.to_vec()).await?;
    let reference = mlp_training_step(batch, reference_lr)?;
    let expected = eval_graph(&reference.arena, &reference.graph, args)?;

    for (i, (got, want)) in pipelined.iter().zip(&expected).enumerate().skip(1) {
        let diff = got.max_abs_diff(want)?;
        if diff > TOLERANCE {
            bail!("output {i} differs from the single-device reference by {diff}");
        }
        info!(output = i, max_abs_diff = diff, "matches single-device reference");
    }
    Ok(())
}

// ── Inspect mode ──────────────────────────────────────────────────────────────

fn run_inspect(file: &std::path::Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let plan = decode_plan(&bytes)?;
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &PipelinePlan) {
    println!("pipeline   {}", plan.pipeline_id);
    println!("created    {}", plan.created_at);
    println!(
        "meshes={}  micro_batches={}  ticks={}  utilization={:.1}%",
        plan.num_meshes,
        plan.num_micro_batches,
        plan.num_ticks(),
        plan.utilization() * 100.0
    );
    for stage in &plan.stages {
        let donated: Vec<&str> = stage.donated_invars().collect();
        println!(
            "  [{:>2}] {:<14} mesh={}  in={}  out={}  mem/dev={}B  donated={:?}",
            stage.stage_index,
            stage.name,
            stage.mesh_index,
            stage.invars.len(),
            stage.outvars.len(),
            stage.memory_per_device,
            donated
        );
    }
    for (tick, row) in plan.ticks.iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .map(|slot| match slot {
                Some(t) => format!("{}:{}", t.stage_index, t.micro_batch_index),
                None => ".".into(),
            })
            .collect();
        println!("  t{tick:<3} {}", cells.join("  "));
    }
}
