//! warpkernel CLI - run a PHOLD model on the Time Warp kernel.
//!
//! Commands:
//! - `warpkernel run` - run PHOLD and print counters and a model digest
//! - `warpkernel config` - print the effective kernel configuration as JSON
//!
//! The digest folds every object's final state together, so a sequential
//! run and a Time Warp run of the same model must print the same value.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use warpkernel::comm::{Communication, InProcessCluster, LocalCommunication};
use warpkernel::object::builtin::hash_combine;
use warpkernel::stream::file_sinks;
use warpkernel::{
    CounterSnapshot, EventDispatcher, GvtPeriod, KernelConfig, ObjectId, Partitions,
    PholdObject, Placement, SequentialDispatcher, SimObject, SimulationReport, StreamRegistry,
    TimeWarpDispatcher,
};

#[derive(Parser)]
#[command(name = "warpkernel")]
#[command(about = "Optimistic parallel discrete-event simulation kernel")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct KernelArgs {
    /// JSON kernel configuration; flags below override its fields
    #[arg(short, long, env = "WARPKERNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Simulation end time in ticks
    #[arg(short, long)]
    end_time: Option<u64>,

    /// Worker threads per node
    #[arg(short, long)]
    workers: Option<usize>,

    /// Schedule queues per node
    #[arg(short, long)]
    schedulers: Option<usize>,

    /// GVT period in milliseconds
    #[arg(long, conflicts_with = "gvt_events")]
    gvt_millis: Option<u64>,

    /// GVT period in events processed on the coordinator
    #[arg(long)]
    gvt_events: Option<u64>,

    /// Snapshot object state every N events
    #[arg(long)]
    checkpoint_period: Option<u32>,

    /// Rotate objects across schedule queues to balance load
    #[arg(long)]
    lp_migration: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a PHOLD model
    Run {
        #[command(flatten)]
        kernel: KernelArgs,

        /// Number of objects
        #[arg(short, long, default_value_t = 64)]
        objects: u32,

        /// Initial events per object
        #[arg(short, long, default_value_t = 4)]
        population: u32,

        /// Mean forwarding delay in ticks
        #[arg(long, default_value_t = 10)]
        mean_delay: u64,

        /// Model seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Nodes of the in-process cluster
        #[arg(short, long, default_value_t = 1)]
        nodes: u32,

        /// Run on the sequential dispatcher instead of Time Warp
        #[arg(long, conflicts_with = "nodes")]
        sequential: bool,

        /// Write one trace line per event to <dir>/phold.log
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },

    /// Print the effective kernel configuration
    Config {
        #[command(flatten)]
        kernel: KernelArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            kernel,
            objects,
            population,
            mean_delay,
            seed,
            nodes,
            sequential,
            trace_dir,
        } => {
            let config = kernel.resolve()?;
            let model = PholdModel {
                objects,
                population,
                mean_delay,
                seed,
                trace: trace_dir.is_some(),
            };
            let streams = match &trace_dir {
                Some(dir) => Some(open_trace_dir(dir)?),
                None => None,
            };
            if sequential {
                run_sequential(config, &model, streams)
            } else {
                run_time_warp(config, &model, nodes, streams)
            }
        }
        Commands::Config { kernel } => {
            let config = kernel.resolve()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

impl KernelArgs {
    /// Load the config file, if any, then apply the flags.
    fn resolve(&self) -> Result<KernelConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => KernelConfig::default(),
        };
        if let Some(end) = self.end_time {
            config = config.with_max_sim_time(end);
        }
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(schedulers) = self.schedulers {
            config = config.with_schedulers(schedulers);
        }
        if let Some(ms) = self.gvt_millis {
            config = config.with_gvt_period(GvtPeriod::Millis(ms));
        }
        if let Some(events) = self.gvt_events {
            config = config.with_gvt_period(GvtPeriod::Events(events));
        }
        if let Some(period) = self.checkpoint_period {
            config = config.with_checkpoint_period(period);
        }
        if self.lp_migration {
            config = config.with_lp_migration(true);
        }
        config.validate().context("Invalid kernel configuration")?;
        Ok(config)
    }
}

const TRACE_STREAM: &str = "phold.log";

struct PholdModel {
    objects: u32,
    population: u32,
    mean_delay: u64,
    seed: u64,
    trace: bool,
}

impl PholdModel {
    fn object(&self, id: ObjectId) -> Box<dyn SimObject> {
        let obj = PholdObject::new(id, self.objects, self.seed)
            .with_population(self.population)
            .with_mean_delay(self.mean_delay);
        if self.trace {
            Box::new(obj.with_trace_stream(TRACE_STREAM))
        } else {
            Box::new(obj)
        }
    }

    /// `ids` dealt round-robin over `parts` partitions.
    fn partitions(&self, ids: &[ObjectId], parts: usize) -> Partitions {
        let mut partitions: Partitions = (0..parts.max(1)).map(|_| Vec::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            partitions[i % parts.max(1)].push((*id, self.object(*id)));
        }
        partitions
    }
}

fn open_trace_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create trace directory {}", dir.display()))?;
    Ok(dir.to_path_buf())
}

fn run_sequential(config: KernelConfig, model: &PholdModel, trace_dir: Option<PathBuf>) -> Result<()> {
    let ids: Vec<ObjectId> = (0..model.objects).map(ObjectId::new).collect();
    let mut dispatcher = SequentialDispatcher::new(config);
    if let Some(dir) = trace_dir {
        dispatcher = dispatcher.with_streams(Arc::new(StreamRegistry::immediate(file_sinks(dir))));
    }
    let report = dispatcher
        .start_simulation(model.partitions(&ids, 1))
        .context("Sequential simulation failed")?;
    print_summary("sequential", &[report]);
    Ok(())
}

fn run_time_warp(
    config: KernelConfig,
    model: &PholdModel,
    nodes: u32,
    trace_dir: Option<PathBuf>,
) -> Result<()> {
    if nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    if nodes > 1 && trace_dir.is_some() {
        bail!("--trace-dir is only supported on a single node");
    }
    let placement = Placement::blocks(model.objects, nodes);

    let reports = if nodes == 1 {
        let mut dispatcher = TimeWarpDispatcher::new(
            config.clone(),
            Arc::new(LocalCommunication::new()),
            placement.clone(),
        );
        if let Some(dir) = trace_dir {
            dispatcher =
                dispatcher.with_streams(Arc::new(StreamRegistry::speculative(file_sinks(dir))));
        }
        let ids = placement.objects_on(warpkernel::NodeId::COORDINATOR);
        vec![dispatcher
            .start_simulation(model.partitions(&ids, config.num_schedulers))
            .context("Time Warp simulation failed")?]
    } else {
        info!(nodes, objects = model.objects, "starting in-process cluster");
        let endpoints = InProcessCluster::new(nodes as usize);
        let results: Vec<Result<SimulationReport>> = std::thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    let node = endpoint.node_id();
                    let ids = placement.objects_on(node);
                    let partitions = model.partitions(&ids, config.num_schedulers);
                    let dispatcher = TimeWarpDispatcher::new(
                        config.clone(),
                        Arc::new(endpoint),
                        placement.clone(),
                    );
                    s.spawn(move || {
                        dispatcher
                            .start_simulation(partitions)
                            .with_context(|| format!("Node {node} failed"))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(_) => bail!("A node thread panicked"),
                })
                .collect()
        });
        results.into_iter().collect::<Result<Vec<_>>>()?
    };

    print_summary("time-warp", &reports);
    Ok(())
}

/// Fold the final PHOLD states of all nodes into one value.
fn model_digest(reports: &[SimulationReport]) -> u64 {
    let mut objects: Vec<(ObjectId, u64)> = reports
        .iter()
        .flat_map(|report| {
            report.object_ids().into_iter().filter_map(move |id| {
                report
                    .object::<PholdObject>(id)
                    .map(|obj| (id, hash_combine(obj.state().digest, obj.state().received)))
            })
        })
        .collect();
    objects.sort_by_key(|(id, _)| *id);
    objects
        .into_iter()
        .fold(0, |acc, (_, digest)| hash_combine(acc, digest))
}

fn print_summary(label: &str, reports: &[SimulationReport]) {
    let counters = reports
        .iter()
        .fold(CounterSnapshot::default(), |acc, r| acc.merge(&r.counters));
    let end_time = reports.iter().map(|r| r.end_time).max().unwrap_or_default();
    let wall = reports.iter().map(|r| r.wall_time).max().unwrap_or_default();

    println!("═══════════════════════════════════════════════════════");
    println!("  warpkernel: PHOLD on {label} ({} node(s))", reports.len());
    println!("═══════════════════════════════════════════════════════");
    for report in reports {
        println!(
            "  {}: {} objects, gvt={}, end={}, {}",
            report.node,
            report.objects.len(),
            report.gvt,
            report.end_time,
            report.counters
        );
    }
    println!();
    println!("  committed events: {}", counters.committed_events());
    println!("  rollbacks:        {}", counters.rollbacks);
    println!("  remote messages:  {}", counters.remote_messages);
    println!("  end time:         {end_time}");
    println!("  wall time:        {:.3}s", wall.as_secs_f64());
    println!("  model digest:     {:016x}", model_digest(reports));
}
