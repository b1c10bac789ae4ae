use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use transform_lite::checkpoint::{CheckpointStore, DefinitionStore, FileStore, MemoryStore};
use transform_lite::cluster::eligibility::{self, NODE_ROLES_SETTING};
use transform_lite::cluster::{ClusterService, EligibilityOptions};
use transform_lite::config::{DynamicSettings, NodeConfig, NodeSettings, TransformSettings};
use transform_lite::node::{Node, NodeDeps};
use transform_lite::scheduler::SystemClock;
use transform_lite::shutdown::install_shutdown_handler;
use transform_lite::transform::{
    Document, JobDefinition, MemoryDestination, TracingAuditor, TransformService, TransformStats,
    VecSource,
};

#[derive(Parser, Debug)]
#[command(name = "transform-lite")]
#[command(version)]
#[command(about = "Persistent transform task coordinator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster that drives continuous transforms
    Simulate(SimulateArgs),

    /// Resolve transform eligibility for a set of node settings
    CheckNode(CheckNodeArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Simulate
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of transform-eligible nodes
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of transforms to create and start
    #[arg(long, default_value = "2")]
    transforms: usize,

    /// Documents seeded into each source index
    #[arg(long, default_value = "5000")]
    docs: usize,

    /// Page size of each increment
    #[arg(long, default_value = "500")]
    page_size: usize,

    /// Seconds between ticks of each transform
    #[arg(long, default_value = "1")]
    frequency_secs: u64,

    /// How long to run before printing stats
    #[arg(long, default_value = "15")]
    duration_secs: u64,

    /// Consecutive retryable failures tolerated before a transform fails
    #[arg(long, default_value = "10")]
    max_retries: u32,

    /// Persist checkpoints and definitions under this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Shut node 1 down after this many seconds to exercise reassignment
    #[arg(long)]
    kill_node_after_secs: Option<u64>,

    /// Judge nodes without `node.roles` as ineligible
    #[arg(long)]
    no_legacy_inference: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Serialize)]
struct TransformSummary {
    stats: TransformStats,
    destination_documents: usize,
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let options = EligibilityOptions {
        legacy_inference: !args.no_legacy_inference,
    };

    let (checkpoints, definitions): (Arc<dyn CheckpointStore>, Arc<dyn DefinitionStore>) =
        match &args.data_dir {
            Some(dir) => {
                let store = Arc::new(FileStore::open(dir).await?);
                (store.clone() as Arc<dyn CheckpointStore>, store as Arc<dyn DefinitionStore>)
            }
            None => {
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn CheckpointStore>, store as Arc<dyn DefinitionStore>)
            }
        };

    let source = Arc::new(VecSource::new());
    let dest = Arc::new(MemoryDestination::new());
    let node_config = NodeConfig::default();
    let cluster = Arc::new(ClusterService::new(
        options,
        Duration::from_millis(node_config.heartbeat_interval_ms * 4),
    ));
    let transform_settings = TransformSettings::default().with_max_retries(args.max_retries);
    transform_settings.validate()?;
    let settings = DynamicSettings::new(transform_settings.clone());

    let deps = NodeDeps {
        cluster: cluster.clone(),
        checkpoints: checkpoints.clone(),
        definitions: definitions.clone(),
        source: source.clone(),
        dest: dest.clone(),
        audit: Arc::new(TracingAuditor),
        clock: Arc::new(SystemClock),
        settings,
    };

    let mut node_tokens = Vec::new();
    let mut node_tasks = Vec::new();
    for node_id in 1..=args.nodes {
        let config = NodeConfig::new(node_id)
            .with_setting(NODE_ROLES_SETTING, "master,data,transform")
            .with_transform_settings(transform_settings.clone());
        let config = NodeConfig {
            eligibility: options,
            ..config
        };
        let node = Node::new(config, deps.clone())?;
        let token = shutdown.child_token();
        node_tokens.push(token.clone());
        node_tasks.push(tokio::spawn(node.run(token)));
    }

    let reaper_cluster = cluster.clone();
    let reaper_shutdown = shutdown.clone();
    let reaper_interval = Duration::from_millis(node_config.heartbeat_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        loop {
            tokio::select! {
                _ = reaper_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    reaper_cluster.reap_dead_nodes().await;
                }
            }
        }
    });

    let service = TransformService::new(definitions, checkpoints, cluster.clone());
    let mut job_ids = Vec::new();
    for i in 0..args.transforms {
        let source_index = format!("source-{}", i);
        source
            .append(
                &source_index,
                (0..args.docs).map(|n| {
                    Document::new(
                        format!("{}-{}", source_index, n),
                        json!({ "seq": n, "bucket": n % 10 }),
                    )
                }),
            )
            .await;

        let job_id = format!("transform-{}", i);
        let definition = JobDefinition::new(&job_id, &source_index, &format!("dest-{}", i))
            .with_frequency(Duration::from_secs(args.frequency_secs))
            .with_max_page_size(args.page_size)
            .with_description("simulated continuous transform");
        if service.get(&job_id).await.is_err() {
            service.put(definition).await?;
        } else {
            service.update(definition).await?;
        }
        service.start(&job_id).await?;
        job_ids.push(job_id);
    }

    if let Some(after) = args.kill_node_after_secs {
        if let Some(token) = node_tokens.first().cloned() {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(after)).await;
                tracing::warn!(node_id = 1, "Shutting node down to force reassignment");
                token.cancel();
            });
        }
    }

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
    }

    let mut summaries = Vec::new();
    for (i, job_id) in job_ids.iter().enumerate() {
        summaries.push(TransformSummary {
            stats: service.stats(job_id).await?,
            destination_documents: dest.count(&format!("dest-{}", i)).await,
        });
    }

    shutdown.cancel();
    for task in node_tasks {
        task.await??;
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
        OutputFormat::Table => print_summary_table(&summaries),
    }
    Ok(())
}

fn print_summary_table(summaries: &[TransformSummary]) {
    println!(
        "{:<16} {:<8} {:<10} {:<10} {:<10} {:<8}",
        "TRANSFORM", "NODE", "STATUS", "CHECKPOINT", "INDEXED", "RETRIES"
    );
    println!("{}", "-".repeat(68));
    for summary in summaries {
        let stats = &summary.stats;
        let node = stats
            .assignment
            .as_ref()
            .map_or("-".to_string(), |a| a.node_id.to_string());
        let status = stats
            .status
            .as_ref()
            .map_or("unassigned".to_string(), |s| s.status.to_string());
        let checkpoint = stats
            .checkpoint
            .as_ref()
            .map_or("-".to_string(), |c| c.sequence_number.to_string());
        let retries = stats.status.as_ref().map_or(0, |s| s.retry_count);
        println!(
            "{:<16} {:<8} {:<10} {:<10} {:<10} {:<8}",
            stats.definition.id, node, status, checkpoint, summary.destination_documents, retries
        );
    }
}

// =============================================================================
// Check node
// =============================================================================

#[derive(Parser, Debug)]
struct CheckNodeArgs {
    /// Node setting as key=value, e.g. node.roles=data,transform (repeatable)
    #[arg(long = "setting", short = 's')]
    settings: Vec<String>,

    /// Judge nodes without `node.roles` as ineligible
    #[arg(long)]
    no_legacy_inference: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

fn run_check_node(args: CheckNodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = NodeSettings::new();
    for raw in &args.settings {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("Expected key=value, got [{}]", raw))?;
        settings = settings.with(key.trim(), value.trim());
    }
    let options = EligibilityOptions {
        legacy_inference: !args.no_legacy_inference,
    };

    let attributes = eligibility::startup_attributes(&settings, &options)?;
    let resolved = eligibility::resolve(&settings, &options)?;

    match args.output {
        OutputFormat::Json => {
            let out = json!({ "eligibility": resolved, "attributes": attributes });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Eligible:   {}", resolved.eligible);
            println!("Source:     {:?}", resolved.source);
            println!("Attributes:");
            for (key, value) in &attributes {
                println!("  {} = {}", key, value);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(sim_args) => run_simulation(sim_args).await?,
        Commands::CheckNode(check_args) => run_check_node(check_args)?,
    }
    Ok(())
}
