use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ddl_scheduler::config::DdlConfig;
use ddl_scheduler::meta::MemStore;
use ddl_scheduler::node::Ddl;
use ddl_scheduler::owner::{ElectionKey, MemElection};
use ddl_scheduler::scheduler::{Job, JobType};
use ddl_scheduler::shutdown::install_shutdown_handler;
use ddl_scheduler::syncer::{spawn_member, MemSchemaSyncer};
use ddl_scheduler::worker::staged::{reference_handlers_with, BackfillHandler};

#[derive(Parser, Debug)]
#[command(name = "ddl-scheduler")]
#[command(version)]
#[command(about = "Owner-elected schema change scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Boot an in-memory cluster, run a sample workload and print history
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of cluster members (one of them becomes owner)
    #[arg(long, default_value = "3")]
    members: usize,

    /// Schema lease in milliseconds
    #[arg(long, default_value = "200")]
    lease_ms: u64,

    /// Delay before retrying a failed job, in milliseconds
    #[arg(long, default_value = "200")]
    error_backoff_ms: u64,

    /// Batches each add-index backfill processes
    #[arg(long, default_value = "20")]
    backfill_batches: usize,

    /// Cancel the second add-index job while it backfills
    #[arg(long)]
    cancel_backfill: bool,

    /// Keep the cluster running after the workload until SIGINT/SIGTERM
    #[arg(long)]
    hold: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct HistoryItem {
    id: i64,
    job_type: String,
    state: String,
    schema_state: String,
    dependency_id: i64,
    schema_version: i64,
    error: Option<String>,
    finished_at: Option<String>,
}

impl From<&Job> for HistoryItem {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.to_string(),
            state: job.state.to_string(),
            schema_state: job.schema_state.to_string(),
            dependency_id: job.dependency_id,
            schema_version: job.binlog_info.schema_version,
            error: job.error.clone(),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

struct Cluster {
    members: Vec<Ddl>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Cluster {
    fn start(args: &RunArgs) -> Self {
        let lease = Duration::from_millis(args.lease_ms);
        let shutdown = CancellationToken::new();
        let template = DdlConfig::new("template", lease);
        let store = Arc::new(MemStore::from_config(&template));
        let syncer = Arc::new(MemSchemaSyncer::new(template.member_ttl));
        let key = Arc::new(ElectionKey::new());
        let heartbeat = (lease / 2).max(Duration::from_millis(10));

        let mut members = Vec::with_capacity(args.members);
        let mut tasks = Vec::new();
        for i in 0..args.members.max(1) {
            let id = format!("member-{}", i);
            let config = DdlConfig::new(id.clone(), lease)
                .with_error_backoff(Duration::from_millis(args.error_backoff_ms));
            let election = Arc::new(MemElection::new(id.clone(), key.clone(), config.member_ttl));
            tasks.push(tokio::spawn(election.clone().campaign(shutdown.clone())));
            tasks.push(spawn_member(syncer.clone(), id, heartbeat, shutdown.clone()));

            let backfill = BackfillHandler::new(args.backfill_batches, Duration::from_millis(10));
            let ddl = Ddl::builder(config, store.clone(), election, syncer.clone())
                .handlers(reference_handlers_with(backfill))
                .build();
            ddl.start();
            members.push(ddl);
        }
        tracing::info!(members = members.len(), lease_ms = args.lease_ms, "Cluster started");

        Self {
            members,
            shutdown,
            tasks,
        }
    }

    fn any_member(&self) -> &Ddl {
        &self.members[0]
    }

    async fn stop(self) {
        for ddl in &self.members {
            ddl.stop().await;
        }
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn sample_workload() -> Vec<Job> {
    vec![
        Job::new(JobType::CreateSchema, 1, 0).with_query("CREATE DATABASE shop"),
        Job::new(JobType::CreateTable, 1, 10).with_query("CREATE TABLE shop.orders (id BIGINT)"),
        Job::new(JobType::AddColumn, 1, 10)
            .with_args(vec![json!({"name": "amount", "type": "decimal"}), json!(1)])
            .with_query("ALTER TABLE shop.orders ADD COLUMN amount DECIMAL"),
        Job::new(JobType::AddIndex, 1, 10)
            .with_args(vec![json!(false), json!("idx_amount")])
            .with_query("ALTER TABLE shop.orders ADD INDEX idx_amount (amount)"),
        Job::new(JobType::CreateTable, 1, 11).with_query("CREATE TABLE shop.items (id BIGINT)"),
        Job::new(JobType::AddIndex, 1, 11)
            .with_args(vec![json!(true), json!("idx_id")])
            .with_query("ALTER TABLE shop.items ADD UNIQUE INDEX idx_id (id)"),
        Job::new(JobType::TruncateTable, 1, 11)
            .with_args(vec![json!(12)])
            .with_query("TRUNCATE TABLE shop.items"),
        Job::new(JobType::RenameTable, 1, 10)
            .with_args(vec![json!(1)])
            .with_query("RENAME TABLE shop.orders TO shop.purchases"),
        Job::new(JobType::DropColumn, 1, 10)
            .with_args(vec![json!("amount")])
            .with_query("ALTER TABLE shop.purchases DROP COLUMN amount"),
    ]
}

async fn run_workload(cluster: &Cluster, cancel_backfill: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ddl = cluster.any_member();
    let mut ids = Vec::new();
    for job in sample_workload() {
        ids.push(ddl.submit(job)?);
    }

    let mut add_index_seen = 0;
    for id in ids {
        let status = ddl.get_status(id)?;
        if cancel_backfill && status.job_type == JobType::AddIndex {
            add_index_seen += 1;
            if add_index_seen == 2 {
                wait_for_backfill(ddl, id).await?;
                for res in ddl.cancel_jobs(&[id])? {
                    if let Err(e) = res {
                        tracing::warn!(job_id = id, error = %e, "Cancel request rejected");
                    }
                }
            }
        }
        let job = ddl.wait_job_done(id).await?;
        tracing::info!(job_id = id, state = %job.state, "Job archived");
    }
    Ok(())
}

/// Polls until job `id` reaches its backfill phase or finishes.
async fn wait_for_backfill(ddl: &Ddl, id: i64) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match ddl.get_status(id) {
            Ok(job) if job.is_reorg_in_progress() || job.finished_at.is_some() => return Ok(()),
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_history(jobs: &[Job], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let items: Vec<HistoryItem> = jobs.iter().map(HistoryItem::from).collect();
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<5} {:<22} {:<14} {:<13} {:<8} ERROR",
                "ID", "TYPE", "STATE", "SCHEMA STATE", "DEPENDS"
            );
            println!("{}", "-".repeat(78));
            for item in &items {
                println!(
                    "{:<5} {:<22} {:<14} {:<13} {:<8} {}",
                    item.id,
                    item.job_type,
                    item.state,
                    item.schema_state,
                    item.dependency_id,
                    item.error.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{} jobs archived", items.len());
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cluster = Cluster::start(&args);
    let result = run_workload(&cluster, args.cancel_backfill).await;

    if result.is_ok() {
        let mut history = cluster.any_member().history_jobs(usize::MAX)?;
        history.reverse();
        print_history(&history, &args.output)?;
    }

    if args.hold {
        let token = CancellationToken::new();
        let handler = install_shutdown_handler(token.clone());
        tracing::info!("Workload finished, waiting for SIGINT/SIGTERM");
        token.cancelled().await;
        let _ = handler.await;
    }

    cluster.stop().await;
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run(run_args).await?;
        }
    }

    Ok(())
}
