use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use senrich_inference::{MockSeniorityModel, ModelServerState};
use senrich_pipeline::{run_pipeline, PipelineConfig, RunOptions};
use senrich_storage::{write_sample_files, FsObjectStore, SampleGenerator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "senrich")]
#[command(about = "Seniority enrichment pipeline for scraped job postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the download prefix and enrich new files.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Exit once no new file is found and all queues drained.
        #[arg(long)]
        once: bool,
        #[arg(long)]
        memory_cache: bool,
        #[arg(long)]
        local_model: bool,
    },
    /// Serve the rule-based seniority model over HTTP.
    ServeModel {
        #[arg(long, default_value = "0.0.0.0:50051")]
        addr: SocketAddr,
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },
    /// Write synthetic raw posting files.
    Generate {
        #[arg(long, default_value = "./bucket")]
        bucket_dir: PathBuf,
        #[arg(long, default_value = "job-postings-raw")]
        prefix: String,
        #[arg(long, default_value_t = 18000)]
        total: usize,
        #[arg(long, default_value_t = 6000)]
        split: usize,
        #[arg(long)]
        start_timestamp: Option<i64>,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        config: None,
        once: false,
        memory_cache: false,
        local_model: false,
    });

    match command {
        Commands::Run {
            config,
            once,
            memory_cache,
            local_model,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::from_yaml_file(&path)?,
                None => PipelineConfig::from_env(),
            };
            let options = RunOptions {
                once,
                memory_cache,
                local_model,
            };
            let summary = run_pipeline(config, options).await?;
            println!(
                "run complete: run_id={} files={} rejected={} postings={} groups={} \
                 cache_hits={} inference_entries={}",
                summary.run_id,
                summary.ingestion.files_ingested,
                summary.ingestion.files_rejected,
                summary.ingestion.postings_ingested,
                summary.completion.groups_flushed,
                summary.cache.hits,
                summary.inference.request_entries
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ServeModel { addr, delay_ms } => {
            let state = ModelServerState {
                model: MockSeniorityModel,
                batch_delay: Duration::from_millis(delay_ms),
            };
            senrich_inference::serve(addr, state)
                .await
                .with_context(|| format!("serving model on {addr}"))?;
        }
        Commands::Generate {
            bucket_dir,
            prefix,
            total,
            split,
            start_timestamp,
            seed,
        } => {
            let start = start_timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let mut generator = match seed {
                Some(seed) => SampleGenerator::seeded(seed),
                None => SampleGenerator::from_entropy(),
            };
            let files = generator.generate(total, split, start);
            let store = FsObjectStore::new(bucket_dir);
            let keys = write_sample_files(&store, &prefix, &files)
                .await
                .context("writing sample files")?;
            for key in &keys {
                info!(key = %key, "wrote sample file");
            }
            println!("generated {} postings across {} files", total, keys.len());
        }
    }

    Ok(())
}
