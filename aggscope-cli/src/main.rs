mod commands;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aggscope::{AggregationService, Config, IndexRegistry, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "aggscope")]
#[command(about = "Run aggregations over JSON documents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "aggscope.toml", global = true)]
    config: PathBuf,

    /// Load a JSON lines file into an index (INDEX=FILE), repeatable
    #[arg(long = "load", value_parser = parse_load, global = true)]
    load: Vec<(String, PathBuf)>,

    #[command(subcommand)]
    command: Commands,
}

/// Entity, index override and filter shared by the aggregation commands
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Entity type whose indices are searched
    #[arg(short, long)]
    pub entity: String,

    /// Explicit index, overriding the entity's indices; repeatable
    #[arg(short, long = "index")]
    pub indices: Vec<String>,

    /// Query DSL filter as JSON
    #[arg(short, long)]
    pub filter: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured entity types and their search indices
    Entities,

    /// Single metric, grouped by up to two bucket fields
    Metric {
        #[command(flatten)]
        target: TargetArgs,

        /// Metric field
        #[arg(long)]
        field: String,

        /// sum, count, avg, min or max
        #[arg(long, default_value = "sum")]
        op: String,

        /// Bucket field; give twice for a drill-down
        #[arg(short, long = "bucket")]
        buckets: Vec<String>,
    },

    /// Count, min, max, sum and avg of a field
    Stats {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        #[arg(short, long)]
        bucket: Option<String>,
    },

    /// Distinct value count of a field
    Cardinality {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,
    },

    /// Percentiles of a field
    Percentiles {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        /// Comma-separated percents; defaults to the configured ones
        #[arg(long, value_delimiter = ',')]
        percents: Vec<f64>,
    },

    /// Percentile ranks of values of a field
    Ranks {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        /// Comma-separated field values
        #[arg(long, value_delimiter = ',', required = true)]
        values: Vec<f64>,
    },

    /// One metric per named filter
    Filters {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        #[arg(long, default_value = "sum")]
        op: String,

        /// Named filter as NAME=JSON; repeatable
        #[arg(long = "named", required = true)]
        named: Vec<String>,
    },

    /// One metric per numeric interval
    Histogram {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        #[arg(long, default_value = "count")]
        op: String,

        #[arg(short, long)]
        bucket: String,

        #[arg(long)]
        interval: f64,
    },

    /// One metric per time interval
    DateHistogram {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        field: String,

        #[arg(long, default_value = "count")]
        op: String,

        #[arg(short, long)]
        bucket: String,

        /// Interval such as 1d, 2h, month
        #[arg(long)]
        interval: String,
    },

    /// Send an aggregation request body unchanged
    Raw {
        #[arg(short, long)]
        entity: String,

        #[arg(short, long = "index")]
        indices: Vec<String>,

        /// Request JSON, or @FILE to read it from a file
        request: String,
    },
}

fn parse_load(s: &str) -> Result<(String, PathBuf)> {
    let (index, path) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected INDEX=FILE, got '{}'", s))?;
    if index.is_empty() {
        return Err(anyhow!("index name must not be empty"));
    }
    Ok((index.to_string(), PathBuf::from(path)))
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.logging.format.clone());

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;
    init_tracing(&config);
    tracing::debug!(config = ?cli.config, entities = config.entities.len(), "Loaded config");

    let store = Arc::new(MemoryStore::new());
    for (index, path) in &cli.load {
        store.load_jsonl(index, path)?;
    }

    let registry = Arc::new(IndexRegistry::new(Arc::new(config.metadata_source())));
    let service = AggregationService::with_settings(store, registry, config.settings());

    let output = match cli.command {
        Commands::Entities => commands::list_entities(&config),
        Commands::Metric {
            target,
            field,
            op,
            buckets,
        } => commands::run_metric(&service, &target, &field, &op, &buckets).await?,
        Commands::Stats {
            target,
            field,
            bucket,
        } => commands::run_stats(&service, &target, &field, bucket.as_deref()).await?,
        Commands::Cardinality { target, field } => {
            commands::run_cardinality(&service, &target, &field).await?
        }
        Commands::Percentiles {
            target,
            field,
            percents,
        } => commands::run_percentiles(&service, &target, &field, &percents).await?,
        Commands::Ranks {
            target,
            field,
            values,
        } => commands::run_ranks(&service, &target, &field, &values).await?,
        Commands::Filters {
            target,
            field,
            op,
            named,
        } => commands::run_filters(&service, &target, &field, &op, &named).await?,
        Commands::Histogram {
            target,
            field,
            op,
            bucket,
            interval,
        } => commands::run_histogram(&service, &target, &field, &op, &bucket, interval).await?,
        Commands::DateHistogram {
            target,
            field,
            op,
            bucket,
            interval,
        } => {
            commands::run_date_histogram(&service, &target, &field, &op, &bucket, &interval)
                .await?
        }
        Commands::Raw {
            entity,
            indices,
            request,
        } => commands::run_raw(&service, &entity, &indices, &request).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
