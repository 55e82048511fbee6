//! Command line driver for the AI-CORE data pipeline
//!
//! Runs the validation engine over local files, executes ETL jobs from a
//! pipeline definition and, with the `kafka` feature, runs stream processors
//! until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use data_pipeline_service::{
    connector::{FileFormat, FileSource, SourceKind},
    store::{InMemoryStore, PgStore, RelationalStore},
    validation::{CleansingRule, ValidationEngine, ValidationRule},
    Config, DataPipeline, DataSourceConfig, PipelineDefinition, Record,
};

/// Command line arguments for the data pipeline
#[derive(Parser, Debug)]
#[command(name = "data-pipeline")]
#[command(about = "AI-CORE data ingestion pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DATA_PIPELINE_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a dataset and print its quality report
    Validate {
        /// Validation rules (YAML or JSON list)
        #[arg(long)]
        rules: PathBuf,
        /// Records to validate (CSV or JSON)
        #[arg(long)]
        input: PathBuf,
    },
    /// Report outliers of one numeric field
    Anomalies {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        field: String,
    },
    /// Normalize emails, phone numbers, amounts and dates
    Cleanse {
        #[arg(long)]
        input: PathBuf,
        /// Comma separated: email,phone,currency,date
        #[arg(long, value_delimiter = ',', default_value = "email,phone,currency,date")]
        rules: Vec<CleansingRule>,
    },
    /// Execute every job of a pipeline definition once
    RunJob {
        #[arg(long)]
        definition: PathBuf,
        /// Only run this job
        #[arg(long)]
        job: Option<String>,
        /// Load destination; an in-memory store is used when unset
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Run the stream processors of a pipeline definition until Ctrl-C
    Stream {
        #[arg(long)]
        definition: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };
    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.monitoring.log_format = match format {
            LogFormat::Json => "json".to_string(),
            LogFormat::Pretty => "pretty".to_string(),
        };
    }
    config.validate().context("invalid configuration")?;

    init_tracing(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting AI-CORE data pipeline"
    );

    match args.command {
        Command::Validate { rules, input } => validate(&config, &rules, &input).await,
        Command::Anomalies { input, field } => anomalies(&config, &input, &field).await,
        Command::Cleanse { input, rules } => cleanse(&config, &input, &rules).await,
        Command::RunJob {
            definition,
            job,
            database_url,
        } => run_job(config, &definition, job.as_deref(), database_url.as_deref()).await,
        Command::Stream { definition } => stream(config, &definition).await,
    }
}

/// Initialize tracing/logging system
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("data_pipeline_service={0},data_pipeline={0}", config.monitoring.log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.monitoring.log_format == "pretty" {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .init();
    }
}

/// Read a CSV or JSON file through a throwaway file source
async fn load_records(config: &Config, path: &Path) -> anyhow::Result<Vec<Record>> {
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => FileFormat::Csv,
        Some("json") | Some("jsonl") | Some("ndjson") => FileFormat::Json,
        _ => bail!("{} is neither a CSV nor a JSON file", path.display()),
    };

    let pipeline = DataPipeline::new(config.clone(), Arc::new(InMemoryStore::new()))?;
    let source = DataSourceConfig::new(
        "input",
        path.display().to_string(),
        SourceKind::File(FileSource {
            path: path.to_path_buf(),
            format,
            encoding: "utf-8".to_string(),
            delimiter: ',',
            has_header: true,
        }),
    );
    pipeline.connector().register_data_source(source).await?;

    let result = pipeline
        .connector()
        .extract_data("input", "", &Default::default())
        .await;
    match result.error {
        Some(error) => bail!("failed to read {}: {}", path.display(), error),
        None => Ok(result.data),
    }
}

fn load_rules(path: &Path) -> anyhow::Result<Vec<ValidationRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules from {}", path.display()))?;
    let rules = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };
    Ok(rules)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn validate(config: &Config, rules: &Path, input: &Path) -> anyhow::Result<()> {
    let rules = load_rules(rules)?;
    let records = load_records(config, input).await?;
    let (_, report) = ValidationEngine::default().validate_dataset(&records, &rules);
    info!(
        total = report.total_records,
        invalid = report.invalid_records,
        "Dataset validated"
    );
    print_json(&report)
}

async fn anomalies(config: &Config, input: &Path, field: &str) -> anyhow::Result<()> {
    let records = load_records(config, input).await?;
    let report = ValidationEngine::default().detect_anomalies(&records, field);
    print_json(&report)
}

async fn cleanse(config: &Config, input: &Path, rules: &[CleansingRule]) -> anyhow::Result<()> {
    let records = load_records(config, input).await?;
    let cleaned = ValidationEngine::default().cleanse_data(&records, rules);
    print_json(&cleaned)
}

async fn run_job(
    config: Config,
    definition: &Path,
    only: Option<&str>,
    database_url: Option<&str>,
) -> anyhow::Result<()> {
    let definition = PipelineDefinition::from_file(definition)
        .with_context(|| format!("loading pipeline definition {}", definition.display()))?;

    let store: Arc<dyn RelationalStore> = match database_url {
        Some(url) => Arc::new(
            PgStore::connect(
                url,
                config.connector.relational_max_connections,
                std::time::Duration::from_secs(config.connector.relational_acquire_timeout_secs),
            )
            .await?,
        ),
        None => {
            warn!("No database URL given, loading into an in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let pipeline = DataPipeline::new(config, store)?;
    let job_ids: Vec<String> = definition
        .jobs
        .iter()
        .map(|job| job.id.clone())
        .filter(|id| only.map_or(true, |only| only == id))
        .collect();
    if job_ids.is_empty() {
        bail!("no matching job in the definition");
    }
    pipeline.apply_definition(definition).await?;

    let mut failed = false;
    for job_id in job_ids {
        let result = pipeline.etl().execute_job(&job_id).await?;
        failed |= !result.success;
        print_json(&result)?;
    }
    pipeline.stop().await;

    if failed {
        bail!("one or more jobs failed");
    }
    Ok(())
}

#[cfg(feature = "kafka")]
async fn stream(config: Config, definition: &Path) -> anyhow::Result<()> {
    use data_pipeline_service::broker::KafkaBroker;

    let definition = PipelineDefinition::from_file(definition)
        .with_context(|| format!("loading pipeline definition {}", definition.display()))?;
    let broker = Arc::new(KafkaBroker::new(&config.kafka, config.stream.channel_capacity)?);
    let pipeline = DataPipeline::new(config, Arc::new(InMemoryStore::new()))?;

    let mut processors = Vec::new();
    for processor_config in pipeline.apply_definition(definition).await? {
        let processor = pipeline.stream_processor(processor_config, broker.clone())?;
        processor.start().await?;
        processors.push(processor);
    }
    if processors.is_empty() {
        bail!("the definition has no stream processors");
    }
    pipeline.start()?;
    info!(count = processors.len(), "Stream processors running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for processor in &processors {
        if let Err(e) = processor.stop().await {
            warn!(processor_id = %processor.id(), error = %e, "Error stopping stream processor");
        }
        print_json(&processor.get_stats().await)?;
    }
    pipeline.quality().evaluate_now();
    print_json(&pipeline.quality().generate_report())?;
    pipeline.stop().await;
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn stream(_config: Config, _definition: &Path) -> anyhow::Result<()> {
    bail!("stream processing needs a build with the `kafka` feature")
}
