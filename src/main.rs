//! tsagg CLI
//!
//! Command-line interface for the aggregation engine:
//! - Ingest points from CSV
//! - Run bucketed aggregation queries
//! - Benchmark a query under concurrent load
//! - Show storage and index statistics

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsagg::config::{generate_default_config, Config, LoggingConfig};
use tsagg::import::{parse_timestamp, CsvImporter};
use tsagg::query::{
    AggregationSpec, BucketUnit, CancellationToken, QueryDescriptor, QueryExecutor, QueryOptions,
    QueryOutput, ScanPreference,
};
use tsagg::storage::StorageEngine;

#[derive(Parser)]
#[command(name = "tsagg")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-bucketed aggregation over a tag-indexed time-series store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest points from a CSV file
    Ingest {
        /// Path to CSV file
        path: PathBuf,
        /// Measurement for rows without a measurement column
        #[arg(short, long)]
        measurement: Option<String>,
        /// Points per ingest batch
        #[arg(long, default_value = "10000")]
        batch_size: usize,
        /// Seal ingested points into a segment afterwards
        #[arg(long)]
        checkpoint: bool,
    },

    /// Run an aggregation query
    Query {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Run one query repeatedly from concurrent workers
    Bench {
        #[command(flatten)]
        query: QueryArgs,
        /// Concurrent workers
        #[arg(short, long, default_value = "4")]
        workers: usize,
        /// Queries per worker
        #[arg(short, long, default_value = "100")]
        iterations: usize,
    },

    /// Show storage and index statistics
    Stats,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Clone)]
pub struct QueryArgs {
    /// Measurement to query
    measurement: String,
    /// Tag filter as key=v1,v2 (repeatable; values are OR'ed, keys AND'ed)
    #[arg(short = 'T', long = "tag")]
    tags: Vec<String>,
    /// Range start (epoch ms or RFC 3339)
    #[arg(long)]
    start: Option<String>,
    /// Range end, exclusive (epoch ms or RFC 3339)
    #[arg(long)]
    end: Option<String>,
    /// Bucket unit (millisecond, second, minute, hour, day)
    #[arg(short, long, default_value = "minute")]
    bucket: BucketUnit,
    /// Units per bucket
    #[arg(long, default_value = "1")]
    bin_size: u32,
    /// Aggregation as op:field[:name] (repeatable)
    #[arg(short, long = "agg", required = true)]
    aggs: Vec<AggregationSpec>,
    /// Scan strategy (auto, index, full)
    #[arg(long)]
    scan: Option<ScanPreference>,
}

impl QueryArgs {
    fn descriptor(&self) -> anyhow::Result<QueryDescriptor> {
        let mut builder = QueryDescriptor::builder(&self.measurement)
            .bucket(self.bucket)
            .bin_size(self.bin_size);

        for tag in &self.tags {
            let Some((key, values)) = tag.split_once('=') else {
                bail!("Invalid tag filter {:?}, expected key=v1,v2", tag);
            };
            builder = builder.tag_in(key, values.split(',').map(str::trim));
        }

        let start = match &self.start {
            Some(s) => parse_timestamp(s).map_err(anyhow::Error::msg)?,
            None => i64::MIN,
        };
        let end = match &self.end {
            Some(s) => parse_timestamp(s).map_err(anyhow::Error::msg)?,
            None => i64::MAX,
        };
        builder = builder.time_range(start, end);

        for spec in &self.aggs {
            builder = builder.aggregate(spec.clone());
        }
        Ok(builder.build())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    init_logging(&config.logging);

    match cli.command {
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &content)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }

        Commands::Ingest {
            path,
            measurement,
            batch_size,
            checkpoint,
        } => {
            let engine = open_engine(&config)?;

            let mut importer = CsvImporter::new();
            if let Some(measurement) = measurement {
                importer = importer.with_measurement(measurement);
            }
            let result = importer
                .import(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;

            let mut ingested = 0;
            for chunk in result.points.chunks(batch_size.max(1)) {
                let range = engine.ingest_batch(chunk.to_vec())?;
                ingested += range.end - range.start;
            }
            engine.flush()?;
            if checkpoint {
                engine.checkpoint()?;
            }

            println!("Import results:");
            println!("  Rows processed: {}", result.rows_processed);
            println!("  Rows failed: {}", result.rows_failed);
            println!("  Points ingested: {}", ingested);
            if !result.errors.is_empty() {
                println!();
                println!("Errors (first 10):");
                for error in result.errors.iter().take(10) {
                    println!("  {}", error);
                }
            }
        }

        Commands::Query { query } => {
            let engine = open_engine(&config)?;
            let descriptor = query.descriptor()?;
            let executor = engine.executor(config.query_config());

            let options = QueryOptions {
                scan: query.scan,
                cancel: None,
            };
            let output = executor.execute_with(&descriptor, &options)?;

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&output_json(&output))?),
                _ => print_table(&output),
            }
        }

        Commands::Bench {
            query,
            workers,
            iterations,
        } => {
            let engine = open_engine(&config)?;
            let descriptor = query.descriptor()?;
            let executor = engine.executor(config.query_config());

            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(run_bench(
                executor,
                descriptor,
                query.scan,
                workers.max(1),
                iterations,
            ))?;
            println!("{}", report);
        }

        Commands::Stats => {
            let engine = open_engine(&config)?;
            let stats = engine.stats()?;

            match cli.format.as_str() {
                "json" => {
                    let json = serde_json::json!({
                        "points": stats.store.points,
                        "sealed_points": stats.store.sealed_points,
                        "segments": stats.store.segment_count,
                        "segment_bytes": stats.store.segment_bytes,
                        "wal_entries": stats.store.wal_entries,
                        "measurements": stats.index.measurements,
                        "posting_lists": stats.index.posting_lists,
                        "index_entries": stats.index.total_entries,
                    });
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
                _ => {
                    println!("tsagg v{}", env!("CARGO_PKG_VERSION"));
                    println!("Data directory: {:?}", config.data_dir());
                    println!();
                    println!("{}", stats);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("tsagg={}", logging.level)));
    let json = logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn open_engine(config: &Config) -> anyhow::Result<StorageEngine> {
    let data_dir = config.data_dir();
    tracing::debug!("Data directory: {:?}", data_dir);
    StorageEngine::open(config.storage_config())
        .with_context(|| format!("Failed to open data directory {:?}", data_dir))
}

fn output_json(output: &QueryOutput) -> serde_json::Value {
    serde_json::json!({
        "columns": output.columns,
        "rows": output.rows,
        "trace": output.trace,
    })
}

fn print_table(output: &QueryOutput) {
    if output.is_empty() {
        println!("No data for the selected time range");
        return;
    }

    print!("{:<24}", "bucket");
    for column in &output.columns {
        print!(" | {:<16}", column);
    }
    println!();
    println!("{}", "-".repeat(24 + output.columns.len() * 19));

    for row in &output.rows {
        let bucket = chrono::DateTime::from_timestamp_millis(row.timestamp)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_else(|| row.timestamp.to_string());
        print!("{:<24}", bucket);
        for column in &output.columns {
            let value = row
                .get(column)
                .map(|v| format!("{}", v))
                .unwrap_or_else(|| "-".to_string());
            print!(" | {:<16}", value);
        }
        println!();
    }

    println!();
    println!(
        "{} buckets, plan {}, {} points examined, {} ms",
        output.rows.len(),
        output.trace.plan_summary,
        output.trace.docs_examined,
        output.trace.duration_ms
    );
}

/// Latency summary of a bench run
struct BenchReport {
    latencies: Vec<Duration>,
    cancelled: usize,
    failed: usize,
    wall: Duration,
    plans: BTreeMap<String, usize>,
}

impl std::fmt::Display for BenchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.latencies.len();
        writeln!(f, "Queries: {} ok, {} cancelled, {} failed", n, self.cancelled, self.failed)?;
        writeln!(f, "Wall time: {:.2?}", self.wall)?;
        for (plan, count) in &self.plans {
            writeln!(f, "Plan: {} ({}x)", plan, count)?;
        }
        if n == 0 {
            return Ok(());
        }

        let pct = |p: f64| self.latencies[((n - 1) as f64 * p).round() as usize];
        let mean = self.latencies.iter().sum::<Duration>() / n as u32;
        writeln!(f, "Throughput: {:.1} queries/s", n as f64 / self.wall.as_secs_f64())?;
        write!(
            f,
            "Latency: min {:.2?}, p50 {:.2?}, p95 {:.2?}, p99 {:.2?}, max {:.2?}, mean {:.2?}",
            self.latencies[0],
            pct(0.50),
            pct(0.95),
            pct(0.99),
            self.latencies[n - 1],
            mean
        )
    }
}

async fn run_bench(
    executor: QueryExecutor,
    descriptor: QueryDescriptor,
    scan: Option<ScanPreference>,
    workers: usize,
    iterations: usize,
) -> anyhow::Result<BenchReport> {
    let token = CancellationToken::new();
    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling in-flight queries");
                token.cancel();
            }
        })
    };

    let executor = Arc::new(executor);
    let descriptor = Arc::new(descriptor);
    let options = QueryOptions {
        scan,
        cancel: Some(token.clone()),
    };

    let started = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let executor = Arc::clone(&executor);
        let descriptor = Arc::clone(&descriptor);
        let options = options.clone();
        let token = token.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let mut outcomes = Vec::with_capacity(iterations);
            for _ in 0..iterations {
                if token.is_cancelled() {
                    break;
                }
                let began = Instant::now();
                let result = executor.execute_with(&descriptor, &options);
                outcomes.push((began.elapsed(), result));
            }
            tracing::debug!(worker, queries = outcomes.len(), "Bench worker finished");
            outcomes
        }));
    }

    let mut report = BenchReport {
        latencies: Vec::with_capacity(workers * iterations),
        cancelled: 0,
        failed: 0,
        wall: Duration::ZERO,
        plans: BTreeMap::new(),
    };
    for handle in handles {
        for (elapsed, result) in handle.await? {
            match result {
                Ok(output) => {
                    report.latencies.push(elapsed);
                    *report.plans.entry(output.trace.plan_summary).or_default() += 1;
                }
                Err(e) if e.kind() == tsagg::ErrorKind::Cancelled => report.cancelled += 1,
                Err(e) => {
                    tracing::error!("Bench query failed: {}", e);
                    report.failed += 1;
                }
            }
        }
    }
    report.wall = started.elapsed();
    ctrl_c.abort();

    report.latencies.sort();
    Ok(report)
}
