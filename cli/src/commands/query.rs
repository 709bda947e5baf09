//! Query command implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tally_aggregator::{
    metrics, Bucket, BucketConfig, InMemoryRepository, Query, Repository, Settings, SortBy,
};
use tally_shared::utils::time::parse_timestamp;
use tally_shared::{Period, Record, Value};
use tracing::debug;

use crate::output;

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Bucket configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TALLY_CONFIG")]
    pub config: PathBuf,

    /// Bucket to query
    #[arg(short, long)]
    pub bucket: String,

    /// JSON file with the records to load (an array or a single object)
    #[arg(short, long)]
    pub records: PathBuf,

    /// Equality filter; the value is read as JSON, falling back to a string
    #[arg(long = "filter-by", value_name = "KEY:VALUE")]
    pub filter_by: Vec<String>,

    /// Count records per distinct value of this field
    #[arg(long)]
    pub group_by: Option<String>,

    /// Sort order, e.g. `_count:descending`
    #[arg(long, value_name = "FIELD:DIRECTION")]
    pub sort_by: Option<SortBy>,

    /// Maximum number of rows
    #[arg(short, long)]
    pub limit: Option<i64>,

    /// Collect the values of this field per group
    #[arg(long)]
    pub collect: Vec<String>,

    /// Inclusive range start (RFC 3339)
    #[arg(long)]
    pub start_at: Option<String>,

    /// Exclusive range end (RFC 3339)
    #[arg(long)]
    pub end_at: Option<String>,

    /// Count per week or month
    #[arg(long, value_name = "week|month")]
    pub period: Option<Period>,

    /// Print Prometheus metrics to stderr afterwards
    #[arg(long)]
    pub metrics: bool,
}

pub fn run(args: QueryArgs) -> Result<()> {
    let settings = Settings::load(&args.config)?;
    let config = settings
        .bucket_configs()
        .context("Invalid bucket configuration")?
        .into_iter()
        .find(|config| config.name() == args.bucket)
        .with_context(|| {
            format!("No bucket named '{}' in {}", args.bucket, args.config.display())
        })?;

    let query = build_query(&args)?;
    if !config.queryable() {
        bail!("Bucket '{}' is not queryable", config.name());
    }
    if query.is_raw() && !config.raw_queries_allowed() {
        bail!(
            "Bucket '{}' does not allow raw queries; add --group-by or --period",
            config.name()
        );
    }

    let records = load_records(&args.records, &config)?;
    let repository: Arc<dyn Repository> = if config.realtime() {
        let capacity = usize::try_from(config.capped_size()).unwrap_or(usize::MAX);
        Arc::new(InMemoryRepository::capped(capacity))
    } else {
        Arc::new(InMemoryRepository::new())
    };
    let bucket = Bucket::new(config, repository);
    bucket.store_all(&records).context("Failed to store records")?;
    output::info(&format!("Loaded {} record(s) into '{}'", records.len(), bucket.name()));

    let data = bucket.query(&query).context("Query failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&data).context("Failed to serialize result")?
    );

    if args.metrics {
        eprint!("{}", metrics::encode_metrics()?);
    }
    Ok(())
}

fn build_query(args: &QueryArgs) -> Result<Query> {
    let mut builder = Query::builder();
    for filter in &args.filter_by {
        let (key, value) = parse_filter(filter)?;
        builder = builder.filter_by(key, value);
    }
    if let Some(field) = &args.group_by {
        builder = builder.group_by(field);
    }
    if let Some(sort) = &args.sort_by {
        builder = builder.sort_by(sort.clone());
    }
    if let Some(limit) = args.limit {
        builder = builder.limit(limit);
    }
    for field in &args.collect {
        builder = builder.collect(field);
    }
    if let Some(raw) = &args.start_at {
        builder = builder.start_at(parse_timestamp("start_at", raw)?);
    }
    if let Some(raw) = &args.end_at {
        builder = builder.end_at(parse_timestamp("end_at", raw)?);
    }
    if let Some(period) = args.period {
        builder = builder.period(period);
    }
    let query = builder.build()?;
    debug!(?query, "built query");
    Ok(query)
}

fn parse_filter(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once(':') else {
        bail!("Invalid filter '{}': expected KEY:VALUE", raw);
    };
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn load_records(path: &Path, config: &BucketConfig) -> Result<Vec<Record>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records from {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    let items = match json {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            prepare_record(item, config).with_context(|| format!("Record {} is invalid", index))
        })
        .collect()
}

/// Validate an incoming record and add derived fields.
fn prepare_record(json: serde_json::Value, config: &BucketConfig) -> Result<Record> {
    let record = Record::from_json(json)?;
    record.validate()?;
    let record = record.with_period_fields();
    match config.auto_ids() {
        Some(keys) => Ok(record.with_auto_id(keys)?),
        None => Ok(record),
    }
}
