//! Tally rating engine
//!
//! Loads tariffs, destinations and accounts from a JSON fixture, then reads
//! one usage request per stdin line and prints one JSON result per line.
//!
//! ```text
//! {"op": "rate", "descriptor": {...}}
//! {"op": "debit", "descriptor": {...}}
//! {"op": "max_debit", "descriptor": {...}}
//! {"op": "max_usage", "descriptor": {...}}
//! {"op": "refund", "increments": [...]}
//! ```

use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tally_core::models::{Increment, UsageDescriptor};
use tally_core::{AppConfig, AppError};
use tally_guardian::Guardian;
use tally_services::RatingEngine;
use tally_store::{Fixtures, MemoryStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Engine = RatingEngine<MemoryStore, MemoryStore>;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Rate { descriptor: UsageDescriptor },
    Debit { descriptor: UsageDescriptor },
    MaxDebit { descriptor: UsageDescriptor },
    MaxUsage { descriptor: UsageDescriptor },
    Refund { increments: Vec<Increment> },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Response {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl Response {
    fn ok(line: usize, result: Value) -> Self {
        Self {
            line,
            result: Some(result),
            error: None,
        }
    }

    fn failed(line: usize, err: &AppError) -> Self {
        Self {
            line,
            result: None,
            error: Some(err.into()),
        }
    }
}

/// Initialize tracing/logging; logs go to stderr, results to stdout
fn init_tracing(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tally={0},tally_services={0},tally_store={0}", config.log.level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Parse one request line, filling in the configured default tariff type
fn parse_request(raw: &str, config: &AppConfig) -> Result<Request, AppError> {
    let mut value: Value = serde_json::from_str(raw)?;
    if let Some(descriptor) = value.get_mut("descriptor").and_then(Value::as_object_mut) {
        descriptor
            .entry("tariff_type")
            .or_insert_with(|| Value::String(config.rating.default_tariff_type.clone()));
    }
    Ok(serde_json::from_value(value)?)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, AppError> {
    Ok(serde_json::to_value(value)?)
}

async fn handle(engine: &Engine, config: &AppConfig, line: usize, raw: String) -> Response {
    let request = match parse_request(&raw, config) {
        Ok(request) => request,
        Err(e) => {
            warn!(line, "Malformed request: {}", e);
            return Response::failed(line, &e);
        }
    };

    let result = match request {
        Request::Rate { descriptor } => match engine.rate(descriptor).await {
            Ok(cc) => to_value(&cc),
            Err(unrated) => {
                // the -1 call cost travels with the error
                let mut response = Response::failed(line, &unrated.error);
                response.result = to_value(&unrated.call_cost).ok();
                return response;
            }
        },
        Request::Debit { descriptor } => engine.debit(descriptor).await.and_then(|cc| to_value(&cc)),
        Request::MaxDebit { descriptor } => engine.max_debit(descriptor).await.and_then(|cc| to_value(&cc)),
        Request::MaxUsage { descriptor } => engine
            .estimate_max_duration(descriptor)
            .await
            .and_then(|usage| to_value(&usage)),
        Request::Refund { increments } => engine
            .refund(&increments)
            .await
            .map(|_| serde_json::json!({ "refunded": increments.len() })),
    };

    match result {
        Ok(value) => Response::ok(line, value),
        Err(e) => Response::failed(line, &e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("loading configuration")?;
    init_tracing(&config);

    info!("Starting Tally rating engine v{}", env!("CARGO_PKG_VERSION"));

    let fixtures = Fixtures::from_path(&config.runtime.fixtures_path)
        .await
        .with_context(|| format!("loading fixtures from {}", config.runtime.fixtures_path))?;
    let store = fixtures.into_store();
    let engine: Engine = RatingEngine::new(
        Arc::new(store.clone()),
        Arc::new(store),
        Guardian::new(),
        &config,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut requests = Vec::new();
    while let Some(raw) = lines.next_line().await? {
        if !raw.trim().is_empty() {
            requests.push((requests.len() + 1, raw));
        }
    }
    info!(
        requests = requests.len(),
        workers = config.runtime.workers,
        "Processing requests"
    );

    let workers = config.runtime.workers.max(1);
    let mut responses = stream::iter(requests)
        .map(|(line, raw)| {
            let engine = engine.clone();
            let config = config.clone();
            async move { handle(&engine, &config, line, raw).await }
        })
        .buffered(workers);

    let mut stdout = tokio::io::stdout();
    while let Some(response) = responses.next().await {
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
    }
    stdout.flush().await?;

    info!("Done");
    Ok(())
}
