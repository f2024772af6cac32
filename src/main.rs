mod config;
mod feed;
mod kafka;
mod lifecycle;
mod pipeline;
mod postgres;
mod record;
mod retry;
mod sink;
#[cfg(test)]
mod test_support;
mod writer;

use crate::config::{Config, LogFormat};
use crate::feed::{FeedClient, FeedReader};
use crate::kafka::KafkaFeed;
use crate::lifecycle::{sink_slot, Orchestrator, TerminationSignals};
use crate::pipeline::{record_queue, RelayStats};
use crate::postgres::PgSink;
use crate::retry::{RetryPolicy, TokioDelay};
use crate::sink::SinkHandle;
use crate::writer::SinkWriter;
use anyhow::{bail, Context, Result};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kafka_pg_relay=info".into());
    let json_layer = (config.log_format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
    });
    let text_layer = (config.log_format == LogFormat::Text)
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(normalize_otlp_http_endpoint(endpoint));
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "kafka-pg-relay"),
                ])))
                .install_batch(Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    config.log_summary();

    let signals = TerminationSignals::install().context("installing signal handlers")?;
    let feed: Arc<dyn FeedClient> = Arc::new(KafkaFeed::new(&config)?);
    let sink: SinkHandle = Arc::new(PgSink::connect(&config).await.with_context(|| {
        format!(
            "connecting to PostgreSQL at {}:{}/{}",
            config.pg_host, config.pg_port, config.pg_database
        )
    })?);
    tracing::info!(endpoint = %sink.describe(), "connected to PostgreSQL");

    let stats = Arc::new(RelayStats::new());
    let (tx, rx) = record_queue(config.queue_capacity, stats.clone());
    let (publisher, slot) = sink_slot();
    let mut orchestrator =
        Orchestrator::new(feed.clone(), slot, stats.clone(), config.shutdown_grace());
    let cancel = orchestrator.cancel_token();

    let reader = FeedReader::new(
        feed.clone(),
        config.topic.clone(),
        config.poll_timeout(),
        stats.clone(),
    );
    orchestrator.spawn("feed_reader", reader.run(tx, cancel.clone()));

    let writer = SinkWriter::new(
        config.pg_table.clone(),
        RetryPolicy::new(config.backoff_base(), config.max_retries),
        Arc::new(TokioDelay),
        feed,
        stats,
    );
    orchestrator.spawn("sink_writer", writer.run(sink, rx, publisher, cancel));

    let report = orchestrator.run(signals).await;
    if config.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }
    if report.is_fatal() {
        bail!("pipeline stopped: {}", report.cause);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
    }
}
