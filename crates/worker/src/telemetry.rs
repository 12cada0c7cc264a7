// Logging and OpenTelemetry tracing for the worker process
//
// Console logging is always on. Spans are also exported over OTLP when
// OTEL_EXPORTER_OTLP_ENDPOINT is set.

use std::time::Duration;

use anyhow::Context;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "keelrun_worker=info,keelrun_durable=info";

/// Configuration for logging and tracing
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Deployment environment (e.g., "development", "production")
    pub environment: Option<String>,
    /// Log filter (e.g., "info", "keelrun_durable=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "keelrun-worker".to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: None,
            environment: None,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read the configuration from the environment
    ///
    /// - `OTEL_SERVICE_NAME`: service name (default: "keelrun-worker")
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `OTEL_ENVIRONMENT`: deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: log filter
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: defaults.service_version,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }
}

/// Shuts the tracer provider down when dropped, flushing pending spans
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global tracing subscriber
///
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(filter);

    let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint, resource(&config)) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(format!("{e:#}")))),
        },
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .init();

    match otel_status {
        Some(Ok(endpoint)) => {
            tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Failed to initialize OTLP tracer, continuing without tracing");
        }
        None => {
            tracing::debug!("OpenTelemetry tracing disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set");
        }
    }

    TelemetryGuard { provider }
}

fn resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        attributes.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        attributes.push(KeyValue::new("deployment.environment", env.clone()));
    }
    Resource::builder().with_attributes(attributes).build()
}

fn build_otlp_tracer(
    endpoint: &str,
    resource: Resource,
) -> anyhow::Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer)> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build OTLP span exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("keelrun");
    Ok((provider, tracer))
}
