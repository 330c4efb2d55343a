//! Logging and OpenTelemetry setup for the operator process
//!
//! Logs go to stdout, JSON by default (`CRO_LOG_FORMAT=text` for humans).
//! Traces and metrics are pushed over OTLP/gRPC only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Keep the returned [`TelemetryGuard`]
//! alive for the life of the process and shut it down on exit so batched
//! spans are flushed.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset; AWS and HTTP internals stay quiet
pub const DEFAULT_LOG_FILTER: &str =
    "info,cro_operator=debug,cro_provider=debug,kube=info,aws_config=warn,aws_smithy_runtime=warn,hyper=warn";

/// Errors raised while installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// How log lines are rendered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line with the current span attached
    #[default]
    Json,
    /// Human-readable single-line output
    Text,
}

impl LogFormat {
    /// Parse `CRO_LOG_FORMAT`; unknown values fall back to JSON
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("text") | Some("pretty") => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Process-level telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` reported on spans and metrics
    pub service_name: String,
    /// OTLP gRPC endpoint, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,
    /// Log line rendering
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cloud-resource-operator".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            log_format: LogFormat::from_env_value(std::env::var("CRO_LOG_FORMAT").ok().as_deref()),
        }
    }
}

/// Owns the OTLP providers installed by [`init_telemetry`]
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process
    pub fn exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush traces: {e}");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber, propagator and (optionally) OTLP exporters.
///
/// Call once, from inside the tokio runtime when an endpoint is configured.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = process_resource(&config.service_name);

            let meters = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meters.clone());
            guard.meter_provider = Some(meters);

            let tracers = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracers.clone());
            let tracer = tracers.tracer(config.service_name.clone());
            guard.tracer_provider = Some(tracers);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(guard)
}

/// Service identity plus pod placement from the downward API
fn process_resource(service_name: &str) -> Resource {
    let downward = [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ];

    let attributes = [
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ]
    .into_iter()
    .chain(
        downward
            .into_iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| KeyValue::new(key, v))),
    )
    .collect::<Vec<_>>();

    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
