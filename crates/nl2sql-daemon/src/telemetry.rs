use std::env;

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const SAMPLING_RATE_ENV: &str = "NL2SQL_OTEL_SAMPLING_RATE";

/// Flushes the OTLP exporter when dropped, if one was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the global subscriber: env filter (default `info`), console
/// output, and an OTLP span exporter unless sampling is disabled. Exporter
/// failures degrade to console-only logging.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_RATE_ENV).ok().as_deref());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let tracer_installed = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }
    info!(sampling_rate, "telemetry sampling configured");

    Ok(TelemetryGuard { tracer_installed })
}

fn build_otel_layer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Reads the trace sampling ratio. Returns the effective rate plus a warning
/// to log once the subscriber is up.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (1.0, Some(format!("{SAMPLING_RATE_ENV} is empty; defaulting to 1.0")));
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_RATE_ENV}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "{SAMPLING_RATE_ENV}='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}
