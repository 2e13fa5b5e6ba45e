mod config;
mod lifecycle;
mod mqtt;
mod pipeline;
mod store;
mod subscription;
mod supervisor;
mod telemetry;
#[cfg(test)]
mod test_support;

use crate::config::Config;
use anyhow::Result;
use dotenvy::dotenv;

fn init_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,inverter_mapper=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match otlp_endpoint.map(normalize_otlp_http_endpoint) {
        Some(endpoint) if !endpoint.is_empty() => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "inverter-mapper")],
                )))
                .install_batch(Tokio)?;

            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    init_tracing(otlp_endpoint.as_deref())?;

    let result = match Config::load() {
        Ok(config) => lifecycle::run(config).await,
        Err(err) => Err(err.context("failed to load configuration")),
    };
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "inverter mapper exiting");
    }

    opentelemetry::global::shutdown_tracer_provider();
    result
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
        assert_eq!(normalize_otlp_http_endpoint("   "), "");
    }
}
