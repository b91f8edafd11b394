#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info,huddle_server=debug";

/// Keeps the span exporter alive; flushes it on drop.
pub struct TelemetryGuard {
	provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
	fn drop(&mut self) {
		if let Some(provider) = self.provider.take()
			&& let Err(e) = provider.shutdown()
		{
			eprintln!("failed to flush spans: {e}");
		}
	}
}

fn otlp_endpoint() -> Option<String> {
	std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// Install the global subscriber: `RUST_LOG` filter + fmt output, plus OTLP
/// span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing() -> TelemetryGuard {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
	let registry = tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint() else {
		registry.init();
		return TelemetryGuard { provider: None };
	};

	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.as_str())
		.build();

	match exporter {
		Ok(exporter) => {
			let provider = SdkTracerProvider::builder().with_batch_exporter(exporter).build();
			let tracer = provider.tracer("huddle_server");
			opentelemetry::global::set_tracer_provider(provider.clone());
			registry.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(%endpoint, "exporting spans over otlp");
			TelemetryGuard {
				provider: Some(provider),
			}
		}
		Err(e) => {
			registry.init();
			warn!(error = %e, %endpoint, "otlp exporter unavailable; spans stay local");
			TelemetryGuard { provider: None }
		}
	}
}

/// Serve Prometheus metrics on `addr`.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
	metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
		.with_context(|| format!("start metrics exporter on {addr}"))?;
	info!(%addr, "metrics exporter listening");
	Ok(())
}
