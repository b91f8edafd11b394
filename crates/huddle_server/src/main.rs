#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context as _;
use huddle_server::config::{default_config_path, load_server_config_from_path};
use huddle_server::telemetry::{init_tracing, install_metrics_exporter};
use huddle_server::{AppState, ChatHub, HealthState, serve};
use huddle_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Listen address (alias: --listen)\n\
\t          Default: server.bind from ~/.huddle/server.toml, else ws://127.0.0.1:3001\n\
\t          Websocket on /ws, bootstrap API on /api, health on /healthz and /readyz\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

/// Returns the `--bind` override, if any.
fn parse_args() -> Option<SocketAddr> {
	let mut bind = None;

	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let raw = args.next().unwrap_or_else(|| usage_and_exit());
				let addr = WsEndpoint::parse(&raw)
					.and_then(|e| e.socket_addr())
					.unwrap_or_else(|e| {
						eprintln!("invalid --bind {raw:?}: {e}");
						usage_and_exit()
					});
				bind = Some(addr);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let bind_override = parse_args();
	let _telemetry = init_tracing();

	let config_path = default_config_path()?;
	let cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "server config loaded");

	if let Some(addr) = cfg.server.metrics_bind
		&& let Err(e) = install_metrics_exporter(addr)
	{
		warn!(error = %e, "metrics disabled");
	}

	let bind = bind_override.unwrap_or(cfg.server.bind);
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind {bind}"))?;

	let health = HealthState::new();
	let state = AppState {
		hub: ChatHub::new(cfg.hub_settings()),
		health: health.clone(),
		connection: cfg.connection_settings(),
	};
	health.mark_ready();
	info!(%bind, "huddle_server listening");

	tokio::select! {
		res = serve(listener, state) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
			Ok(())
		}
	}
}
