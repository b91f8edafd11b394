#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use huddle_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;
use crate::server::hub::HubSettings;

pub const DEFAULT_BIND: &str = "127.0.0.1:3001";

/// Default config path: `~/.huddle/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".huddle").join("server.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listener for websocket + HTTP.
	pub bind: SocketAddr,
	/// Prometheus exporter listener; disabled when unset.
	pub metrics_bind: Option<SocketAddr>,
	/// Maximum encoded size of one websocket text frame.
	pub max_frame_bytes: usize,
	/// Maximum number of queued outbound events per connection.
	pub outbound_queue_capacity: usize,
	/// Send `commandRejected` to the issuing connection instead of dropping silently.
	pub emit_command_rejections: bool,
	/// Create the `general` and `random` rooms at startup.
	pub seed_default_rooms: bool,
}

impl Default for ServerConfig {
	fn default() -> Self {
		let hub = HubSettings::default();
		Self {
			server: ServerSettings {
				bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
				metrics_bind: None,
				max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
				outbound_queue_capacity: hub.outbound_queue_capacity,
				emit_command_rejections: hub.emit_command_rejections,
				seed_default_rooms: hub.seed_default_rooms,
			},
		}
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = Self::default().server;
		let s = file.server;

		let bind = parse_addr("server.bind", s.bind)?.unwrap_or(defaults.bind);
		let metrics_bind = parse_addr("server.metrics_bind", s.metrics_bind)?;

		Ok(Self {
			server: ServerSettings {
				bind,
				metrics_bind,
				max_frame_bytes: s
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: s
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				emit_command_rejections: s.emit_command_rejections.unwrap_or(defaults.emit_command_rejections),
				seed_default_rooms: s.seed_default_rooms.unwrap_or(defaults.seed_default_rooms),
			},
		})
	}

	pub fn hub_settings(&self) -> HubSettings {
		HubSettings {
			outbound_queue_capacity: self.server.outbound_queue_capacity,
			emit_command_rejections: self.server.emit_command_rejections,
			seed_default_rooms: self.server.seed_default_rooms,
		}
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.server.max_frame_bytes,
			..ConnectionSettings::default()
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	emit_command_rejections: Option<bool>,
	seed_default_rooms: Option<bool>,
}

fn parse_addr(key: &str, value: Option<String>) -> anyhow::Result<Option<SocketAddr>> {
	match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
		Some(v) => v
			.parse::<SocketAddr>()
			.map(Some)
			.with_context(|| format!("invalid {key} (expected host:port): {v}")),
		None => Ok(None),
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env("HUDDLE_SERVER_BIND") {
		match v.trim().parse::<SocketAddr>() {
			Ok(addr) => {
				cfg.server.bind = addr;
				info!(%addr, "server config: bind overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "server config: ignoring invalid HUDDLE_SERVER_BIND"),
		}
	}

	if let Some(v) = env("HUDDLE_METRICS_BIND") {
		match parse_addr("HUDDLE_METRICS_BIND", Some(v)) {
			Ok(Some(addr)) => {
				cfg.server.metrics_bind = Some(addr);
				info!(%addr, "server config: metrics_bind overridden by env");
			}
			Ok(None) => {}
			Err(e) => warn!(error = %e, "server config: ignoring invalid HUDDLE_METRICS_BIND"),
		}
	}

	if let Some(v) = env("HUDDLE_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = env("HUDDLE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = env("HUDDLE_EMIT_COMMAND_REJECTIONS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.emit_command_rejections = enabled;
		info!(enabled, "server config: emit_command_rejections overridden by env");
	}

	if let Some(v) = env("HUDDLE_SEED_DEFAULT_ROOMS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.seed_default_rooms = enabled;
		info!(enabled, "server config: seed_default_rooms overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn from_toml(s: &str) -> anyhow::Result<ServerConfig> {
		ServerConfig::from_file(toml::from_str(s)?)
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = from_toml("").unwrap();
		assert_eq!(cfg.server.bind.to_string(), DEFAULT_BIND);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.outbound_queue_capacity, 256);
		assert!(!cfg.server.emit_command_rejections);
		assert!(cfg.server.seed_default_rooms);
		assert!(cfg.server.metrics_bind.is_none());
	}

	#[test]
	fn file_values_are_applied() {
		let cfg = from_toml(
			r#"
			[server]
			bind = "0.0.0.0:4000"
			metrics_bind = "127.0.0.1:9100"
			max_frame_bytes = 4096
			outbound_queue_capacity = 0
			emit_command_rejections = true
			seed_default_rooms = false
			"#,
		)
		.unwrap();

		assert_eq!(cfg.server.bind.port(), 4000);
		assert_eq!(cfg.server.metrics_bind, Some(SocketAddr::from(([127, 0, 0, 1], 9100))));
		assert_eq!(cfg.connection_settings().max_frame_bytes, 4096);
		// Zero capacity falls back to the default.
		assert_eq!(cfg.hub_settings().outbound_queue_capacity, 256);
		assert!(cfg.hub_settings().emit_command_rejections);
		assert!(!cfg.hub_settings().seed_default_rooms);
	}

	#[test]
	fn invalid_bind_is_an_error() {
		assert!(from_toml("[server]\nbind = \"localhost\"").is_err());
		assert!(from_toml("[server]\nmetrics_bind = \"9100\"").is_err());
	}

	#[test]
	fn env_overrides_win_and_bad_values_are_ignored() {
		let env: HashMap<&str, &str> = HashMap::from([
			("HUDDLE_SERVER_BIND", "not-an-addr"),
			("HUDDLE_MAX_FRAME_BYTES", "2048"),
			("HUDDLE_OUTBOUND_QUEUE_CAPACITY", "nope"),
			("HUDDLE_EMIT_COMMAND_REJECTIONS", "yes"),
			("HUDDLE_SEED_DEFAULT_ROOMS", "off"),
			("HUDDLE_METRICS_BIND", "  "),
		]);

		let mut cfg = ServerConfig::default();
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.bind.to_string(), DEFAULT_BIND);
		assert_eq!(cfg.server.max_frame_bytes, 2048);
		assert_eq!(cfg.server.outbound_queue_capacity, 256);
		assert!(cfg.server.emit_command_rejections);
		assert!(!cfg.server.seed_default_rooms);
		assert!(cfg.server.metrics_bind.is_none());
	}
}
