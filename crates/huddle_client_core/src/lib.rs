#![forbid(unsafe_code)]

use std::time::Duration;

use huddle_protocol::DEFAULT_MAX_FRAME_SIZE;
use huddle_util::endpoint::WsEndpoint;

pub mod api;
pub mod connection;
pub mod event_bus;
pub mod mirror;
pub mod reconnect;
pub mod transport;

pub use api::ApiClient;
pub use connection::{ConnectionManager, ConnectionState};
pub use event_bus::{BusEvent, ClientEvent, EventBus, EventKind, RetrySchedule, SubscriptionId, events};
pub use mirror::{ChatState, ConnectionStatus, MirrorAction, StateMirror, reduce};
pub use transport::{TransportEvent, TransportSession};

/// Default server endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT: &str = "ws://127.0.0.1:3001";

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Server endpoint used by `ConnectionManager::connect`.
	pub endpoint: WsEndpoint,

	/// Interval between heartbeats while connected.
	pub heartbeat_interval: Duration,

	/// Reconnect attempts after a failure before giving up.
	pub reconnect_attempts: u32,

	/// Delay before the first reconnect attempt.
	pub reconnect_delay: Duration,

	/// Upper bound for the backoff delay.
	pub reconnect_delay_max: Duration,

	/// Timeout for connect + websocket handshake.
	pub connect_timeout: Duration,

	/// Maximum inbound/outbound text frame size.
	pub max_frame_bytes: usize,

	/// Commands buffered between the caller and the network task.
	pub command_queue_capacity: usize,
}

impl ClientConfig {
	/// Convenience: create a config from `ws://host:port`.
	pub fn from_ws_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let endpoint = WsEndpoint::parse(endpoint).map_err(ClientCoreError::Endpoint)?;
		Ok(Self {
			endpoint,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			endpoint: WsEndpoint {
				host: "127.0.0.1".to_string(),
				port: 3001,
			},
			heartbeat_interval: Duration::from_secs(30),
			reconnect_attempts: 5,
			reconnect_delay: Duration::from_secs(1),
			reconnect_delay_max: Duration::from_secs(5),
			connect_timeout: Duration::from_secs(20),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			command_queue_capacity: 256,
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Endpoint string could not be parsed.
	#[error("invalid endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// The background network task has exited.
	#[error("network task is not running")]
	NotRunning,
}
