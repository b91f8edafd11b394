#![forbid(unsafe_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{DEFAULT_MAX_FRAME_SIZE, decode_command, encode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::server::hub::ChatHub;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Maximum encoded size of one text frame, both directions.
	pub max_frame_bytes: usize,

	/// How long to let the writer flush queued events after the reader ends.
	pub writer_drain_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			writer_drain_timeout: Duration::from_secs(1),
		}
	}
}

impl ConnectionSettings {
	/// Websocket limits matching `max_frame_bytes`, so oversized frames are
	/// refused while reading instead of after buffering.
	pub fn websocket_config(&self) -> WebSocketConfig {
		WebSocketConfig::default()
			.max_message_size(Some(self.max_frame_bytes))
			.max_frame_size(Some(self.max_frame_bytes))
	}
}

struct ActiveConnectionGuard;

impl ActiveConnectionGuard {
	fn new() -> Self {
		metrics::gauge!("huddle_server_active_connections").increment(1.0);
		Self
	}
}

impl Drop for ActiveConnectionGuard {
	fn drop(&mut self) {
		metrics::gauge!("huddle_server_active_connections").decrement(1.0);
	}
}

/// Drive one websocket until the peer goes away.
///
/// Inbound text frames are decoded into commands and applied through the hub.
/// Outbound events come from the hub's per-connection queue and are written
/// by a separate task so a slow peer never holds the hub lock.
pub async fn handle_connection<S>(hub: ChatHub, ws: WebSocketStream<S>, settings: ConnectionSettings) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let _active = ActiveConnectionGuard::new();
	let (conn_id, mut events_rx) = hub.open_connection().await;
	info!(conn_id, "websocket connection opened");

	let (mut sink, mut stream) = ws.split();
	let max_frame_bytes = settings.max_frame_bytes;

	let writer = tokio::spawn(async move {
		while let Some(event) = events_rx.recv().await {
			let text = match encode(&event, max_frame_bytes) {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id, event = event.name(), error = %e, "failed to encode outbound event");
					continue;
				}
			};

			if let Err(e) = sink.send(Message::text(text)).await {
				debug!(conn_id, error = %e, "websocket write failed");
				break;
			}
		}
		let _ = sink.close().await;
	});

	let mut result = Ok(());
	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Text(text)) => match decode_command(&text, max_frame_bytes) {
				Ok(cmd) => {
					// Rejections are already logged and counted by the hub.
					let _ = hub.handle_command(conn_id, cmd).await;
				}
				Err(e) => hub.reject_frame(conn_id, e.to_string()).await,
			},
			Ok(Message::Binary(_)) => {
				hub.reject_frame(conn_id, "binary frames are not supported".to_string()).await;
			}
			Ok(Message::Close(frame)) => {
				debug!(conn_id, ?frame, "websocket close received");
				break;
			}
			Ok(_) => {}
			Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
			Err(tungstenite::Error::Capacity(e)) => {
				debug!(conn_id, error = %e, "inbound frame over size limit");
				break;
			}
			Err(tungstenite::Error::Protocol(e)) => {
				debug!(conn_id, error = %e, "websocket protocol error");
				break;
			}
			Err(e) => {
				result = Err(anyhow::Error::new(e).context("websocket read"));
				break;
			}
		}
	}

	// Unbinding drops the registry's sender, which ends the writer.
	hub.close_connection(conn_id).await;
	if tokio::time::timeout(settings.writer_drain_timeout, writer).await.is_err() {
		debug!(conn_id, "websocket writer did not drain in time");
	}

	info!(conn_id, "websocket connection closed");
	result
}
