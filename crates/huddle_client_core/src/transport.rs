#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientCommand, ServerEvent, decode_event, encode};
use huddle_util::endpoint::WsEndpoint;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::{ClientConfig, ClientCoreError};

const SESSION_CHANNEL_CAPACITY: usize = 256;

/// What the transport reports back to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
	Event(ServerEvent),
	Closed { reason: String },
}

/// One established transport connection.
///
/// Dropping `outbound` asks the transport to close. `inbound` yields server
/// events followed by a single `Closed` once the link is gone.
#[derive(Debug)]
pub struct TransportSession {
	pub outbound: mpsc::Sender<ClientCommand>,
	pub inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportSession {
	/// Channel pair for a transport implementation: the session handed to
	/// the manager plus the peer ends the transport drives.
	pub fn channel() -> (Self, mpsc::Receiver<ClientCommand>, mpsc::Sender<TransportEvent>) {
		let (outbound, commands) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
		let (events, inbound) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
		(Self { outbound, inbound }, commands, events)
	}
}

/// Websocket limits for a client using `max_frame_bytes`.
pub fn websocket_config(max_frame_bytes: usize) -> WebSocketConfig {
	WebSocketConfig::default()
		.max_message_size(Some(max_frame_bytes))
		.max_frame_size(Some(max_frame_bytes))
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<TransportSession, ClientCoreError>> + Send + 'static>>;

/// Open a websocket to `endpoint` and pump frames between it and a
/// `TransportSession`.
pub fn connect_websocket(endpoint: WsEndpoint, cfg: ClientConfig) -> ConnectFuture {
	Box::pin(async move {
		let url = endpoint.ws_url();
		let handshake =
			tokio_tungstenite::connect_async_with_config(url.as_str(), Some(websocket_config(cfg.max_frame_bytes)), false);
		let (ws, _resp) = tokio::time::timeout(cfg.connect_timeout, handshake)
			.await
			.map_err(|_| ClientCoreError::Connect(format!("timed out connecting to {url}")))?
			.map_err(|e| ClientCoreError::Connect(format!("{url}: {e}")))?;
		info!(%url, "websocket connected");

		let (session, mut commands, events) = TransportSession::channel();
		let (mut sink, mut stream) = ws.split();
		let max_frame_bytes = cfg.max_frame_bytes;

		tokio::spawn(async move {
			while let Some(cmd) = commands.recv().await {
				let text = match encode(&cmd, max_frame_bytes) {
					Ok(text) => text,
					Err(e) => {
						warn!(command = cmd.name(), error = %e, "failed to encode command");
						continue;
					}
				};
				if let Err(e) = sink.send(Message::text(text)).await {
					debug!(error = %e, "websocket write failed");
					break;
				}
			}
			let _ = sink.close().await;
		});

		tokio::spawn(async move {
			let reason = loop {
				match stream.next().await {
					Some(Ok(Message::Text(text))) => match decode_event(&text, max_frame_bytes) {
						Ok(event) => {
							if events.send(TransportEvent::Event(event)).await.is_err() {
								// Manager dropped the session.
								return;
							}
						}
						Err(e) => warn!(error = %e, "dropping undecodable server frame"),
					},
					Some(Ok(Message::Close(frame))) => {
						break frame
							.map(|f| f.reason.as_str().to_string())
							.filter(|r| !r.is_empty())
							.unwrap_or_else(|| "io server disconnect".to_string());
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => break format!("transport error: {e}"),
					None => break "transport close".to_string(),
				}
			};
			let _ = events.send(TransportEvent::Closed { reason }).await;
		});

		Ok::<_, ClientCoreError>(session)
	})
}
