#![forbid(unsafe_code)]

use std::sync::Arc;

use huddle_domain::{MessageId, RoomId, RoomUpdate, UserId, UserStatus};
use huddle_protocol::{
	AuthenticatePayload, ClientCommand, CreateRoomPayload, EditMessagePayload, MessageRef, RoomRef, SendMessagePayload,
	ServerEvent, UpdateRoomPayload, UpdateStatusPayload,
};
use huddle_util::endpoint::WsEndpoint;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

use crate::event_bus::{ClientEvent, EventBus, RetrySchedule};
use crate::reconnect::schedule_reconnect;
use crate::transport::{ConnectFuture, TransportEvent, TransportSession, connect_websocket};
use crate::{ClientConfig, ClientCoreError};

/// Reason reported when the user asks to disconnect.
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting { attempt: u32 },
}

#[derive(Debug)]
enum NetCommand {
	Connect { endpoint: WsEndpoint },
	Disconnect,
	Send(ClientCommand),
}

/// Handle to the background network task.
///
/// Every command is fire-and-forget: results arrive later as events on the
/// bus. Methods only fail once the network task has exited.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
	cmd_tx: mpsc::Sender<NetCommand>,
	state_rx: watch::Receiver<ConnectionState>,
	bus: Arc<EventBus>,
	endpoint: WsEndpoint,
}

impl ConnectionManager {
	/// Spawn the network task on the current tokio runtime using the
	/// websocket transport.
	pub fn spawn(cfg: ClientConfig, bus: Arc<EventBus>) -> Self {
		let transport_cfg = cfg.clone();
		Self::spawn_with_connector(cfg, bus, move |endpoint| connect_websocket(endpoint, transport_cfg.clone()))
	}

	/// Like `spawn`, with a custom transport factory.
	pub fn spawn_with_connector<F>(cfg: ClientConfig, bus: Arc<EventBus>, connector: F) -> Self
	where
		F: FnMut(WsEndpoint) -> ConnectFuture + Send + 'static,
	{
		let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_queue_capacity.max(1));
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
		let endpoint = cfg.endpoint.clone();

		let task = NetworkTask::new(cfg, bus.clone(), connector, cmd_rx, state_tx);
		tokio::spawn(task.run());

		Self {
			cmd_tx,
			state_rx,
			bus,
			endpoint,
		}
	}

	pub fn bus(&self) -> &Arc<EventBus> {
		&self.bus
	}

	pub fn state(&self) -> ConnectionState {
		*self.state_rx.borrow()
	}

	/// Receiver that observes every state transition.
	pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.state_rx.clone()
	}

	async fn send_net(&self, cmd: NetCommand) -> Result<(), ClientCoreError> {
		self.cmd_tx.send(cmd).await.map_err(|_| ClientCoreError::NotRunning)
	}

	async fn send_command(&self, cmd: ClientCommand) -> Result<(), ClientCoreError> {
		self.send_net(NetCommand::Send(cmd)).await
	}

	/// Connect to the configured endpoint.
	pub async fn connect(&self) -> Result<(), ClientCoreError> {
		self.connect_to(self.endpoint.clone()).await
	}

	pub async fn connect_to(&self, endpoint: WsEndpoint) -> Result<(), ClientCoreError> {
		self.send_net(NetCommand::Connect { endpoint }).await
	}

	/// Stop the heartbeat, drop the transport and cancel pending retries.
	/// Calling it while already disconnected does nothing.
	pub async fn disconnect(&self) -> Result<(), ClientCoreError> {
		self.send_net(NetCommand::Disconnect).await
	}

	/// Bind this connection to `user_id`. The identity is remembered and
	/// re-sent after every reconnect.
	pub async fn authenticate(&self, user_id: UserId, token: impl Into<String>) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::Authenticate(AuthenticatePayload {
			user_id,
			token: token.into(),
		}))
		.await
	}

	pub async fn join_room(&self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::JoinRoom(RoomRef { room_id })).await
	}

	pub async fn leave_room(&self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::LeaveRoom(RoomRef { room_id })).await
	}

	pub async fn send_message(&self, payload: SendMessagePayload) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::SendMessage(payload)).await
	}

	/// Plain text message with server-assigned timestamp.
	pub async fn send_text(&self, room_id: RoomId, content: impl Into<String>) -> Result<(), ClientCoreError> {
		self.send_message(SendMessagePayload {
			room_id,
			content: content.into(),
			kind: Default::default(),
			reply_to: None,
			timestamp: None,
			file: Default::default(),
		})
		.await
	}

	pub async fn edit_message(&self, message_id: MessageId, content: impl Into<String>) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::EditMessage(EditMessagePayload {
			message_id,
			content: content.into(),
		}))
		.await
	}

	pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::DeleteMessage(MessageRef { message_id })).await
	}

	pub async fn mark_as_read(&self, message_id: MessageId) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::MarkMessageAsRead(MessageRef { message_id }))
			.await
	}

	pub async fn update_status(&self, status: UserStatus) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::UpdateStatus(UpdateStatusPayload { status }))
			.await
	}

	pub async fn create_room(&self, payload: CreateRoomPayload) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::CreateRoom(payload)).await
	}

	pub async fn update_room(&self, room_id: RoomId, updates: RoomUpdate) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::UpdateRoom(UpdateRoomPayload { room_id, updates }))
			.await
	}

	pub async fn delete_room(&self, room_id: RoomId) -> Result<(), ClientCoreError> {
		self.send_command(ClientCommand::DeleteRoom(RoomRef { room_id })).await
	}
}

struct NetworkTask<F> {
	cfg: ClientConfig,
	bus: Arc<EventBus>,
	connector: F,
	cmd_rx: mpsc::Receiver<NetCommand>,
	state_tx: watch::Sender<ConnectionState>,

	session: Option<TransportSession>,
	/// In-flight handshake; dropping it abandons the attempt.
	pending_connect: Option<ConnectFuture>,
	/// Set while the user wants to be connected; cleared by `disconnect`.
	endpoint: Option<WsEndpoint>,
	reconnect_attempt: u32,
	reconnect_deadline: Option<Instant>,
	heartbeat: Interval,

	identity: Option<AuthenticatePayload>,
	joined_rooms: Vec<RoomId>,
}

impl<F> NetworkTask<F>
where
	F: FnMut(WsEndpoint) -> ConnectFuture + Send + 'static,
{
	fn new(
		cfg: ClientConfig,
		bus: Arc<EventBus>,
		connector: F,
		cmd_rx: mpsc::Receiver<NetCommand>,
		state_tx: watch::Sender<ConnectionState>,
	) -> Self {
		let period = cfg.heartbeat_interval.max(std::time::Duration::from_millis(1));
		let mut heartbeat = interval_at(Instant::now() + period, period);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

		Self {
			cfg,
			bus,
			connector,
			cmd_rx,
			state_tx,
			session: None,
			pending_connect: None,
			endpoint: None,
			reconnect_attempt: 0,
			reconnect_deadline: None,
			heartbeat,
			identity: None,
			joined_rooms: Vec::new(),
		}
	}

	async fn run(mut self) {
		loop {
			tokio::select! {
				maybe_cmd = self.cmd_rx.recv() => {
					let Some(cmd) = maybe_cmd else {
						debug!("all connection handles dropped; stopping network task");
						break;
					};
					match cmd {
						NetCommand::Connect { endpoint } => self.connect(endpoint),
						NetCommand::Disconnect => self.disconnect(),
						NetCommand::Send(cmd) => self.send(cmd),
					}
				}

				inbound = next_inbound(&mut self.session), if self.session.is_some() => {
					match inbound {
						Some(TransportEvent::Event(event)) => self.on_server_event(event),
						Some(TransportEvent::Closed { reason }) => self.on_transport_closed(reason),
						None => self.on_transport_closed("transport close".to_string()),
					}
				}

				opened = poll_connect(&mut self.pending_connect), if self.pending_connect.is_some() => {
					self.pending_connect = None;
					self.on_connect_result(opened);
				}

				_ = self.heartbeat.tick(), if self.session.is_some() => {
					self.push(ClientCommand::Heartbeat {});
				}

				_ = wait_deadline(self.reconnect_deadline), if self.reconnect_deadline.is_some() => {
					self.reconnect_deadline = None;
					self.retry();
				}
			}
		}

		self.pending_connect = None;
		self.session = None;
		self.state_tx.send_replace(ConnectionState::Disconnected);
	}

	fn set_state(&self, state: ConnectionState) {
		let prev = self.state_tx.send_replace(state);
		if prev != state {
			debug!(from = ?prev, to = ?state, "connection state changed");
		}
	}

	fn emit(&self, event: ClientEvent) {
		self.bus.emit(&event);
	}

	fn open(&mut self, endpoint: WsEndpoint) {
		self.pending_connect = Some((self.connector)(endpoint));
	}

	fn on_connect_result(&mut self, opened: Result<TransportSession, ClientCoreError>) {
		match opened {
			Ok(session) => {
				self.session = Some(session);
				self.on_connected();
			}
			Err(e) => {
				warn!(attempt = self.reconnect_attempt, error = %e, "connect attempt failed");
				self.schedule_retry();
			}
		}
	}

	fn connect(&mut self, endpoint: WsEndpoint) {
		let busy = self.session.is_some() || self.pending_connect.is_some();
		if busy && self.endpoint.as_ref() == Some(&endpoint) {
			debug!(endpoint = %endpoint.ws_url(), "already connected or connecting");
			return;
		}
		self.pending_connect = None;
		if self.session.take().is_some() {
			self.emit(ClientEvent::Disconnect {
				reason: CLIENT_DISCONNECT_REASON.to_string(),
			});
		}

		self.endpoint = Some(endpoint.clone());
		self.reconnect_attempt = 0;
		self.reconnect_deadline = None;
		self.set_state(ConnectionState::Connecting);
		self.open(endpoint);
	}

	fn retry(&mut self) {
		let Some(endpoint) = self.endpoint.clone() else {
			return;
		};
		info!(attempt = self.reconnect_attempt, endpoint = %endpoint.ws_url(), "reconnecting");
		self.open(endpoint);
	}

	fn on_connected(&mut self) {
		let recovered_after = std::mem::take(&mut self.reconnect_attempt);
		self.reconnect_deadline = None;
		self.heartbeat.reset();
		self.set_state(ConnectionState::Connected);

		// Restore the server-side binding before anyone reacts to `connect`.
		if let Some(identity) = self.identity.clone() {
			self.push(ClientCommand::Authenticate(identity));
			for room_id in self.joined_rooms.clone() {
				self.push(ClientCommand::JoinRoom(RoomRef { room_id }));
			}
		}

		self.emit(ClientEvent::Connect);
		if recovered_after > 0 {
			info!(attempt = recovered_after, "reconnected");
			self.emit(ClientEvent::Reconnect {
				attempt: recovered_after,
			});
		}
	}

	fn schedule_retry(&mut self) {
		self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
		if self.reconnect_attempt > self.cfg.reconnect_attempts {
			self.give_up();
			return;
		}

		let attempt = self.reconnect_attempt;
		let (deadline, ms) = schedule_reconnect(attempt, self.cfg.reconnect_delay, self.cfg.reconnect_delay_max);
		self.reconnect_deadline = Some(deadline);
		self.set_state(ConnectionState::Reconnecting { attempt });
		self.emit(ClientEvent::Reconnecting(RetrySchedule {
			attempt,
			next_retry_in_ms: ms,
		}));
	}

	fn give_up(&mut self) {
		let attempts = self.cfg.reconnect_attempts;
		warn!(attempts, "giving up on reconnecting");
		self.endpoint = None;
		self.reconnect_attempt = 0;
		self.reconnect_deadline = None;
		self.set_state(ConnectionState::Disconnected);
		self.emit(ClientEvent::ReconnectError { attempts });
	}

	fn disconnect(&mut self) {
		let had_session = self.session.take().is_some();
		let had_handshake = self.pending_connect.take().is_some();
		let was_active = had_session || had_handshake || self.endpoint.is_some() || self.reconnect_deadline.is_some();
		self.endpoint = None;
		self.reconnect_attempt = 0;
		self.reconnect_deadline = None;
		if !was_active {
			return;
		}

		info!("disconnect requested");
		self.set_state(ConnectionState::Disconnected);
		if had_session {
			self.emit(ClientEvent::Disconnect {
				reason: CLIENT_DISCONNECT_REASON.to_string(),
			});
		}
	}

	fn on_server_event(&mut self, event: ServerEvent) {
		if let ServerEvent::RoomDeleted(room_id) = &event {
			self.joined_rooms.retain(|r| r != room_id);
		}
		self.emit(ClientEvent::Server(event));
	}

	fn on_transport_closed(&mut self, reason: String) {
		self.session = None;
		info!(%reason, "transport closed");
		self.emit(ClientEvent::Disconnect { reason });

		if self.endpoint.is_some() {
			self.schedule_retry();
		} else {
			self.set_state(ConnectionState::Disconnected);
		}
	}

	/// Record what must be replayed after a reconnect, then forward.
	fn send(&mut self, cmd: ClientCommand) {
		match &cmd {
			ClientCommand::Authenticate(payload) => self.identity = Some(payload.clone()),
			ClientCommand::JoinRoom(r) => {
				if !self.joined_rooms.contains(&r.room_id) {
					self.joined_rooms.push(r.room_id.clone());
				}
			}
			ClientCommand::LeaveRoom(r) => self.joined_rooms.retain(|id| id != &r.room_id),
			_ => {}
		}
		self.push(cmd);
	}

	fn push(&self, cmd: ClientCommand) {
		let Some(session) = self.session.as_ref() else {
			debug!(command = cmd.name(), "not connected; command dropped");
			return;
		};
		match session.outbound.try_send(cmd) {
			Ok(()) => {}
			Err(TrySendError::Full(cmd)) => warn!(command = cmd.name(), "transport queue full; command dropped"),
			Err(TrySendError::Closed(cmd)) => debug!(command = cmd.name(), "transport closed; command dropped"),
		}
	}
}

async fn next_inbound(session: &mut Option<TransportSession>) -> Option<TransportEvent> {
	match session.as_mut() {
		Some(s) => s.inbound.recv().await,
		None => std::future::pending().await,
	}
}

async fn poll_connect(pending: &mut Option<ConnectFuture>) -> Result<TransportSession, ClientCoreError> {
	match pending.as_mut() {
		Some(fut) => fut.await,
		None => std::future::pending().await,
	}
}

async fn wait_deadline(deadline: Option<Instant>) {
	match deadline {
		Some(d) => sleep_until(d).await,
		None => std::future::pending().await,
	}
}
