#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use huddle_domain::{User, UserId, UserStatus};
use huddle_protocol::{ClientCommand, CommandRejected, ServerEvent};
use huddle_util::time::unix_ms_now;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::server::handler::{self, Rejection};
use crate::server::registry::{ConnId, ConnectionRegistry};
use crate::server::router::{BroadcastRouter, Outbound};
use crate::server::store::StateStore;

/// Settings for `ChatHub`.
#[derive(Debug, Clone)]
pub struct HubSettings {
	/// Maximum number of queued outbound events per connection.
	pub outbound_queue_capacity: usize,

	/// Send `commandRejected` back to the issuing connection.
	pub emit_command_rejections: bool,

	pub seed_default_rooms: bool,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			emit_command_rejections: false,
			seed_default_rooms: true,
		}
	}
}

#[derive(Debug)]
struct HubInner {
	store: StateStore,
	registry: ConnectionRegistry,
}

/// Shared server state: the store and the connection registry behind one lock.
///
/// Every command runs under the write lock and its events are queued before
/// the lock is released, so per-room event order matches mutation order.
#[derive(Debug, Clone)]
pub struct ChatHub {
	inner: Arc<RwLock<HubInner>>,
	settings: HubSettings,
	next_conn_id: Arc<AtomicU64>,
}

impl ChatHub {
	pub fn new(settings: HubSettings) -> Self {
		let store = if settings.seed_default_rooms {
			StateStore::with_default_rooms(unix_ms_now())
		} else {
			StateStore::new()
		};

		Self {
			inner: Arc::new(RwLock::new(HubInner {
				store,
				registry: ConnectionRegistry::new(),
			})),
			settings,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn settings(&self) -> &HubSettings {
		&self.settings
	}

	/// Register a new connection and return its id and outbound event stream.
	pub async fn open_connection(&self) -> (ConnId, mpsc::Receiver<ServerEvent>) {
		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(self.settings.outbound_queue_capacity.max(1));

		let mut inner = self.inner.write().await;
		inner.registry.register(conn_id, tx);
		debug!(conn_id, conns = inner.registry.len(), "connection registered");

		(conn_id, rx)
	}

	/// Apply one command from `conn_id` and fan out what it produced.
	pub async fn handle_command(&self, conn_id: ConnId, cmd: ClientCommand) -> Result<(), Rejection> {
		let name = cmd.name();
		metrics::counter!("huddle_server_commands_total", "command" => name).increment(1);

		let mut guard = self.inner.write().await;
		let HubInner { store, registry } = &mut *guard;

		match handler::handle(store, registry, conn_id, cmd, unix_ms_now()) {
			Ok(outbound) => {
				let router = BroadcastRouter::new(registry);
				for out in outbound {
					router.deliver(out);
				}
				Ok(())
			}
			Err(rejection) => {
				metrics::counter!("huddle_server_commands_rejected_total", "kind" => rejection.kind()).increment(1);
				debug!(conn_id, command = name, reason = %rejection, "command rejected");

				if self.settings.emit_command_rejections {
					BroadcastRouter::new(registry).to_connection(
						conn_id,
						ServerEvent::CommandRejected(CommandRejected {
							command: name.to_string(),
							reason: rejection.to_string(),
						}),
					);
				}
				Err(rejection)
			}
		}
	}

	/// Report an inbound frame that could not be decoded into a command.
	pub async fn reject_frame(&self, conn_id: ConnId, reason: String) {
		metrics::counter!("huddle_server_commands_rejected_total", "kind" => "validation").increment(1);
		debug!(conn_id, %reason, "undecodable frame dropped");

		if self.settings.emit_command_rejections {
			let inner = self.inner.read().await;
			BroadcastRouter::new(&inner.registry).to_connection(
				conn_id,
				ServerEvent::CommandRejected(CommandRejected {
					command: "unknown".to_string(),
					reason,
				}),
			);
		}
	}

	/// Drop a connection. When it was the user's current binding the user goes
	/// offline and everyone is told once.
	pub async fn close_connection(&self, conn_id: ConnId) {
		let mut guard = self.inner.write().await;
		let HubInner { store, registry } = &mut *guard;

		let Some(user_id) = registry.unbind(conn_id) else {
			debug!(conn_id, "connection closed (no current binding)");
			return;
		};

		match store.set_user_status(&user_id, UserStatus::Offline) {
			Ok((user, _)) => {
				info!(conn_id, user_id = %user_id, "user went offline");
				BroadcastRouter::new(registry).to_all(ServerEvent::UserStatusChanged(user));
			}
			Err(e) => debug!(conn_id, error = %e, "closed connection for unknown user"),
		}
	}

	pub async fn list_rooms(&self) -> Vec<huddle_domain::Room> {
		self.inner.read().await.store.list_rooms()
	}

	pub async fn list_users(&self) -> Vec<User> {
		self.inner.read().await.store.list_users()
	}

	/// Create an online user and announce it to every connection.
	pub async fn register_user(&self, username: &str, avatar: Option<String>) -> Result<User, Rejection> {
		let username = username.trim();
		if username.is_empty() {
			return Err(Rejection::Validation("username must be non-empty".to_string()));
		}

		let user = User::new(UserId::generate(), username, avatar, unix_ms_now());

		let mut guard = self.inner.write().await;
		let HubInner { store, registry } = &mut *guard;
		store.upsert_user(user.clone());
		BroadcastRouter::new(registry).deliver(Outbound::to_all(ServerEvent::UserJoined(user.clone())));

		info!(user_id = %user.id, username = %user.username, "user registered");
		Ok(user)
	}

	/// Remove a user and announce `userLeft`. Returns false when unknown.
	pub async fn remove_user(&self, user_id: &UserId) -> bool {
		let mut guard = self.inner.write().await;
		let HubInner { store, registry } = &mut *guard;
		if store.remove_user(user_id).is_none() {
			return false;
		}

		BroadcastRouter::new(registry).to_all(ServerEvent::UserLeft(user_id.clone()));
		info!(user_id = %user_id, "user removed");
		true
	}

	pub async fn connection_count(&self) -> usize {
		self.inner.read().await.registry.len()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use huddle_domain::RoomId;
	use huddle_protocol::{AuthenticatePayload, RoomRef};
	use tokio::time::timeout;

	use super::*;

	async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
		timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected to receive within timeout")
			.expect("channel open")
	}

	async fn assert_silent(rx: &mut mpsc::Receiver<ServerEvent>) {
		let got = timeout(Duration::from_millis(50), rx.recv()).await;
		assert!(got.is_err(), "unexpected event: {got:?}");
	}

	fn auth(user: &User) -> ClientCommand {
		ClientCommand::Authenticate(AuthenticatePayload {
			user_id: user.id.clone(),
			token: String::new(),
		})
	}

	#[tokio::test]
	async fn register_user_broadcasts_user_joined() {
		let hub = ChatHub::new(HubSettings::default());
		let (_conn, mut rx) = hub.open_connection().await;

		let alice = hub.register_user("alice", None).await.unwrap();
		assert_eq!(alice.status, UserStatus::Online);
		assert_eq!(recv(&mut rx).await, ServerEvent::UserJoined(alice.clone()));
		assert_eq!(hub.list_users().await, vec![alice]);
		assert!(hub.register_user("   ", None).await.is_err());
	}

	#[tokio::test]
	async fn disconnect_marks_offline_and_broadcasts_once() {
		let hub = ChatHub::new(HubSettings::default());
		let (alice_conn, _alice_rx) = hub.open_connection().await;
		let (_bob_conn, mut bob_rx) = hub.open_connection().await;

		let alice = hub.register_user("alice", None).await.unwrap();
		assert!(matches!(recv(&mut bob_rx).await, ServerEvent::UserJoined(_)));

		hub.handle_command(alice_conn, auth(&alice)).await.unwrap();
		hub.close_connection(alice_conn).await;

		match recv(&mut bob_rx).await {
			ServerEvent::UserStatusChanged(u) => {
				assert_eq!(u.id, alice.id);
				assert_eq!(u.status, UserStatus::Offline);
			}
			other => panic!("expected userStatusChanged, got: {other:?}"),
		}

		hub.close_connection(alice_conn).await;
		assert_silent(&mut bob_rx).await;
		assert_eq!(hub.connection_count().await, 1);
	}

	#[tokio::test]
	async fn closing_evicted_connection_keeps_user_online() {
		let hub = ChatHub::new(HubSettings::default());
		let (old_conn, _old_rx) = hub.open_connection().await;
		let (new_conn, mut new_rx) = hub.open_connection().await;

		let alice = hub.register_user("alice", None).await.unwrap();
		let _ = recv(&mut new_rx).await;

		hub.handle_command(old_conn, auth(&alice)).await.unwrap();
		hub.handle_command(new_conn, auth(&alice)).await.unwrap();
		hub.close_connection(old_conn).await;

		assert_silent(&mut new_rx).await;
		let users = hub.list_users().await;
		assert_eq!(users[0].status, UserStatus::Online);
	}

	#[tokio::test]
	async fn rejections_are_silent_unless_enabled() {
		let join = ClientCommand::JoinRoom(RoomRef {
			room_id: RoomId::new("general").unwrap(),
		});

		let hub = ChatHub::new(HubSettings::default());
		let (conn, mut rx) = hub.open_connection().await;
		assert_eq!(hub.handle_command(conn, join.clone()).await, Err(Rejection::Unauthenticated));
		assert_silent(&mut rx).await;

		let hub = ChatHub::new(HubSettings {
			emit_command_rejections: true,
			..HubSettings::default()
		});
		let (conn, mut rx) = hub.open_connection().await;
		let _ = hub.handle_command(conn, join).await;
		match recv(&mut rx).await {
			ServerEvent::CommandRejected(r) => assert_eq!(r.command, "joinRoom"),
			other => panic!("expected commandRejected, got: {other:?}"),
		}

		hub.reject_frame(conn, "bad json".to_string()).await;
		assert!(matches!(recv(&mut rx).await, ServerEvent::CommandRejected(r) if r.reason == "bad json"));
	}

	#[tokio::test]
	async fn remove_user_broadcasts_user_left() {
		let hub = ChatHub::new(HubSettings {
			seed_default_rooms: false,
			..HubSettings::default()
		});
		assert!(hub.list_rooms().await.is_empty());

		let (_conn, mut rx) = hub.open_connection().await;
		let alice = hub.register_user("alice", None).await.unwrap();
		let _ = recv(&mut rx).await;

		assert!(hub.remove_user(&alice.id).await);
		assert_eq!(recv(&mut rx).await, ServerEvent::UserLeft(alice.id.clone()));
		assert!(!hub.remove_user(&alice.id).await);
	}
}
