#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::SinkExt;
use huddle_client_core::connection::CLIENT_DISCONNECT_REASON;
use huddle_client_core::transport::{ConnectFuture, connect_websocket};
use huddle_client_core::{
	ApiClient, ClientConfig, ClientCoreError, ClientEvent, ConnectionManager, ConnectionState, EventBus,
	MirrorAction, RetrySchedule, StateMirror, TransportEvent, TransportSession,
};
use huddle_domain::{RoomId, UserId};
use huddle_protocol::{AuthenticatePayload, ClientCommand, RoomRef, ServerEvent};
use huddle_server::{AppState, ChatHub, ConnectionSettings, HealthState, HubSettings, serve};
use huddle_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Server side of one accepted in-memory transport.
struct FakeLink {
	commands: mpsc::Receiver<ClientCommand>,
	events: mpsc::Sender<TransportEvent>,
}

impl FakeLink {
	async fn next_command(&mut self) -> Option<ClientCommand> {
		timeout(WAIT, self.commands.recv()).await.ok().flatten()
	}
}

/// Connector whose outcome is decided per call (1-based) by `accept`.
fn scripted_connector(
	accept: impl Fn(u32) -> bool + Send + 'static,
) -> (
	impl FnMut(WsEndpoint) -> ConnectFuture + Send + 'static,
	mpsc::UnboundedReceiver<FakeLink>,
	Arc<AtomicU32>,
) {
	let (links_tx, links_rx) = mpsc::unbounded_channel();
	let calls = Arc::new(AtomicU32::new(0));
	let counter = calls.clone();

	let connector = move |_endpoint: WsEndpoint| -> ConnectFuture {
		let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
		if !accept(call) {
			return Box::pin(async move {
				Err::<TransportSession, _>(ClientCoreError::Connect(format!("refused (call {call})")))
			});
		}
		let (session, commands, events) = TransportSession::channel();
		let _ = links_tx.send(FakeLink { commands, events });
		Box::pin(async move { Ok(session) })
	};

	(connector, links_rx, calls)
}

fn test_config() -> ClientConfig {
	ClientConfig {
		heartbeat_interval: Duration::from_secs(3600),
		reconnect_delay: Duration::from_millis(5),
		reconnect_delay_max: Duration::from_millis(20),
		connect_timeout: Duration::from_secs(1),
		..ClientConfig::default()
	}
}

fn record_events(bus: &EventBus) -> mpsc::UnboundedReceiver<ClientEvent> {
	let (tx, rx) = mpsc::unbounded_channel();
	bus.on_any(move |ev| {
		let _ = tx.send(ev.clone());
	});
	rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Option<ClientEvent> {
	timeout(WAIT, rx.recv()).await.ok().flatten()
}

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<ClientEvent>, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
	loop {
		match next_event(rx).await {
			Some(ev) if pred(&ev) => return ev,
			Some(_) => {}
			None => panic!("expected event did not arrive"),
		}
	}
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
	let mut out = Vec::new();
	while let Ok(ev) = rx.try_recv() {
		out.push(ev);
	}
	out
}

fn room(id: &str) -> RoomId {
	RoomId::new(id).unwrap()
}

#[tokio::test]
async fn retries_are_bounded_and_reported_once() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, _links, calls) = scripted_connector(|_| false);
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);

	manager.connect().await.unwrap();
	wait_for(&mut events, |ev| matches!(ev, ClientEvent::ReconnectError { .. })).await;
	tokio::time::sleep(Duration::from_millis(100)).await;

	let mut seen = vec![ClientEvent::ReconnectError { attempts: 5 }];
	seen.extend(drain(&mut events));
	let errors = seen
		.iter()
		.filter(|ev| matches!(ev, ClientEvent::ReconnectError { .. }))
		.count();
	assert_eq!(errors, 1, "exactly one reconnect error: {seen:?}");
	assert!(!seen.iter().any(|ev| matches!(ev, ClientEvent::Connect)));

	// Initial attempt plus the configured number of retries.
	assert_eq!(calls.load(Ordering::SeqCst), 6);
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnecting_events_count_up_to_the_limit() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, _links, _calls) = scripted_connector(|_| false);
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);

	manager.connect().await.unwrap();
	let mut attempts = Vec::new();
	loop {
		match next_event(&mut events).await {
			Some(ClientEvent::Reconnecting(RetrySchedule {
				attempt,
				next_retry_in_ms,
			})) => {
				assert!(next_retry_in_ms <= 20);
				attempts.push(attempt);
			}
			Some(ClientEvent::ReconnectError { attempts: n }) => {
				assert_eq!(n, 5);
				break;
			}
			Some(_) => {}
			None => panic!("reconnect error never arrived"),
		}
	}
	assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn identity_and_rooms_are_replayed_after_reconnect() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, mut links, _calls) = scripted_connector(|_| true);
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);
	let alice = UserId::new("user_alice").unwrap();

	manager.authenticate(alice.clone(), "dev").await.unwrap();
	manager.join_room(room("general")).await.unwrap();
	manager.connect().await.unwrap();

	let mut first = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert_eq!(
		first.next_command().await,
		Some(ClientCommand::Authenticate(AuthenticatePayload {
			user_id: alice.clone(),
			token: "dev".to_string(),
		}))
	);
	assert_eq!(
		first.next_command().await,
		Some(ClientCommand::JoinRoom(RoomRef { room_id: room("general") }))
	);
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Connect));

	manager.join_room(room("random")).await.unwrap();
	manager.leave_room(room("general")).await.unwrap();
	assert_eq!(
		first.next_command().await,
		Some(ClientCommand::JoinRoom(RoomRef { room_id: room("random") }))
	);
	assert_eq!(
		first.next_command().await,
		Some(ClientCommand::LeaveRoom(RoomRef { room_id: room("general") }))
	);

	first
		.events
		.send(TransportEvent::Closed {
			reason: "transport close".to_string(),
		})
		.await
		.unwrap();

	assert_eq!(
		next_event(&mut events).await,
		Some(ClientEvent::Disconnect {
			reason: "transport close".to_string()
		})
	);
	assert!(matches!(
		next_event(&mut events).await,
		Some(ClientEvent::Reconnecting(RetrySchedule { attempt: 1, .. }))
	));

	let mut second = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert!(matches!(second.next_command().await, Some(ClientCommand::Authenticate(p)) if p.user_id == alice));
	assert_eq!(
		second.next_command().await,
		Some(ClientCommand::JoinRoom(RoomRef { room_id: room("random") }))
	);
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Connect));
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Reconnect { attempt: 1 }));
	assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn server_events_are_republished_verbatim() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, mut links, _calls) = scripted_connector(|_| true);
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);

	manager.connect().await.unwrap();
	let link = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Connect));

	let deleted = ServerEvent::RoomDeleted(room("design"));
	link.events.send(TransportEvent::Event(deleted.clone())).await.unwrap();
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Server(deleted)));
}

#[tokio::test]
async fn heartbeat_runs_only_while_connected() {
	let bus = Arc::new(EventBus::new());
	let (connector, mut links, _calls) = scripted_connector(|_| true);
	let cfg = ClientConfig {
		heartbeat_interval: Duration::from_millis(30),
		..test_config()
	};
	let manager = ConnectionManager::spawn_with_connector(cfg, bus, connector);

	manager.connect().await.unwrap();
	let mut link = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert_eq!(link.next_command().await, Some(ClientCommand::Heartbeat {}));
	assert_eq!(link.next_command().await, Some(ClientCommand::Heartbeat {}));

	manager.disconnect().await.unwrap();
	// The manager dropped its end, so the command stream ends.
	let rest = timeout(WAIT, async {
		let mut n = 0;
		while link.commands.recv().await.is_some() {
			n += 1;
		}
		n
	})
	.await
	.expect("transport released after disconnect");
	assert!(rest <= 1, "heartbeats kept flowing after disconnect: {rest}");
}

#[tokio::test]
async fn disconnect_is_idempotent() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, mut links, _calls) = scripted_connector(|_| true);
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);

	// Nothing to tear down yet.
	manager.disconnect().await.unwrap();

	manager.connect().await.unwrap();
	let _link = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Connect));

	manager.disconnect().await.unwrap();
	manager.disconnect().await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(
		drain(&mut events),
		vec![ClientEvent::Disconnect {
			reason: CLIENT_DISCONNECT_REASON.to_string()
		}]
	);
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_cancels_pending_retry() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, _links, calls) = scripted_connector(|_| false);
	let cfg = ClientConfig {
		reconnect_delay: Duration::from_millis(300),
		reconnect_delay_max: Duration::from_millis(300),
		..test_config()
	};
	let manager = ConnectionManager::spawn_with_connector(cfg, bus, connector);

	manager.connect().await.unwrap();
	wait_for(&mut events, |ev| matches!(ev, ClientEvent::Reconnecting(RetrySchedule { attempt: 1, .. }))).await;
	manager.disconnect().await.unwrap();

	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert!(drain(&mut events).is_empty());
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

/// Connector that accepts every call after `delay`.
fn slow_connector(
	delay: Duration,
) -> (
	impl FnMut(WsEndpoint) -> ConnectFuture + Send + 'static,
	mpsc::UnboundedReceiver<FakeLink>,
) {
	let (links_tx, links_rx) = mpsc::unbounded_channel();
	let connector = move |_endpoint: WsEndpoint| -> ConnectFuture {
		let links_tx = links_tx.clone();
		Box::pin(async move {
			tokio::time::sleep(delay).await;
			let (session, commands, events) = TransportSession::channel();
			let _ = links_tx.send(FakeLink { commands, events });
			Ok::<_, ClientCoreError>(session)
		})
	};
	(connector, links_rx)
}

#[tokio::test]
async fn disconnect_abandons_handshake_in_flight() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, mut links) = slow_connector(Duration::from_millis(500));
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);
	let mut state = manager.watch_state();

	manager.authenticate(UserId::new("user_alice").unwrap(), "dev").await.unwrap();
	manager.connect().await.unwrap();
	timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connecting))
		.await
		.expect("connecting in time")
		.unwrap();

	tokio::time::sleep(Duration::from_millis(50)).await;
	manager.disconnect().await.unwrap();
	timeout(
		Duration::from_millis(100),
		state.wait_for(|s| *s == ConnectionState::Disconnected),
	)
	.await
	.expect("disconnect applied while the handshake was pending")
	.unwrap();

	tokio::time::sleep(Duration::from_millis(700)).await;
	assert!(links.try_recv().is_err(), "abandoned handshake still produced a transport");
	assert!(drain(&mut events).is_empty());
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_to_new_endpoint_replaces_pending_handshake() {
	let bus = Arc::new(EventBus::new());
	let mut events = record_events(&bus);
	let (connector, mut links) = slow_connector(Duration::from_millis(200));
	let manager = ConnectionManager::spawn_with_connector(test_config(), bus, connector);

	manager.connect().await.unwrap();
	tokio::time::sleep(Duration::from_millis(50)).await;
	// Same endpoint while connecting is a no-op.
	manager.connect().await.unwrap();
	let other = WsEndpoint::parse("ws://127.0.0.1:4999").unwrap();
	manager.connect_to(other).await.unwrap();

	let _link = timeout(WAIT, links.recv()).await.unwrap().unwrap();
	assert_eq!(next_event(&mut events).await, Some(ClientEvent::Connect));
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(links.try_recv().is_err(), "only one handshake completes");
	assert!(drain(&mut events).is_empty());
	assert_eq!(manager.state(), ConnectionState::Connected);
}

async fn start_server() -> WsEndpoint {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
	let addr = listener.local_addr().expect("local addr");

	let health = HealthState::new();
	health.mark_ready();
	let state = AppState {
		hub: ChatHub::new(HubSettings::default()),
		health,
		connection: ConnectionSettings::default(),
	};
	tokio::spawn(serve(listener, state));

	WsEndpoint::parse(&format!("ws://{addr}")).expect("endpoint")
}

#[tokio::test]
async fn end_to_end_message_reaches_other_client_mirror() {
	let endpoint = start_server().await;
	let api = ApiClient::for_endpoint(&endpoint);
	let alice = api.register_user("alice", None).await.expect("register alice");
	let bob = api.register_user("bob", None).await.expect("register bob");
	assert!(api.list_rooms().await.unwrap().iter().any(|r| r.id == room("general")));

	let cfg = ClientConfig {
		endpoint: endpoint.clone(),
		..test_config()
	};

	let bob_bus = Arc::new(EventBus::new());
	let bob_mirror = StateMirror::new();
	bob_mirror.attach(&bob_bus);
	bob_mirror.dispatch(MirrorAction::RoomsLoaded(api.list_rooms().await.unwrap()));
	bob_mirror.dispatch(MirrorAction::SetCurrentRoom(Some(room("general"))));
	let mut bob_events = record_events(&bob_bus);
	let bob_conn = ConnectionManager::spawn(cfg.clone(), bob_bus);
	bob_conn.authenticate(bob.id.clone(), "dev").await.unwrap();
	bob_conn.join_room(room("general")).await.unwrap();
	bob_conn.connect().await.unwrap();
	wait_for(&mut bob_events, |ev| {
		matches!(ev, ClientEvent::Server(ServerEvent::UserJoinedRoom(j)) if j.user.id == bob.id)
	})
	.await;

	let alice_bus = Arc::new(EventBus::new());
	let mut alice_events = record_events(&alice_bus);
	let alice_conn = ConnectionManager::spawn(cfg, alice_bus);
	alice_conn.authenticate(alice.id.clone(), "dev").await.unwrap();
	alice_conn.connect().await.unwrap();
	wait_for(&mut alice_events, |ev| matches!(ev, ClientEvent::Connect)).await;
	alice_conn.send_text(room("general"), "hello bob").await.unwrap();

	let received = wait_for(&mut bob_events, |ev| {
		matches!(ev, ClientEvent::Server(ServerEvent::MessageReceived(_)))
	})
	.await;
	let ClientEvent::Server(ServerEvent::MessageReceived(message)) = received else {
		unreachable!();
	};
	assert_eq!(message.sender.id, alice.id);
	assert_eq!(message.content, "hello bob");

	// The mirror listener was registered before the recorder, so it has
	// already applied the message.
	let snapshot = bob_mirror.snapshot();
	assert!(snapshot.connection.is_connected);
	let general = snapshot.room(&room("general")).expect("general loaded");
	assert!(general.has_member(&bob.id));
	assert_eq!(general.messages.last().map(|m| m.id.clone()), Some(message.id.clone()));
	assert_eq!(snapshot.current_room.as_ref().map(|r| r.messages.len()), Some(general.messages.len()));

	alice_conn.disconnect().await.unwrap();
	bob_conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn oversized_server_frame_ends_the_session() {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
		let _ = ws
			.send(tokio_tungstenite::tungstenite::Message::text("x".repeat(4096)))
			.await;
		tokio::time::sleep(Duration::from_secs(1)).await;
	});

	let cfg = ClientConfig {
		max_frame_bytes: 1024,
		..test_config()
	};
	let endpoint = WsEndpoint::parse(&format!("ws://{addr}")).unwrap();
	let mut session = connect_websocket(endpoint, cfg).await.expect("connect");

	match timeout(WAIT, session.inbound.recv()).await.expect("session ended in time") {
		Some(TransportEvent::Closed { reason }) => assert!(reason.starts_with("transport error"), "{reason}"),
		other => panic!("expected the session to close, got: {other:?}"),
	}
}
