#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use huddle_protocol::ServerEvent;
use tracing::{error, trace};

/// When the next connection attempt is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
	pub attempt: u32,
	pub next_retry_in_ms: u64,
}

/// Everything the client publishes to subscribers: transport lifecycle
/// signals plus every server event, republished unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	Connect,
	Disconnect { reason: String },
	Reconnecting(RetrySchedule),
	Reconnect { attempt: u32 },
	/// Published once when the retry budget is exhausted.
	ReconnectError { attempts: u32 },
	Server(ServerEvent),
}

impl ClientEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ClientEvent::Connect => EventKind::Connect,
			ClientEvent::Disconnect { .. } => EventKind::Disconnect,
			ClientEvent::Reconnecting(_) => EventKind::Reconnecting,
			ClientEvent::Reconnect { .. } => EventKind::Reconnect,
			ClientEvent::ReconnectError { .. } => EventKind::ReconnectError,
			ClientEvent::Server(ev) => match ev {
				ServerEvent::UserJoined(_) => EventKind::UserJoined,
				ServerEvent::UserLeft(_) => EventKind::UserLeft,
				ServerEvent::UserStatusChanged(_) => EventKind::UserStatusChanged,
				ServerEvent::RoomCreated(_) => EventKind::RoomCreated,
				ServerEvent::RoomUpdated(_) => EventKind::RoomUpdated,
				ServerEvent::RoomDeleted(_) => EventKind::RoomDeleted,
				ServerEvent::UserJoinedRoom(_) => EventKind::UserJoinedRoom,
				ServerEvent::UserLeftRoom(_) => EventKind::UserLeftRoom,
				ServerEvent::MessageReceived(_) => EventKind::MessageReceived,
				ServerEvent::MessageUpdated(_) => EventKind::MessageUpdated,
				ServerEvent::MessageDeleted(_) => EventKind::MessageDeleted,
				ServerEvent::MessageRead(_) => EventKind::MessageRead,
				ServerEvent::CommandRejected(_) => EventKind::CommandRejected,
			},
		}
	}
}

/// Event name; one per `ClientEvent` variant and server event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	Connect,
	Disconnect,
	Reconnecting,
	Reconnect,
	ReconnectError,
	UserJoined,
	UserLeft,
	UserStatusChanged,
	RoomCreated,
	RoomUpdated,
	RoomDeleted,
	UserJoinedRoom,
	UserLeftRoom,
	MessageReceived,
	MessageUpdated,
	MessageDeleted,
	MessageRead,
	CommandRejected,
}

impl EventKind {
	pub const ALL: [EventKind; 18] = [
		EventKind::Connect,
		EventKind::Disconnect,
		EventKind::Reconnecting,
		EventKind::Reconnect,
		EventKind::ReconnectError,
		EventKind::UserJoined,
		EventKind::UserLeft,
		EventKind::UserStatusChanged,
		EventKind::RoomCreated,
		EventKind::RoomUpdated,
		EventKind::RoomDeleted,
		EventKind::UserJoinedRoom,
		EventKind::UserLeftRoom,
		EventKind::MessageReceived,
		EventKind::MessageUpdated,
		EventKind::MessageDeleted,
		EventKind::MessageRead,
		EventKind::CommandRejected,
	];

	/// Event name as seen by listeners.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Connect => "connect",
			EventKind::Disconnect => "disconnect",
			EventKind::Reconnecting => "reconnecting",
			EventKind::Reconnect => "reconnect",
			EventKind::ReconnectError => "reconnectError",
			EventKind::UserJoined => "userJoined",
			EventKind::UserLeft => "userLeft",
			EventKind::UserStatusChanged => "userStatusChanged",
			EventKind::RoomCreated => "roomCreated",
			EventKind::RoomUpdated => "roomUpdated",
			EventKind::RoomDeleted => "roomDeleted",
			EventKind::UserJoinedRoom => "userJoinedRoom",
			EventKind::UserLeftRoom => "userLeftRoom",
			EventKind::MessageReceived => "messageReceived",
			EventKind::MessageUpdated => "messageUpdated",
			EventKind::MessageDeleted => "messageDeleted",
			EventKind::MessageRead => "messageRead",
			EventKind::CommandRejected => "commandRejected",
		}
	}
}

/// A bus event with a fixed payload type. Implemented by the marker types in
/// [`events`]; `EventBus::on::<E>` only ever hands `E::Payload` to listeners.
pub trait BusEvent {
	const KIND: EventKind;
	type Payload: ?Sized;

	fn payload(event: &ClientEvent) -> Option<&Self::Payload>;
}

/// Marker types for typed subscriptions, e.g. `bus.on::<events::MessageReceived>(|m| ..)`.
pub mod events {
	use huddle_domain::{Message, Room, RoomId, User, UserId};
	use huddle_protocol::ServerEvent;

	use super::{BusEvent, ClientEvent, EventKind, RetrySchedule};

	macro_rules! bus_event {
		($name:ident, $payload:ty, $pat:pat => $out:expr) => {
			#[derive(Debug, Clone, Copy)]
			pub enum $name {}

			impl BusEvent for $name {
				const KIND: EventKind = EventKind::$name;
				type Payload = $payload;

				fn payload(event: &ClientEvent) -> Option<&$payload> {
					match event {
						$pat => Some($out),
						_ => None,
					}
				}
			}
		};
	}

	bus_event!(Connect, (), ClientEvent::Connect => &());
	bus_event!(Disconnect, str, ClientEvent::Disconnect { reason } => reason.as_str());
	bus_event!(Reconnecting, RetrySchedule, ClientEvent::Reconnecting(schedule) => schedule);
	bus_event!(Reconnect, u32, ClientEvent::Reconnect { attempt } => attempt);
	bus_event!(ReconnectError, u32, ClientEvent::ReconnectError { attempts } => attempts);
	bus_event!(UserJoined, User, ClientEvent::Server(ServerEvent::UserJoined(user)) => user);
	bus_event!(UserLeft, UserId, ClientEvent::Server(ServerEvent::UserLeft(id)) => id);
	bus_event!(UserStatusChanged, User, ClientEvent::Server(ServerEvent::UserStatusChanged(user)) => user);
	bus_event!(RoomCreated, Room, ClientEvent::Server(ServerEvent::RoomCreated(room)) => room);
	bus_event!(RoomUpdated, Room, ClientEvent::Server(ServerEvent::RoomUpdated(room)) => room);
	bus_event!(RoomDeleted, RoomId, ClientEvent::Server(ServerEvent::RoomDeleted(id)) => id);
	bus_event!(
		UserJoinedRoom,
		huddle_protocol::UserJoinedRoom,
		ClientEvent::Server(ServerEvent::UserJoinedRoom(joined)) => joined
	);
	bus_event!(
		UserLeftRoom,
		huddle_protocol::UserLeftRoom,
		ClientEvent::Server(ServerEvent::UserLeftRoom(left)) => left
	);
	bus_event!(MessageReceived, Message, ClientEvent::Server(ServerEvent::MessageReceived(m)) => m);
	bus_event!(MessageUpdated, Message, ClientEvent::Server(ServerEvent::MessageUpdated(m)) => m);
	bus_event!(
		MessageDeleted,
		huddle_protocol::MessageDeleted,
		ClientEvent::Server(ServerEvent::MessageDeleted(deleted)) => deleted
	);
	bus_event!(
		MessageRead,
		huddle_protocol::MessageRead,
		ClientEvent::Server(ServerEvent::MessageRead(read)) => read
	);
	bus_event!(
		CommandRejected,
		huddle_protocol::CommandRejected,
		ClientEvent::Server(ServerEvent::CommandRejected(rejected)) => rejected
	);
}

/// Handle returned by `EventBus::on`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Ordered listener lists keyed by event kind.
///
/// Listeners run synchronously on the emitting task. A listener that panics
/// is logged and skipped; the remaining listeners still receive the event.
#[derive(Default)]
pub struct EventBus {
	listeners: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
	next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let total: usize = self.lock().values().map(Vec::len).sum();
		f.debug_struct("EventBus").field("listeners", &total).finish()
	}
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Listener)>>> {
		// A listener never runs while the lock is held, so poisoning only
		// means a panic elsewhere; the map itself is still consistent.
		self.listeners.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn next_id(&self) -> SubscriptionId {
		SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Append a listener for `E`. It receives `E`'s payload only.
	pub fn on<E, F>(&self, listener: F) -> SubscriptionId
	where
		E: BusEvent,
		F: Fn(&E::Payload) + Send + Sync + 'static,
	{
		let id = self.next_id();
		let listener: Listener = Arc::new(move |event: &ClientEvent| {
			if let Some(payload) = E::payload(event) {
				listener(payload);
			}
		});
		self.lock().entry(E::KIND).or_default().push((id, listener));
		id
	}

	/// Append one listener to every event kind.
	pub fn on_any<F>(&self, listener: F) -> SubscriptionId
	where
		F: Fn(&ClientEvent) + Send + Sync + 'static,
	{
		let id = self.next_id();
		let listener: Listener = Arc::new(listener);
		let mut listeners = self.lock();
		for kind in EventKind::ALL {
			listeners.entry(kind).or_default().push((id, listener.clone()));
		}
		id
	}

	/// Remove a listener added with `on::<E>`. Returns false if it was not
	/// subscribed to `E`.
	pub fn off<E: BusEvent>(&self, id: SubscriptionId) -> bool {
		Self::remove(&mut self.lock(), E::KIND, id)
	}

	/// Remove a listener added with `on_any`.
	pub fn off_any(&self, id: SubscriptionId) -> bool {
		let mut listeners = self.lock();
		let mut removed = false;
		for kind in EventKind::ALL {
			removed |= Self::remove(&mut listeners, kind, id);
		}
		removed
	}

	fn remove(
		listeners: &mut HashMap<EventKind, Vec<(SubscriptionId, Listener)>>,
		kind: EventKind,
		id: SubscriptionId,
	) -> bool {
		let Some(list) = listeners.get_mut(&kind) else {
			return false;
		};
		let before = list.len();
		list.retain(|(sub, _)| *sub != id);
		let removed = list.len() != before;
		if list.is_empty() {
			listeners.remove(&kind);
		}
		removed
	}

	pub fn listener_count(&self, kind: EventKind) -> usize {
		self.lock().get(&kind).map_or(0, Vec::len)
	}

	/// Deliver `event` to the listeners registered for its kind, in
	/// registration order. Returns how many listeners completed normally.
	pub fn emit(&self, event: &ClientEvent) -> usize {
		let kind = event.kind();
		// Snapshot so listeners may subscribe or unsubscribe while running.
		let snapshot: Vec<(SubscriptionId, Listener)> = self.lock().get(&kind).cloned().unwrap_or_default();
		trace!(event = kind.as_str(), listeners = snapshot.len(), "emit");

		let mut delivered = 0;
		for (id, listener) in snapshot {
			match catch_unwind(AssertUnwindSafe(|| listener(event))) {
				Ok(()) => delivered += 1,
				Err(panic) => {
					let reason = panic
						.downcast_ref::<&str>()
						.map(|s| s.to_string())
						.or_else(|| panic.downcast_ref::<String>().cloned())
						.unwrap_or_else(|| "unknown panic".to_string());
					error!(event = kind.as_str(), subscription = id.0, %reason, "event listener panicked");
				}
			}
		}
		delivered
	}
}
