#![forbid(unsafe_code)]

//! Client-side copy of the chat state, rebuilt from bus events.
//!
//! `reduce` is pure: it never touches its input and always returns a new
//! value. `StateMirror` wraps each result in a fresh `Arc`, so consumers can
//! detect changes with `Arc::ptr_eq`.

use std::sync::Arc;

use huddle_domain::{Message, Room, RoomId, UnixMillis, User, UserId};
use huddle_protocol::ServerEvent;
use huddle_util::time::unix_ms_now;
use tokio::sync::watch;

use crate::event_bus::{ClientEvent, EventBus, SubscriptionId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
	pub is_connected: bool,
	pub is_reconnecting: bool,
	/// Last time the server was heard from.
	pub last_heartbeat: Option<UnixMillis>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
	pub current_user: Option<User>,
	/// Copy of the selected room, kept in step with `rooms`.
	pub current_room: Option<Room>,
	pub rooms: Vec<Room>,
	pub users: Vec<User>,
	pub connection: ConnectionStatus,
	/// Locally sent messages the server has not echoed yet.
	pub pending_messages: Vec<Message>,
}

impl ChatState {
	pub fn room(&self, id: &RoomId) -> Option<&Room> {
		self.rooms.iter().find(|r| &r.id == id)
	}

	pub fn user(&self, id: &UserId) -> Option<&User> {
		self.users.iter().find(|u| &u.id == id)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorAction {
	/// A bus event observed at `at`.
	Event { event: ClientEvent, at: UnixMillis },
	RoomsLoaded(Vec<Room>),
	UsersLoaded(Vec<User>),
	SetCurrentUser(User),
	ClearCurrentUser,
	/// Select a room by id; `None` or an unknown id clears the selection.
	SetCurrentRoom(Option<RoomId>),
	AddPendingMessage(Message),
}

pub fn reduce(state: &ChatState, action: &MirrorAction) -> ChatState {
	let mut next = state.clone();
	match action {
		MirrorAction::Event { event, at } => apply_event(&mut next, event, *at),
		MirrorAction::RoomsLoaded(rooms) => {
			next.rooms = rooms.clone();
			refresh_current_room(&mut next);
		}
		MirrorAction::UsersLoaded(users) => {
			next.users = users.clone();
			let refreshed = next
				.current_user
				.as_ref()
				.and_then(|c| users.iter().find(|u| u.id == c.id))
				.cloned();
			if refreshed.is_some() {
				next.current_user = refreshed;
			}
		}
		MirrorAction::SetCurrentUser(user) => next.current_user = Some(user.clone()),
		MirrorAction::ClearCurrentUser => next.current_user = None,
		MirrorAction::SetCurrentRoom(id) => {
			next.current_room = id.as_ref().and_then(|id| state.room(id)).cloned();
		}
		MirrorAction::AddPendingMessage(message) => next.pending_messages.push(message.clone()),
	}
	next
}

fn apply_event(state: &mut ChatState, event: &ClientEvent, at: UnixMillis) {
	match event {
		ClientEvent::Connect | ClientEvent::Reconnect { .. } => {
			state.connection = ConnectionStatus {
				is_connected: true,
				is_reconnecting: false,
				last_heartbeat: Some(at),
			};
		}
		ClientEvent::Disconnect { .. } => {
			state.connection.is_connected = false;
		}
		ClientEvent::Reconnecting(_) => {
			state.connection.is_connected = false;
			state.connection.is_reconnecting = true;
		}
		ClientEvent::ReconnectError { .. } => {
			state.connection.is_connected = false;
			state.connection.is_reconnecting = false;
		}
		ClientEvent::Server(event) => {
			state.connection.last_heartbeat = Some(at);
			apply_server_event(state, event);
		}
	}
}

fn apply_server_event(state: &mut ChatState, event: &ServerEvent) {
	match event {
		ServerEvent::UserJoined(user) | ServerEvent::UserStatusChanged(user) => upsert_user(state, user),
		ServerEvent::UserLeft(user_id) => state.users.retain(|u| &u.id != user_id),
		ServerEvent::RoomCreated(room) | ServerEvent::RoomUpdated(room) => {
			match state.rooms.iter_mut().find(|r| r.id == room.id) {
				Some(existing) => *existing = room.clone(),
				None => state.rooms.push(room.clone()),
			}
			if state.current_room.as_ref().is_some_and(|r| r.id == room.id) {
				state.current_room = Some(room.clone());
			}
		}
		ServerEvent::RoomDeleted(room_id) => {
			state.rooms.retain(|r| &r.id != room_id);
			state.pending_messages.retain(|m| &m.room_id != room_id);
			if state.current_room.as_ref().is_some_and(|r| &r.id == room_id) {
				state.current_room = None;
			}
		}
		ServerEvent::UserJoinedRoom(ev) => {
			with_room(state, &ev.room_id, |room| {
				room.add_member(&ev.user.id);
			});
		}
		ServerEvent::UserLeftRoom(ev) => {
			with_room(state, &ev.room_id, |room| {
				room.remove_member(&ev.user_id);
			});
		}
		ServerEvent::MessageReceived(message) => {
			if let Some(pos) = state.pending_messages.iter().position(|p| echoes(p, message)) {
				state.pending_messages.remove(pos);
			}
			with_room(state, &message.room_id, |room| {
				if room.message_position(&message.id).is_none() {
					room.messages.push(message.clone());
				}
			});
		}
		ServerEvent::MessageUpdated(message) => {
			with_room(state, &message.room_id, |room| {
				if let Some(pos) = room.message_position(&message.id) {
					room.messages[pos] = message.clone();
				}
			});
		}
		ServerEvent::MessageDeleted(ev) => {
			with_room(state, &ev.room_id, |room| room.messages.retain(|m| m.id != ev.message_id));
		}
		ServerEvent::MessageRead(ev) => {
			// The event carries no room id.
			let rooms = state.rooms.iter_mut().chain(state.current_room.as_mut());
			for room in rooms {
				if let Some(pos) = room.message_position(&ev.message_id) {
					room.messages[pos].mark_read(&ev.user_id);
				}
			}
		}
		ServerEvent::CommandRejected(_) => {}
	}
}

fn upsert_user(state: &mut ChatState, user: &User) {
	match state.users.iter_mut().find(|u| u.id == user.id) {
		Some(existing) => *existing = user.clone(),
		None => state.users.push(user.clone()),
	}
	if state.current_user.as_ref().is_some_and(|u| u.id == user.id) {
		state.current_user = Some(user.clone());
	}
}

/// Apply `f` to the room in the list and to the selected room when it matches.
fn with_room(state: &mut ChatState, room_id: &RoomId, f: impl Fn(&mut Room)) {
	if let Some(room) = state.rooms.iter_mut().find(|r| &r.id == room_id) {
		f(room);
	}
	if let Some(room) = state.current_room.as_mut().filter(|r| &r.id == room_id) {
		f(room);
	}
}

fn refresh_current_room(state: &mut ChatState) {
	if let Some(current) = state.current_room.take() {
		state.current_room = state.room(&current.id).cloned();
	}
}

fn echoes(pending: &Message, confirmed: &Message) -> bool {
	pending.room_id == confirmed.room_id && pending.sender.id == confirmed.sender.id && pending.content == confirmed.content
}

/// Shared, observable holder of the latest `ChatState` snapshot.
#[derive(Debug, Clone)]
pub struct StateMirror {
	tx: Arc<watch::Sender<Arc<ChatState>>>,
}

impl Default for StateMirror {
	fn default() -> Self {
		Self::new()
	}
}

impl StateMirror {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(Arc::new(ChatState::default()));
		Self { tx: Arc::new(tx) }
	}

	pub fn snapshot(&self) -> Arc<ChatState> {
		self.tx.borrow().clone()
	}

	/// Receiver notified after every dispatch.
	pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
		self.tx.subscribe()
	}

	pub fn dispatch(&self, action: MirrorAction) -> Arc<ChatState> {
		let mut out = None;
		self.tx.send_modify(|state| {
			let next = Arc::new(reduce(state.as_ref(), &action));
			out = Some(next.clone());
			*state = next;
		});
		out.unwrap_or_else(|| self.snapshot())
	}

	pub fn apply_event(&self, event: &ClientEvent) -> Arc<ChatState> {
		self.dispatch(MirrorAction::Event {
			event: event.clone(),
			at: unix_ms_now(),
		})
	}

	/// Subscribe the mirror to every event on `bus`. Detach with
	/// `EventBus::off_any`.
	pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
		let mirror = self.clone();
		bus.on_any(move |event| {
			mirror.apply_event(event);
		})
	}
}
