#![forbid(unsafe_code)]

//! Applies one inbound command against the store and produces the events it
//! causes. Failed preconditions come back as a `Rejection`; the caller decides
//! whether the originating connection hears about it.

use huddle_domain::{Room, RoomId, UnixMillis, User, UserId, UserStatus};
use huddle_protocol::{
	AuthenticatePayload, ClientCommand, CreateRoomPayload, EditMessagePayload, MessageDeleted, MessageRead, MessageRef,
	RoomRef, SendMessagePayload, ServerEvent, UpdateRoomPayload, UpdateStatusPayload, UserJoinedRoom, UserLeftRoom,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::server::registry::{ConnId, ConnectionRegistry};
use crate::server::router::Outbound;
use crate::server::store::{DEFAULT_MAX_USERS, MarkRead, NewMessage, NewRoom, StateStore, StoreError};

/// Why a command was not applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
	#[error("invalid command: {0}")]
	Validation(String),
	#[error("connection is not authenticated as a known user")]
	Unauthenticated,
	#[error("not found: {0}")]
	NotFound(String),
	#[error("forbidden: {0}")]
	Forbidden(String),
}

impl Rejection {
	/// Short label used for metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			Rejection::Validation(_) => "validation",
			Rejection::Unauthenticated => "unauthenticated",
			Rejection::NotFound(_) => "not_found",
			Rejection::Forbidden(_) => "forbidden",
		}
	}
}

impl From<StoreError> for Rejection {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotSender { .. } => Rejection::Forbidden(e.to_string()),
			StoreError::RoomNotFound(_) | StoreError::UserNotFound(_) | StoreError::MessageNotFound(_) => {
				Rejection::NotFound(e.to_string())
			}
		}
	}
}

pub type HandlerResult = Result<Vec<Outbound>, Rejection>;

/// Dispatch a decoded command issued by `conn_id`.
pub fn handle(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	cmd: ClientCommand,
	now: UnixMillis,
) -> HandlerResult {
	match cmd {
		ClientCommand::Authenticate(p) => authenticate(store, registry, conn_id, p),
		ClientCommand::JoinRoom(p) => join_room(store, registry, conn_id, p),
		ClientCommand::LeaveRoom(p) => leave_room(store, registry, conn_id, p),
		ClientCommand::SendMessage(p) => send_message(store, registry, conn_id, p, now),
		ClientCommand::EditMessage(p) => edit_message(store, registry, conn_id, p, now),
		ClientCommand::DeleteMessage(p) => delete_message(store, registry, conn_id, p),
		ClientCommand::MarkMessageAsRead(p) => mark_read(store, registry, conn_id, p),
		ClientCommand::UpdateStatus(p) => update_status(store, registry, conn_id, p),
		ClientCommand::CreateRoom(p) => create_room(store, registry, conn_id, p, now),
		ClientCommand::UpdateRoom(p) => update_room(store, registry, conn_id, p),
		ClientCommand::DeleteRoom(p) => delete_room(store, registry, conn_id, p),
		ClientCommand::Heartbeat {} => heartbeat(store, registry, conn_id, now),
	}
}

/// The user this connection authenticated as, if the store still knows it.
fn current_user(store: &StateStore, registry: &ConnectionRegistry, conn_id: ConnId) -> Result<User, Rejection> {
	let user_id = registry.user_for(conn_id).ok_or(Rejection::Unauthenticated)?;
	store.get_user(user_id).cloned().ok_or(Rejection::Unauthenticated)
}

fn room_or_not_found<'a>(store: &'a StateStore, room_id: &RoomId) -> Result<&'a Room, Rejection> {
	store
		.get_room(room_id)
		.ok_or_else(|| Rejection::NotFound(format!("room {room_id}")))
}

fn room_event(room: &Room, event: ServerEvent) -> Outbound {
	Outbound::to_room(room.id.clone(), room.members.clone(), event)
}

/// Identity is trusted as supplied; the token is not verified.
fn authenticate(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: AuthenticatePayload,
) -> HandlerResult {
	if let Some(evicted) = registry.bind(&p.user_id, conn_id) {
		info!(conn_id, evicted, user_id = %p.user_id, "user re-authenticated; previous connection evicted");
	} else {
		debug!(conn_id, user_id = %p.user_id, "connection authenticated");
	}

	// A user coming back after a disconnect is online again.
	let mut out = Vec::new();
	if store.get_user(&p.user_id).is_some_and(|u| u.status == UserStatus::Offline) {
		let (user, _) = store.set_user_status(&p.user_id, UserStatus::Online)?;
		out.push(Outbound::to_all(ServerEvent::UserStatusChanged(user)));
	}
	Ok(out)
}

fn join_room(store: &mut StateStore, registry: &mut ConnectionRegistry, conn_id: ConnId, p: RoomRef) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	if !store.add_room_member(&p.room_id, &user.id)? {
		return Ok(Vec::new());
	}

	let room = room_or_not_found(store, &p.room_id)?;
	Ok(vec![room_event(
		room,
		ServerEvent::UserJoinedRoom(UserJoinedRoom {
			user,
			room_id: p.room_id,
		}),
	)])
}

fn leave_room(store: &mut StateStore, registry: &mut ConnectionRegistry, conn_id: ConnId, p: RoomRef) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	if !store.remove_room_member(&p.room_id, &user.id)? {
		return Ok(Vec::new());
	}

	let room = room_or_not_found(store, &p.room_id)?;
	let event = ServerEvent::UserLeftRoom(UserLeftRoom {
		user_id: user.id,
		room_id: p.room_id,
	});

	// The leaver is no longer a member but still needs to see its own departure.
	Ok(vec![
		room_event(room, event.clone()),
		Outbound::to_connection(conn_id, event),
	])
}

fn send_message(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: SendMessagePayload,
	now: UnixMillis,
) -> HandlerResult {
	let sender = current_user(store, registry, conn_id)?;
	let message = store.append_message(
		&p.room_id,
		NewMessage {
			content: p.content,
			kind: p.kind,
			sender,
			timestamp: p.timestamp.unwrap_or(now),
			reply_to: p.reply_to,
			file: p.file,
		},
	)?;

	let room = room_or_not_found(store, &p.room_id)?;
	Ok(vec![room_event(room, ServerEvent::MessageReceived(message))])
}

fn edit_message(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: EditMessagePayload,
	now: UnixMillis,
) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	let message = store.edit_message(&p.message_id, p.content, &user.id, now)?;

	let room = room_or_not_found(store, &message.room_id)?;
	Ok(vec![room_event(room, ServerEvent::MessageUpdated(message))])
}

fn delete_message(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: MessageRef,
) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	let removed = store.delete_message(&p.message_id, &user.id)?;

	let room = room_or_not_found(store, &removed.room_id)?;
	Ok(vec![room_event(
		room,
		ServerEvent::MessageDeleted(MessageDeleted {
			message_id: removed.id,
			room_id: removed.room_id,
		}),
	)])
}

fn mark_read(store: &mut StateStore, registry: &mut ConnectionRegistry, conn_id: ConnId, p: MessageRef) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	let room_id = match store.mark_read(&p.message_id, &user.id)? {
		MarkRead::Added { room_id } => room_id,
		MarkRead::AlreadyRead => return Ok(Vec::new()),
	};

	let room = room_or_not_found(store, &room_id)?;
	Ok(vec![room_event(
		room,
		ServerEvent::MessageRead(MessageRead {
			message_id: p.message_id,
			user_id: user.id,
		}),
	)])
}

fn update_status(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: UpdateStatusPayload,
) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	let (user, _) = store.set_user_status(&user.id, p.status)?;
	Ok(vec![Outbound::to_all(ServerEvent::UserStatusChanged(user))])
}

fn create_room(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: CreateRoomPayload,
	now: UnixMillis,
) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;

	let name = p.name.trim();
	if name.is_empty() {
		return Err(Rejection::Validation("room name must be non-empty".to_string()));
	}

	let room = store.create_room(
		NewRoom {
			name: name.to_string(),
			description: p.description,
			max_users: p.max_users.unwrap_or(DEFAULT_MAX_USERS),
			is_private: p.is_private.unwrap_or(false),
		},
		&user.id,
		now,
	);

	info!(room_id = %room.id, user_id = %user.id, "room created");
	Ok(vec![Outbound::to_all(ServerEvent::RoomCreated(room))])
}

fn ensure_creator(room: &Room, user_id: &UserId) -> Result<(), Rejection> {
	if room.is_created_by(user_id) {
		Ok(())
	} else {
		Err(Rejection::Forbidden(format!("user {user_id} did not create room {}", room.id)))
	}
}

fn update_room(
	store: &mut StateStore,
	registry: &mut ConnectionRegistry,
	conn_id: ConnId,
	p: UpdateRoomPayload,
) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	ensure_creator(room_or_not_found(store, &p.room_id)?, &user.id)?;

	if p.updates.is_empty() {
		return Err(Rejection::Validation("room update changes nothing".to_string()));
	}
	if let Some(name) = &p.updates.name
		&& name.trim().is_empty()
	{
		return Err(Rejection::Validation("room name must be non-empty".to_string()));
	}

	let room = store
		.update_room(&p.room_id, &p.updates)
		.cloned()
		.ok_or_else(|| Rejection::NotFound(format!("room {}", p.room_id)))?;
	Ok(vec![Outbound::to_all(ServerEvent::RoomUpdated(room))])
}

fn delete_room(store: &mut StateStore, registry: &mut ConnectionRegistry, conn_id: ConnId, p: RoomRef) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	ensure_creator(room_or_not_found(store, &p.room_id)?, &user.id)?;

	store.delete_room(&p.room_id);
	info!(room_id = %p.room_id, user_id = %user.id, "room deleted");
	Ok(vec![Outbound::to_all(ServerEvent::RoomDeleted(p.room_id))])
}

fn heartbeat(store: &mut StateStore, registry: &mut ConnectionRegistry, conn_id: ConnId, now: UnixMillis) -> HandlerResult {
	let user = current_user(store, registry, conn_id)?;
	store.touch_heartbeat(&user.id, now)?;
	Ok(Vec::new())
}
