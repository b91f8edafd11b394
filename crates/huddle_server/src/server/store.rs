#![forbid(unsafe_code)]

use std::collections::HashMap;

use huddle_domain::{
	FileMeta, Message, MessageId, MessageType, Room, RoomId, RoomUpdate, SYSTEM_USER_ID, UnixMillis, User, UserId,
	UserStatus,
};
use thiserror::Error;

/// Default capacity hint for rooms created without `maxUsers`.
pub const DEFAULT_MAX_USERS: u32 = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
	#[error("room not found: {0}")]
	RoomNotFound(RoomId),
	#[error("user not found: {0}")]
	UserNotFound(UserId),
	#[error("message not found: {0}")]
	MessageNotFound(MessageId),
	#[error("user {requestor} is not the sender of message {message}")]
	NotSender { message: MessageId, requestor: UserId },
}

/// Input for `StateStore::create_room`.
#[derive(Debug, Clone)]
pub struct NewRoom {
	pub name: String,
	pub description: Option<String>,
	pub max_users: u32,
	pub is_private: bool,
}

/// Input for `StateStore::append_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub content: String,
	pub kind: MessageType,
	pub sender: User,
	pub timestamp: UnixMillis,
	pub reply_to: Option<MessageId>,
	pub file: FileMeta,
}

/// Outcome of `StateStore::mark_read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkRead {
	Added { room_id: RoomId },
	AlreadyRead,
}

/// Authoritative in-memory tables for users, rooms and messages.
///
/// Callers serialize access (the hub keeps it behind a lock), so every method
/// here is applied atomically relative to other commands.
#[derive(Debug, Default)]
pub struct StateStore {
	users: HashMap<UserId, User>,
	user_order: Vec<UserId>,

	rooms: HashMap<RoomId, Room>,
	room_order: Vec<RoomId>,

	/// message id -> owning room.
	message_index: HashMap<MessageId, RoomId>,
}

impl StateStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Store seeded with the `general` and `random` rooms.
	pub fn with_default_rooms(now: UnixMillis) -> Self {
		let mut store = Self::new();
		store.insert_seed_room("general", "General", "General discussion", 50, now);
		store.insert_seed_room("random", "Random", "Random topics", 30, now);
		store
	}

	fn insert_seed_room(&mut self, id: &str, name: &str, description: &str, max_users: u32, now: UnixMillis) {
		let (Ok(id), Ok(created_by)) = (RoomId::new(id), UserId::new(SYSTEM_USER_ID)) else {
			return;
		};
		self.insert_room(Room {
			id,
			name: name.to_string(),
			description: Some(description.to_string()),
			max_users,
			created_at: now,
			created_by,
			is_private: false,
			members: Vec::new(),
			messages: Vec::new(),
		});
	}

	fn insert_room(&mut self, room: Room) {
		if !self.rooms.contains_key(&room.id) {
			self.room_order.push(room.id.clone());
		}
		self.rooms.insert(room.id.clone(), room);
	}

	/// Insert or replace by id.
	pub fn upsert_user(&mut self, user: User) {
		if !self.users.contains_key(&user.id) {
			self.user_order.push(user.id.clone());
		}
		self.users.insert(user.id.clone(), user);
	}

	/// Remove a user. Room membership and historical messages are left as-is.
	pub fn remove_user(&mut self, id: &UserId) -> Option<User> {
		let removed = self.users.remove(id)?;
		self.user_order.retain(|u| u != id);
		Some(removed)
	}

	pub fn get_user(&self, id: &UserId) -> Option<&User> {
		self.users.get(id)
	}

	pub fn list_users(&self) -> Vec<User> {
		self.user_order.iter().filter_map(|id| self.users.get(id)).cloned().collect()
	}

	/// Set a user's presence. Returns the updated user and whether it changed.
	pub fn set_user_status(&mut self, id: &UserId, status: UserStatus) -> Result<(User, bool), StoreError> {
		let user = self.users.get_mut(id).ok_or_else(|| StoreError::UserNotFound(id.clone()))?;
		let changed = user.status != status;
		user.status = status;
		Ok((user.clone(), changed))
	}

	pub fn touch_heartbeat(&mut self, id: &UserId, now: UnixMillis) -> Result<(), StoreError> {
		let user = self.users.get_mut(id).ok_or_else(|| StoreError::UserNotFound(id.clone()))?;
		user.last_heartbeat = Some(now);
		Ok(())
	}

	pub fn list_rooms(&self) -> Vec<Room> {
		self.room_order.iter().filter_map(|id| self.rooms.get(id)).cloned().collect()
	}

	pub fn get_room(&self, id: &RoomId) -> Option<&Room> {
		self.rooms.get(id)
	}

	/// Allocate a fresh room with `creator` as its only member.
	pub fn create_room(&mut self, draft: NewRoom, creator: &UserId, now: UnixMillis) -> Room {
		let room = Room {
			id: RoomId::generate(),
			name: draft.name,
			description: draft.description,
			max_users: draft.max_users,
			created_at: now,
			created_by: creator.clone(),
			is_private: draft.is_private,
			members: vec![creator.clone()],
			messages: Vec::new(),
		};
		self.insert_room(room.clone());
		room
	}

	/// Shallow-merge `update` into an existing room. `None` when the room is unknown.
	pub fn update_room(&mut self, id: &RoomId, update: &RoomUpdate) -> Option<&Room> {
		let room = self.rooms.get_mut(id)?;
		room.apply_update(update);
		Some(room)
	}

	pub fn delete_room(&mut self, id: &RoomId) -> Option<Room> {
		let room = self.rooms.remove(id)?;
		self.room_order.retain(|r| r != id);
		for msg in &room.messages {
			self.message_index.remove(&msg.id);
		}
		Some(room)
	}

	/// Returns whether the member was added; adding a present member is a no-op.
	pub fn add_room_member(&mut self, room_id: &RoomId, user_id: &UserId) -> Result<bool, StoreError> {
		if !self.users.contains_key(user_id) {
			return Err(StoreError::UserNotFound(user_id.clone()));
		}
		let room = self
			.rooms
			.get_mut(room_id)
			.ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
		Ok(room.add_member(user_id))
	}

	/// Returns whether the member was present; removing an absent member is a no-op.
	pub fn remove_room_member(&mut self, room_id: &RoomId, user_id: &UserId) -> Result<bool, StoreError> {
		let room = self
			.rooms
			.get_mut(room_id)
			.ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;
		Ok(room.remove_member(user_id))
	}

	/// Allocate an id and append to the room's history. `read_by` starts with the sender.
	pub fn append_message(&mut self, room_id: &RoomId, draft: NewMessage) -> Result<Message, StoreError> {
		let room = self
			.rooms
			.get_mut(room_id)
			.ok_or_else(|| StoreError::RoomNotFound(room_id.clone()))?;

		let mut id = MessageId::generate();
		while self.message_index.contains_key(&id) {
			id = MessageId::generate();
		}

		let message = Message {
			id: id.clone(),
			content: draft.content,
			kind: draft.kind,
			read_by: vec![draft.sender.id.clone()],
			sender: draft.sender,
			room_id: room_id.clone(),
			timestamp: draft.timestamp,
			edited_at: None,
			is_edited: false,
			reply_to: draft.reply_to,
			file: draft.file,
		};

		room.messages.push(message.clone());
		self.message_index.insert(id, room_id.clone());
		Ok(message)
	}

	pub fn find_message(&self, id: &MessageId) -> Option<(&Room, &Message)> {
		let room = self.rooms.get(self.message_index.get(id)?)?;
		let msg = room.messages.iter().find(|m| &m.id == id)?;
		Some((room, msg))
	}

	fn find_message_mut(&mut self, id: &MessageId) -> Result<&mut Message, StoreError> {
		let not_found = || StoreError::MessageNotFound(id.clone());
		let room_id = self.message_index.get(id).ok_or_else(not_found)?;
		let room = self.rooms.get_mut(room_id).ok_or_else(not_found)?;
		room.messages.iter_mut().find(|m| &m.id == id).ok_or_else(not_found)
	}

	/// Only the original sender may edit.
	pub fn edit_message(
		&mut self,
		id: &MessageId,
		content: String,
		requestor: &UserId,
		now: UnixMillis,
	) -> Result<Message, StoreError> {
		let msg = self.find_message_mut(id)?;
		if !msg.is_sent_by(requestor) {
			return Err(StoreError::NotSender {
				message: id.clone(),
				requestor: requestor.clone(),
			});
		}
		msg.apply_edit(content, now);
		Ok(msg.clone())
	}

	/// Only the original sender may delete. Returns the removed message.
	pub fn delete_message(&mut self, id: &MessageId, requestor: &UserId) -> Result<Message, StoreError> {
		let not_found = || StoreError::MessageNotFound(id.clone());
		let room_id = self.message_index.get(id).cloned().ok_or_else(not_found)?;
		let room = self.rooms.get_mut(&room_id).ok_or_else(not_found)?;
		let pos = room.message_position(id).ok_or_else(not_found)?;

		if !room.messages[pos].is_sent_by(requestor) {
			return Err(StoreError::NotSender {
				message: id.clone(),
				requestor: requestor.clone(),
			});
		}

		let removed = room.messages.remove(pos);
		self.message_index.remove(id);
		Ok(removed)
	}

	pub fn mark_read(&mut self, id: &MessageId, user_id: &UserId) -> Result<MarkRead, StoreError> {
		let msg = self.find_message_mut(id)?;
		if msg.mark_read(user_id) {
			Ok(MarkRead::Added {
				room_id: msg.room_id.clone(),
			})
		} else {
			Ok(MarkRead::AlreadyRead)
		}
	}
}
