#![forbid(unsafe_code)]

//! Named events carried over the websocket channel.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": <payload>}`.

use huddle_domain::{FileMeta, Message, MessageId, MessageType, Room, RoomId, RoomUpdate, UnixMillis, User, UserId, UserStatus};
use serde::{Deserialize, Serialize};

/// Client -> server commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
	Authenticate(AuthenticatePayload),
	JoinRoom(RoomRef),
	LeaveRoom(RoomRef),
	SendMessage(SendMessagePayload),
	EditMessage(EditMessagePayload),
	DeleteMessage(MessageRef),
	MarkMessageAsRead(MessageRef),
	UpdateStatus(UpdateStatusPayload),
	CreateRoom(CreateRoomPayload),
	UpdateRoom(UpdateRoomPayload),
	DeleteRoom(RoomRef),
	Heartbeat {},
}

impl ClientCommand {
	/// Wire name of the command.
	pub const fn name(&self) -> &'static str {
		match self {
			ClientCommand::Authenticate(_) => "authenticate",
			ClientCommand::JoinRoom(_) => "joinRoom",
			ClientCommand::LeaveRoom(_) => "leaveRoom",
			ClientCommand::SendMessage(_) => "sendMessage",
			ClientCommand::EditMessage(_) => "editMessage",
			ClientCommand::DeleteMessage(_) => "deleteMessage",
			ClientCommand::MarkMessageAsRead(_) => "markMessageAsRead",
			ClientCommand::UpdateStatus(_) => "updateStatus",
			ClientCommand::CreateRoom(_) => "createRoom",
			ClientCommand::UpdateRoom(_) => "updateRoom",
			ClientCommand::DeleteRoom(_) => "deleteRoom",
			ClientCommand::Heartbeat {} => "heartbeat",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
	pub user_id: UserId,
	/// Accepted but not verified.
	#[serde(default)]
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
	pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
	pub room_id: RoomId,
	pub content: String,
	#[serde(rename = "type", default)]
	pub kind: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<UnixMillis>,
	#[serde(flatten)]
	pub file: FileMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessagePayload {
	pub message_id: MessageId,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusPayload {
	pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub is_private: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_users: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomPayload {
	pub room_id: RoomId,
	pub updates: RoomUpdate,
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
	UserJoined(User),
	UserLeft(UserId),
	UserStatusChanged(User),
	RoomCreated(Room),
	RoomUpdated(Room),
	RoomDeleted(RoomId),
	UserJoinedRoom(UserJoinedRoom),
	UserLeftRoom(UserLeftRoom),
	MessageReceived(Message),
	MessageUpdated(Message),
	MessageDeleted(MessageDeleted),
	MessageRead(MessageRead),
	/// Only sent when the server runs with explicit rejections enabled.
	CommandRejected(CommandRejected),
}

impl ServerEvent {
	/// Wire name of the event.
	pub const fn name(&self) -> &'static str {
		match self {
			ServerEvent::UserJoined(_) => "userJoined",
			ServerEvent::UserLeft(_) => "userLeft",
			ServerEvent::UserStatusChanged(_) => "userStatusChanged",
			ServerEvent::RoomCreated(_) => "roomCreated",
			ServerEvent::RoomUpdated(_) => "roomUpdated",
			ServerEvent::RoomDeleted(_) => "roomDeleted",
			ServerEvent::UserJoinedRoom(_) => "userJoinedRoom",
			ServerEvent::UserLeftRoom(_) => "userLeftRoom",
			ServerEvent::MessageReceived(_) => "messageReceived",
			ServerEvent::MessageUpdated(_) => "messageUpdated",
			ServerEvent::MessageDeleted(_) => "messageDeleted",
			ServerEvent::MessageRead(_) => "messageRead",
			ServerEvent::CommandRejected(_) => "commandRejected",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedRoom {
	pub user: User,
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftRoom {
	pub user_id: UserId,
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
	pub message_id: MessageId,
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
	pub message_id: MessageId,
	pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRejected {
	/// Wire name of the rejected command.
	pub command: String,
	pub reason: String,
}
