#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub type UnixMillis = i64;

/// Errors for parsing identifiers and enum tags from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown status: {0}")]
	UnknownStatus(String),
	#[error("unknown message type: {0}")]
	UnknownMessageType(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident, $prefix:literal) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Prefix used by [`Self::generate`].
			pub const PREFIX: &'static str = $prefix;

			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			/// Allocate a fresh, practically unique id (`<prefix>_<uuid v4>`).
			pub fn generate() -> Self {
				Self(format!("{}_{}", Self::PREFIX, uuid::Uuid::new_v4().simple()))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Opaque user identifier.
	UserId,
	"user"
);

string_id!(
	/// Room identifier. Seed rooms use well-known ids (`general`, `random`).
	RoomId,
	"room"
);

string_id!(
	/// Server-assigned message identifier.
	MessageId,
	"msg"
);

/// Creator id recorded on rooms that exist from startup.
pub const SYSTEM_USER_ID: &str = "system";

/// Presence tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
	Online,
	Away,
	Offline,
}

impl UserStatus {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			UserStatus::Online => "online",
			UserStatus::Away => "away",
			UserStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for UserStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for UserStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"online" => Ok(UserStatus::Online),
			"away" => Ok(UserStatus::Away),
			"offline" => Ok(UserStatus::Offline),
			other => Err(ParseIdError::UnknownStatus(other.to_string())),
		}
	}
}

/// Message content kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
	#[default]
	Text,
	File,
	System,
	Emoji,
}

impl FromStr for MessageType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"text" => Ok(MessageType::Text),
			"file" => Ok(MessageType::File),
			"system" => Ok(MessageType::System),
			"emoji" => Ok(MessageType::Emoji),
			other => Err(ParseIdError::UnknownMessageType(other.to_string())),
		}
	}
}

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub id: UserId,
	pub username: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
	pub status: UserStatus,
	pub joined_at: UnixMillis,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_heartbeat: Option<UnixMillis>,
}

impl User {
	pub fn new(id: UserId, username: impl Into<String>, avatar: Option<String>, now: UnixMillis) -> Self {
		Self {
			id,
			username: username.into(),
			avatar,
			status: UserStatus::Online,
			joined_at: now,
			last_heartbeat: None,
		}
	}
}

/// Optional file attachment metadata carried by `file` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_size: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_url: Option<String>,
}

/// A chat message. `sender` is a snapshot taken at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub content: String,
	#[serde(rename = "type")]
	pub kind: MessageType,
	pub sender: User,
	pub room_id: RoomId,
	pub timestamp: UnixMillis,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub edited_at: Option<UnixMillis>,
	#[serde(default)]
	pub is_edited: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reply_to: Option<MessageId>,
	pub read_by: Vec<UserId>,
	#[serde(flatten)]
	pub file: FileMeta,
}

impl Message {
	pub fn is_sent_by(&self, user_id: &UserId) -> bool {
		&self.sender.id == user_id
	}

	pub fn is_read_by(&self, user_id: &UserId) -> bool {
		self.read_by.iter().any(|u| u == user_id)
	}

	/// Adds `user_id` to `read_by`. Returns true when the reader is new.
	pub fn mark_read(&mut self, user_id: &UserId) -> bool {
		if self.is_read_by(user_id) {
			return false;
		}
		self.read_by.push(user_id.clone());
		true
	}

	/// Replaces the content and sets the edit markers.
	pub fn apply_edit(&mut self, content: String, now: UnixMillis) {
		self.content = content;
		self.edited_at = Some(now);
		self.is_edited = true;
	}
}

/// Fields a room creator may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_users: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub is_private: Option<bool>,
}

impl RoomUpdate {
	pub fn is_empty(&self) -> bool {
		self.name.is_none() && self.description.is_none() && self.max_users.is_none() && self.is_private.is_none()
	}
}

/// A named channel with a member list and an ordered message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Capacity hint; joins are not rejected when it is exceeded.
	pub max_users: u32,
	pub created_at: UnixMillis,
	pub created_by: UserId,
	pub is_private: bool,
	pub members: Vec<UserId>,
	pub messages: Vec<Message>,
}

impl Room {
	pub fn has_member(&self, user_id: &UserId) -> bool {
		self.members.iter().any(|m| m == user_id)
	}

	/// Returns true when the member was added.
	pub fn add_member(&mut self, user_id: &UserId) -> bool {
		if self.has_member(user_id) {
			return false;
		}
		self.members.push(user_id.clone());
		true
	}

	/// Returns true when the member was present.
	pub fn remove_member(&mut self, user_id: &UserId) -> bool {
		let before = self.members.len();
		self.members.retain(|m| m != user_id);
		self.members.len() != before
	}

	pub fn message_position(&self, id: &MessageId) -> Option<usize> {
		self.messages.iter().position(|m| &m.id == id)
	}

	pub fn is_created_by(&self, user_id: &UserId) -> bool {
		&self.created_by == user_id
	}

	/// Shallow-merge the set fields of `update`.
	pub fn apply_update(&mut self, update: &RoomUpdate) {
		if let Some(name) = &update.name {
			self.name = name.clone();
		}
		if let Some(description) = &update.description {
			self.description = Some(description.clone());
		}
		if let Some(max_users) = update.max_users {
			self.max_users = max_users;
		}
		if let Some(is_private) = update.is_private {
			self.is_private = is_private;
		}
	}
}
