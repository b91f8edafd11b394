#![forbid(unsafe_code)]

pub mod codec;
pub mod events;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode, decode_command, decode_event, encode, encode_default};
pub use events::{
	AuthenticatePayload, ClientCommand, CommandRejected, CreateRoomPayload, EditMessagePayload, MessageDeleted,
	MessageRead, MessageRef, RoomRef, SendMessagePayload, ServerEvent, UpdateRoomPayload, UpdateStatusPayload,
	UserJoinedRoom, UserLeftRoom,
};
