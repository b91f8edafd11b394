#![forbid(unsafe_code)]

use huddle_domain::{RoomId, UserId};
use huddle_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::registry::{ConnId, ConnectionRegistry};

/// Who an outbound event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
	Connection(ConnId),
	/// Connections currently bound to `members`. The member list is captured
	/// when the event is produced.
	Room {
		room_id: RoomId,
		members: Vec<UserId>,
	},
	All,
}

/// An event paired with its audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
	pub audience: Audience,
	pub event: ServerEvent,
}

impl Outbound {
	pub fn to_connection(conn_id: ConnId, event: ServerEvent) -> Self {
		Self {
			audience: Audience::Connection(conn_id),
			event,
		}
	}

	pub fn to_room(room_id: RoomId, members: Vec<UserId>, event: ServerEvent) -> Self {
		Self {
			audience: Audience::Room { room_id, members },
			event,
		}
	}

	pub fn to_all(event: ServerEvent) -> Self {
		Self {
			audience: Audience::All,
			event,
		}
	}
}

/// Non-blocking fan-out over the connection registry.
///
/// A full or closed outbound queue drops the event for that connection only.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastRouter<'a> {
	registry: &'a ConnectionRegistry,
}

impl<'a> BroadcastRouter<'a> {
	pub fn new(registry: &'a ConnectionRegistry) -> Self {
		Self { registry }
	}

	pub fn deliver(&self, outbound: Outbound) -> usize {
		match outbound.audience {
			Audience::Connection(conn_id) => usize::from(self.to_connection(conn_id, outbound.event)),
			Audience::Room { room_id, members } => self.to_room(&room_id, &members, outbound.event),
			Audience::All => self.to_all(outbound.event),
		}
	}

	/// Returns true when the event was queued.
	pub fn to_connection(&self, conn_id: ConnId, event: ServerEvent) -> bool {
		let Some(tx) = self.registry.sender(conn_id) else {
			return false;
		};
		try_deliver(conn_id, tx, event)
	}

	/// Returns the number of connections the event was queued for.
	pub fn to_room(&self, room_id: &RoomId, members: &[UserId], event: ServerEvent) -> usize {
		let mut delivered = 0;
		for member in members {
			let Some(conn_id) = self.registry.conn_for(member) else {
				continue;
			};
			if self.to_connection(conn_id, event.clone()) {
				delivered += 1;
			}
		}

		debug!(room_id = %room_id, event = event.name(), delivered, "room fan-out");
		delivered
	}

	pub fn to_all(&self, event: ServerEvent) -> usize {
		self.registry
			.senders()
			.filter(|(conn_id, tx)| try_deliver(*conn_id, tx, event.clone()))
			.count()
	}
}

fn try_deliver(conn_id: ConnId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
	let name = event.name();
	match tx.try_send(event) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("huddle_server_events_dropped_total", "reason" => "full").increment(1);
			debug!(conn_id, event = name, "outbound queue full; event dropped");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => {
			metrics::counter!("huddle_server_events_dropped_total", "reason" => "closed").increment(1);
			false
		}
	}
}
