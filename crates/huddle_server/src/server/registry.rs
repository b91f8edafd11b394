#![forbid(unsafe_code)]

use std::collections::HashMap;

use huddle_domain::UserId;
use huddle_protocol::ServerEvent;
use tokio::sync::mpsc;

/// Server-assigned connection id, unique for the process lifetime.
pub type ConnId = u64;

#[derive(Debug)]
struct ConnEntry {
	tx: mpsc::Sender<ServerEvent>,
	user: Option<UserId>,
}

/// Live connections and the user identity each one authenticated as.
///
/// At most one connection is the current binding for a user; the last
/// `bind` wins. An evicted connection keeps its socket open and still knows
/// which user it authenticated as, but no longer receives user-scoped fan-out.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	conns: HashMap<ConnId, ConnEntry>,
	by_user: HashMap<UserId, ConnId>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, conn_id: ConnId, tx: mpsc::Sender<ServerEvent>) {
		self.conns.insert(conn_id, ConnEntry { tx, user: None });
	}

	/// Bind `user_id` to `conn_id`. Returns the previously bound connection
	/// when a different one is evicted.
	pub fn bind(&mut self, user_id: &UserId, conn_id: ConnId) -> Option<ConnId> {
		let entry = self.conns.get_mut(&conn_id)?;

		// Re-authenticating as someone else releases the old identity.
		if let Some(prev_user) = entry.user.replace(user_id.clone())
			&& &prev_user != user_id
			&& self.by_user.get(&prev_user) == Some(&conn_id)
		{
			self.by_user.remove(&prev_user);
		}

		match self.by_user.insert(user_id.clone(), conn_id) {
			Some(prev) if prev != conn_id => Some(prev),
			_ => None,
		}
	}

	/// Remove a connection. Returns the user only when this connection was
	/// that user's current binding.
	pub fn unbind(&mut self, conn_id: ConnId) -> Option<UserId> {
		let entry = self.conns.remove(&conn_id)?;
		let user = entry.user?;

		if self.by_user.get(&user) == Some(&conn_id) {
			self.by_user.remove(&user);
			Some(user)
		} else {
			None
		}
	}

	/// Identity the connection authenticated as.
	pub fn user_for(&self, conn_id: ConnId) -> Option<&UserId> {
		self.conns.get(&conn_id).and_then(|e| e.user.as_ref())
	}

	/// Current connection bound to `user_id`.
	pub fn conn_for(&self, user_id: &UserId) -> Option<ConnId> {
		self.by_user.get(user_id).copied()
	}

	pub fn sender(&self, conn_id: ConnId) -> Option<&mpsc::Sender<ServerEvent>> {
		self.conns.get(&conn_id).map(|e| &e.tx)
	}

	pub fn senders(&self) -> impl Iterator<Item = (ConnId, &mpsc::Sender<ServerEvent>)> {
		self.conns.iter().map(|(id, e)| (*id, &e.tx))
	}

	pub fn len(&self) -> usize {
		self.conns.len()
	}

	pub fn is_empty(&self) -> bool {
		self.conns.is_empty()
	}
}
