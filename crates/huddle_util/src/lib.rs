#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;

	/// Path the websocket upgrade is served on.
	pub const WS_PATH: &str = "/ws";

	const SCHEME: &str = "ws://";

	/// A `ws://host:port` server address. The websocket itself lives on
	/// [`WS_PATH`] and the bootstrap API on the same host and port.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "{SCHEME}{}:{}", self.host, self.port)
		}
	}

	impl WsEndpoint {
		pub fn authority(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		pub fn ws_url(&self) -> String {
			format!("{SCHEME}{}{WS_PATH}", self.authority())
		}

		pub fn http_base(&self) -> String {
			format!("http://{}", self.authority())
		}

		/// Only succeeds for IP literal hosts; names are never resolved here.
		pub fn socket_addr(&self) -> Result<SocketAddr, String> {
			self.authority()
				.parse()
				.map_err(|_| format!("expected an IP address, got host name {:?}", self.host))
		}

		/// Accepts exactly `ws://host:port`; IPv6 hosts must be bracketed.
		pub fn parse(input: &str) -> Result<Self, String> {
			let input = input.trim();
			let Some(authority) = input.strip_prefix(SCHEME) else {
				return Err(format!("endpoint must look like ws://host:port, got {input:?}"));
			};
			if authority.chars().any(|c| matches!(c, '/' | '?' | '#')) {
				return Err(format!("endpoint must not carry a path, query or fragment: {input:?}"));
			}

			let (host, port) = split_authority(authority).ok_or_else(|| format!("endpoint is missing a port: {input:?}"))?;
			let port = match port.parse::<u16>() {
				Ok(0) | Err(_) => return Err(format!("endpoint port must be within 1..=65535: {input:?}")),
				Ok(p) => p,
			};
			if host.is_empty() {
				return Err(format!("endpoint host is empty: {input:?}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	fn split_authority(authority: &str) -> Option<(&str, &str)> {
		if authority.starts_with('[') {
			let end = authority.find(']')?;
			let port = authority[end + 1..].strip_prefix(':')?;
			return Some((&authority[..=end], port));
		}
		let (host, port) = authority.split_once(':')?;
		// A second colon means an unbracketed IPv6 literal.
		if port.contains(':') {
			return None;
		}
		Some((host, port))
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn builds_urls_from_host_and_port() {
			let e = WsEndpoint::parse(" ws://chat.example.com:443 ").unwrap();
			assert_eq!(e.host, "chat.example.com");
			assert_eq!(e.ws_url(), "ws://chat.example.com:443/ws");
			assert_eq!(e.http_base(), "http://chat.example.com:443");
			assert_eq!(e.to_string(), "ws://chat.example.com:443");
			assert!(e.socket_addr().is_err());
		}

		#[test]
		fn ipv6_requires_brackets() {
			let e = WsEndpoint::parse("ws://[::1]:3001").unwrap();
			assert_eq!(e.socket_addr().unwrap().to_string(), "[::1]:3001");
			assert!(WsEndpoint::parse("ws://::1:3001").is_err());
			assert!(WsEndpoint::parse("ws://[::1]3001").is_err());
		}

		#[test]
		fn rejects_malformed_input() {
			for bad in [
				"",
				"http://127.0.0.1:3001",
				"ws://127.0.0.1:3001/ws",
				"ws://127.0.0.1:3001?x=y",
				"ws://127.0.0.1",
				"ws://127.0.0.1:0",
				"ws://127.0.0.1:70000",
				"ws://:3001",
			] {
				assert!(WsEndpoint::parse(bad).is_err(), "accepted {bad:?}");
			}
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::ZERO)
			.as_millis() as i64
	}
}
