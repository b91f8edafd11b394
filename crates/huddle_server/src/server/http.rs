#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use huddle_domain::UserId;
use huddle_util::endpoint::WS_PATH;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::hub::ChatHub;

const USERS_PATH: &str = "/api/users";
const ROOMS_PATH: &str = "/api/rooms";

/// Request bodies larger than this are refused.
const MAX_BODY_BYTES: usize = 64 * 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type HttpResponse = Response<Full<Bytes>>;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything a request handler needs.
#[derive(Clone)]
pub struct AppState {
	pub hub: ChatHub,
	pub health: HealthState,
	pub connection: ConnectionSettings,
}

#[derive(Debug, Deserialize)]
struct RegisterUserBody {
	username: String,
	#[serde(default)]
	avatar: Option<String>,
}

/// Accept HTTP/1.1 connections on `listener` until it fails. Websocket
/// upgrades on `/ws` and the bootstrap API share the listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = accept_with_backoff(|| listener.accept(), ACCEPT_RETRY_DELAY).await;

		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(%remote, error = %err, "http connection error");
			}
		});
	}
}

/// Retry `accept` until it yields a connection, pausing `delay` after each
/// failure so persistent errors (fd exhaustion) do not spin.
async fn accept_with_backoff<F, Fut, T, E>(mut accept: F, delay: Duration) -> T
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: std::fmt::Display,
{
	loop {
		match accept().await {
			Ok(accepted) => return accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(delay).await;
			}
		}
	}
}

async fn route(req: Request<Incoming>, state: AppState) -> Result<HttpResponse, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let res = match (&method, path.as_str()) {
		(&Method::GET, WS_PATH) => upgrade_websocket(req, state),
		(&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
		(&Method::GET, "/readyz") => {
			if state.health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(&Method::OPTIONS, p) if p.starts_with("/api/") => preflight(),
		(&Method::GET, ROOMS_PATH) => json(StatusCode::OK, &state.hub.list_rooms().await),
		(&Method::GET, USERS_PATH) => json(StatusCode::OK, &state.hub.list_users().await),
		(&Method::POST, USERS_PATH) => register_user(req, &state).await,
		(&Method::DELETE, p) if p.starts_with("/api/users/") => remove_user(&p["/api/users/".len()..], &state).await,
		_ => empty(StatusCode::NOT_FOUND),
	};

	debug!(%method, %path, status = res.status().as_u16(), "http request");
	if path.starts_with("/api/") {
		Ok(with_cors(res))
	} else {
		Ok(res)
	}
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|v| v.trim().eq_ignore_ascii_case(token))
}

fn upgrade_websocket(mut req: Request<Incoming>, state: AppState) -> HttpResponse {
	let headers = req.headers();
	if !header_has_token(headers, header::UPGRADE, "websocket") || !header_has_token(headers, header::CONNECTION, "upgrade") {
		return text(StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade");
	}

	let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY) else {
		return text(StatusCode::BAD_REQUEST, "missing sec-websocket-key");
	};
	let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
		return empty(StatusCode::INTERNAL_SERVER_ERROR);
	};

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				metrics::counter!("huddle_server_connections_total").increment(1);
				let ws_config = state.connection.websocket_config();
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(ws_config)).await;
				if let Err(e) = handle_connection(state.hub, ws, state.connection).await {
					warn!(error = %e, "connection handler exited with error");
				}
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut res = empty(StatusCode::SWITCHING_PROTOCOLS);
	let h = res.headers_mut();
	h.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
	h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	h.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	res
}

async fn register_user(req: Request<Incoming>, state: &AppState) -> HttpResponse {
	let body: RegisterUserBody = match read_json(req.into_body()).await {
		Ok(body) => body,
		Err(e) => return text(StatusCode::BAD_REQUEST, &e),
	};

	match state.hub.register_user(&body.username, body.avatar).await {
		Ok(user) => json(StatusCode::OK, &user),
		Err(e) => text(StatusCode::BAD_REQUEST, &e.to_string()),
	}
}

async fn remove_user(raw_id: &str, state: &AppState) -> HttpResponse {
	let Ok(user_id) = UserId::new(raw_id) else {
		return empty(StatusCode::NOT_FOUND);
	};

	if state.hub.remove_user(&user_id).await {
		info!(user_id = %user_id, "user removed via api");
		empty(StatusCode::NO_CONTENT)
	} else {
		empty(StatusCode::NOT_FOUND)
	}
}

async fn read_json<T: DeserializeOwned>(body: Incoming) -> Result<T, String> {
	let bytes = Limited::new(body, MAX_BODY_BYTES)
		.collect()
		.await
		.map_err(|e| format!("read body: {e}"))?
		.to_bytes();
	serde_json::from_slice(&bytes).map_err(|e| format!("invalid json: {e}"))
}

fn with_cors(mut res: HttpResponse) -> HttpResponse {
	res.headers_mut()
		.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
	res
}

fn preflight() -> HttpResponse {
	let mut res = empty(StatusCode::NO_CONTENT);
	let h = res.headers_mut();
	h.insert(
		header::ACCESS_CONTROL_ALLOW_METHODS,
		HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
	);
	h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("content-type"));
	res
}

fn empty(status: StatusCode) -> HttpResponse {
	let mut res = Response::new(Full::new(Bytes::new()));
	*res.status_mut() = status;
	res
}

fn text(status: StatusCode, body: &str) -> HttpResponse {
	let mut res = Response::new(Full::new(Bytes::from(body.to_string())));
	*res.status_mut() = status;
	res.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
	res
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> HttpResponse {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut res = Response::new(Full::new(Bytes::from(body)));
			*res.status_mut() = status;
			res.headers_mut()
				.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
			res
		}
		Err(e) => {
			warn!(error = %e, "failed to serialize response body");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io;
	use std::time::Instant;

	use super::*;

	#[tokio::test]
	async fn accept_errors_back_off_before_retrying() {
		let mut failures_left = 3;
		let started = Instant::now();

		let accepted = accept_with_backoff(
			|| {
				let outcome = if failures_left > 0 {
					failures_left -= 1;
					Err(io::Error::other("too many open files"))
				} else {
					Ok("conn")
				};
				std::future::ready(outcome)
			},
			Duration::from_millis(20),
		)
		.await;

		assert_eq!(accepted, "conn");
		assert_eq!(failures_left, 0);
		assert!(started.elapsed() >= Duration::from_millis(60), "retried without pausing");
	}
}
