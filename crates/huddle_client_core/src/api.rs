#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use huddle_domain::{Room, User, UserId};
use huddle_util::endpoint::WsEndpoint;
use reqwest::StatusCode;
use serde::Serialize;

/// Client for the HTTP bootstrap surface served next to the websocket.
#[derive(Debug, Clone)]
pub struct ApiClient {
	base_url: String,
	client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RegisterUserRequest<'a> {
	username: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	avatar: Option<&'a str>,
}

impl ApiClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			client: reqwest::Client::new(),
		}
	}

	/// API on the same host and port as `endpoint`.
	pub fn for_endpoint(endpoint: &WsEndpoint) -> Self {
		Self::new(endpoint.http_base())
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url.trim_end_matches('/'), path)
	}

	pub async fn list_rooms(&self) -> anyhow::Result<Vec<Room>> {
		let resp = self.client.get(self.url("/api/rooms")).send().await.context("list rooms")?;
		match resp.status() {
			StatusCode::OK => resp.json().await.context("decode rooms"),
			status => Err(anyhow!("list rooms failed: status={}", status)),
		}
	}

	pub async fn list_users(&self) -> anyhow::Result<Vec<User>> {
		let resp = self.client.get(self.url("/api/users")).send().await.context("list users")?;
		match resp.status() {
			StatusCode::OK => resp.json().await.context("decode users"),
			status => Err(anyhow!("list users failed: status={}", status)),
		}
	}

	/// Create an online user; the server announces it with `userJoined`.
	pub async fn register_user(&self, username: &str, avatar: Option<&str>) -> anyhow::Result<User> {
		let body = RegisterUserRequest { username, avatar };
		let resp = self
			.client
			.post(self.url("/api/users"))
			.json(&body)
			.send()
			.await
			.context("register user")?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => resp.json().await.context("decode registered user"),
			status => {
				let detail = resp.text().await.unwrap_or_default();
				Err(anyhow!("register user failed: status={} {}", status, detail.trim()))
			}
		}
	}

	/// Returns false when the user did not exist.
	pub async fn remove_user(&self, user_id: &UserId) -> anyhow::Result<bool> {
		let resp = self
			.client
			.delete(self.url(&format!("/api/users/{}", user_id.as_str())))
			.send()
			.await
			.context("remove user")?;

		match resp.status() {
			StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
			StatusCode::NOT_FOUND => Ok(false),
			status => Err(anyhow!("remove user failed: status={}", status)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn urls_are_joined_without_double_slash() {
		let api = ApiClient::new("http://127.0.0.1:3001/");
		assert_eq!(api.url("/api/rooms"), "http://127.0.0.1:3001/api/rooms");

		let endpoint = WsEndpoint::parse("ws://[::1]:4000").unwrap();
		assert_eq!(ApiClient::for_endpoint(&endpoint).url("/api/users"), "http://[::1]:4000/api/users");
	}
}
