#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use huddle_client_core::{
	ApiClient, ClientConfig, ConnectionManager, DEFAULT_SERVER_ENDPOINT, EventBus, MirrorAction, StateMirror, events,
};
use huddle_domain::RoomId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_client [--connect ws://host:port] [--api http://host:port] [--username name] [--room id]...\n\
\n\
Options:\n\
	--connect   Server endpoint (alias: --endpoint) (default: ws://127.0.0.1:3001)\n\
	            Format: ws://host:port\n\
	--api       Bootstrap API base URL (default: derived from --connect)\n\
	--username  Name to register with (default: cli-<pid>)\n\
	--room      Room to join (repeatable; default: general)\n\
	--help      Show this help\n\
\n\
Lines typed on stdin are sent to the first room.\n\
\n\
Examples:\n\
	huddle_client --connect ws://127.0.0.1:3001 --username alice --room general\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: ClientConfig,
	api: Option<String>,
	username: String,
	rooms: Vec<RoomId>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT.to_string();
	let mut api = None;
	let mut username = format!("cli-{}", std::process::id());
	let mut rooms: Vec<RoomId> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--api" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--api must be non-empty");
					usage_and_exit();
				}
				api = Some(v);
			}
			"--username" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--username must be non-empty");
					usage_and_exit();
				}
				username = v.trim().to_string();
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let room = RoomId::new(v.trim()).unwrap_or_else(|e| {
					eprintln!("Invalid --room value: {v} ({e})");
					usage_and_exit()
				});
				rooms.push(room);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let cfg = ClientConfig::from_ws_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit();
	});

	if rooms.is_empty() {
		rooms.extend(RoomId::new("general").ok());
	}

	Args {
		cfg,
		api,
		username,
		rooms,
	}
}

fn print_events(bus: &EventBus) {
	bus.on::<events::MessageReceived, _>(|m| println!("[{}] {}: {}", m.room_id, m.sender.username, m.content));
	bus.on::<events::MessageUpdated, _>(|m| {
		println!("[{}] {} (edited): {}", m.room_id, m.sender.username, m.content)
	});
	bus.on::<events::UserJoinedRoom, _>(|ev| println!("[{}] * {} joined", ev.room_id, ev.user.username));
	bus.on::<events::UserLeftRoom, _>(|ev| println!("[{}] * {} left", ev.room_id, ev.user_id));
	bus.on::<events::UserStatusChanged, _>(|u| println!("* {} is {}", u.username, u.status));
	bus.on::<events::CommandRejected, _>(|r| println!("! {} rejected: {}", r.command, r.reason));
	bus.on::<events::Reconnecting, _>(|s| {
		eprintln!(
			"* reconnecting (attempt {}, retry in {} ms)",
			s.attempt, s.next_retry_in_ms
		)
	});
	bus.on::<events::ReconnectError, _>(|_| eprintln!("* could not reconnect; giving up"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let api = match &args.api {
		Some(base) => ApiClient::new(base.clone()),
		None => ApiClient::for_endpoint(&args.cfg.endpoint),
	};

	let me = api
		.register_user(&args.username, None)
		.await
		.context("register with bootstrap api")?;
	info!(user_id = %me.id, username = %me.username, "registered");

	let bus = Arc::new(EventBus::new());
	let mirror = StateMirror::new();
	mirror.attach(&bus);
	mirror.dispatch(MirrorAction::SetCurrentUser(me.clone()));

	match api.list_rooms().await {
		Ok(rooms) => {
			mirror.dispatch(MirrorAction::RoomsLoaded(rooms));
		}
		Err(e) => warn!(error = %e, "failed to load rooms"),
	}
	match api.list_users().await {
		Ok(users) => {
			mirror.dispatch(MirrorAction::UsersLoaded(users));
		}
		Err(e) => warn!(error = %e, "failed to load users"),
	}
	mirror.dispatch(MirrorAction::SetCurrentRoom(args.rooms.first().cloned()));

	print_events(&bus);

	let manager = ConnectionManager::spawn(args.cfg.clone(), bus.clone());
	manager.authenticate(me.id.clone(), "").await?;
	for room in &args.rooms {
		manager.join_room(room.clone()).await?;
	}
	manager.connect().await?;

	let Some(target) = args.rooms.first().cloned() else {
		return Ok(());
	};
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			line = lines.next_line() => {
				match line.context("read stdin")? {
					Some(line) if !line.trim().is_empty() => manager.send_text(target.clone(), line).await?,
					Some(_) => {}
					None => break,
				}
			}
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested");
				break;
			}
		}
	}

	manager.disconnect().await?;
	let state = mirror.snapshot();
	info!(
		rooms = state.rooms.len(),
		users = state.users.len(),
		"session ended"
	);
	Ok(())
}
