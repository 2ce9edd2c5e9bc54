use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use trap_core::prelude::*;
use trap_core::readiness::Ready;

use crate::hub::{ClientFrame, Hub, Outbound, ServerFrame};
use crate::monitor::SystemMonitor;
use crate::store::EventStore;

const METRICS_PUSH_INTERVAL: Duration = Duration::from_secs(5);

/// The observer endpoint: WebSocket fan-out at `/ws`, prometheus export at
/// `/metrics`, readiness at `/healthz`.
#[derive(Clone)]
pub struct App {
	hub: Hub,
	store: EventStore,
	monitor: SystemMonitor,
	registry: Arc<Registry>,
	ready: Ready,
}

impl App {
	pub fn new(
		hub: Hub,
		store: EventStore,
		monitor: SystemMonitor,
		registry: Arc<Registry>,
		ready: Ready,
	) -> Self {
		App {
			hub,
			store,
			monitor,
			registry,
			ready,
		}
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/ws", get(ws_handler))
			.route("/metrics", get(metrics_handler))
			.route("/healthz", get(healthz_handler))
			.with_state(self.clone())
	}
}

async fn ws_handler(
	State(app): State<App>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| serve_socket(app, addr, socket))
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}

async fn healthz_handler(State(app): State<App>) -> Response {
	if app.ready.is_ready() {
		(StatusCode::OK, "ok").into_response()
	} else {
		let pending = app
			.ready
			.pending()
			.into_iter()
			.collect::<Vec<_>>()
			.join(", ");
		(StatusCode::SERVICE_UNAVAILABLE, format!("pending: {pending}")).into_response()
	}
}

async fn serve_socket(app: App, addr: SocketAddr, socket: WebSocket) {
	info!(observer = %addr, "new observer connection");
	let handle = app.hub.subscribe(addr.to_string());
	let id = handle.id;
	let mut rx = handle.rx;
	let (mut sink, mut stream) = socket.split();

	// Writer: the subscriber's channel is the only path to the socket, which
	// preserves per-subscriber frame order.
	let writer_hub = app.hub.clone();
	let writer = tokio::spawn(async move {
		while let Some(out) = rx.recv().await {
			let msg = match out {
				Outbound::Frame(frame) => match serde_json::to_string(&*frame) {
					Ok(json) => Message::Text(json.into()),
					Err(e) => {
						warn!(id, err = %e, "failed to serialize frame");
						continue;
					},
				},
				Outbound::Probe => Message::Ping(Bytes::new()),
			};
			if sink.send(msg).await.is_err() {
				break;
			}
			writer_hub.note_sent(id);
		}
		let _ = sink.close().await;
	});

	let pusher = tokio::spawn(periodic_updates(app.clone(), id));

	while let Some(msg) = stream.next().await {
		let msg = match msg {
			Ok(m) => m,
			Err(e) => {
				debug!(observer = %addr, err = %e, "observer read error");
				break;
			},
		};
		app.hub.mark_received(id);
		match msg {
			Message::Text(text) => handle_frame(&app, id, text.as_str()).await,
			// Pongs answer our liveness probes; activity already recorded.
			Message::Pong(_) | Message::Ping(_) | Message::Binary(_) => {},
			Message::Close(_) => break,
		}
	}

	pusher.abort();
	app.hub.disconnect(id);
	writer.abort();
	info!(observer = %addr, "observer connection closed");
}

async fn handle_frame(app: &App, id: u64, text: &str) {
	let frame: ClientFrame = match serde_json::from_str(text) {
		Ok(f) => f,
		Err(e) => {
			warn!(id, err = %e, "ignoring unparseable observer frame");
			return;
		},
	};
	match frame {
		ClientFrame::RequestAttempts => match app.store.query_all(None).await {
			Ok(attempts) => {
				app
					.hub
					.send_frame(id, ServerFrame::InitialAttempts(attempts))
					.await;
			},
			Err(e) => error!(id, err = %e, "failed to load attempts for observer"),
		},
		ClientFrame::RequestDataBatches => {
			let app = app.clone();
			tokio::spawn(async move {
				match app.store.query_all(None).await {
					Ok(attempts) => app.hub.send_backfill(id, attempts).await,
					Err(e) => {
						error!(id, err = %e, "failed to load attempts for backfill");
						let _ = app
							.hub
							.send_frame(
								id,
								ServerFrame::BatchError {
									error: e.to_string(),
									message: "error occurred during batch data transmission".to_string(),
								},
							)
							.await;
					},
				}
			});
		},
		ClientFrame::RequestMissingBatches { batch_numbers } => {
			let app = app.clone();
			tokio::spawn(async move {
				match app.store.query_all(None).await {
					Ok(attempts) => app.hub.resend_batches(id, attempts, batch_numbers).await,
					Err(e) => error!(id, err = %e, "failed to load attempts for batch resend"),
				}
			});
		},
		ClientFrame::BatchAck { batch_number } => {
			debug!(id, batch_number, "observer acknowledged batch");
		},
		ClientFrame::Heartbeat => {
			app
				.hub
				.send_frame(
					id,
					ServerFrame::HeartbeatResponse {
						timestamp: Utc::now(),
					},
				)
				.await;
		},
		ClientFrame::Ping => {
			app
				.hub
				.send_frame(
					id,
					ServerFrame::Pong {
						timestamp: Utc::now(),
					},
				)
				.await;
		},
		ClientFrame::RequestSystemMetrics => {
			let metrics = app.monitor.system_metrics();
			app
				.hub
				.send_frame(id, ServerFrame::SystemMetrics(metrics))
				.await;
			let status = app.monitor.service_status();
			app
				.hub
				.send_frame(id, ServerFrame::ServiceStatus(status))
				.await;
		},
		ClientFrame::RequestExternalIp => {
			let ip = app.monitor.external_ip().await;
			app.hub.send_frame(id, ServerFrame::ExternalIp { ip }).await;
		},
	}
}

/// Pushes system metrics every 5 s, service status every 10 s, and a server
/// heartbeat every 30 s, until the subscriber goes away.
async fn periodic_updates(app: App, id: u64) {
	let mut tick = tokio::time::interval(METRICS_PUSH_INTERVAL);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	// The first tick fires immediately; skip it so pushes start after one
	// interval like the request-driven path expects.
	tick.tick().await;
	let mut n: u64 = 0;
	loop {
		tick.tick().await;
		n += 1;
		let metrics = app.monitor.system_metrics();
		if !app
			.hub
			.send_frame(id, ServerFrame::SystemMetrics(metrics))
			.await
		{
			return;
		}
		if n % 2 == 0 {
			let status = app.monitor.service_status();
			app
				.hub
				.send_frame(id, ServerFrame::ServiceStatus(status))
				.await;
		}
		if n % 6 == 0 {
			let uptime = app
				.hub
				.connection_uptime(id)
				.unwrap_or_default()
				.as_secs_f64();
			app
				.hub
				.send_frame(
					id,
					ServerFrame::ServerHeartbeat {
						timestamp: Utc::now(),
						uptime,
					},
				)
				.await;
		}
	}
}
