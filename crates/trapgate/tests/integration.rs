use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use trapgate::capture::CapturePipeline;
use trapgate::config::ProtoConfig;
use trapgate::geo::GeoResolver;
use trapgate::hub::{Hub, Outbound, ServerFrame};
use trapgate::metrics::Metrics;
use trapgate::proto::{HandlerCtx, Handlers};
use trapgate::scheduler::{ConnectionScheduler, SchedulerConfig};
use trapgate::store::EventStore;
use trapgate::types::{Credentials, Protocol};

struct Harness {
	scheduler: ConnectionScheduler,
	store: EventStore,
	hub: Hub,
	capture: Arc<CapturePipeline>,
	_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
	let dir = tempfile::tempdir().unwrap();
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	// Unroutable upstream; all test clients are loopback anyway, which the
	// resolver rejects without any I/O.
	let geo = GeoResolver::with_upstream(
		dir.path().join("geolocation_cache.json"),
		"http://127.0.0.1:1/json".to_string(),
	)
	.unwrap();
	let store = EventStore::connect(&dir.path().join("honeypot.db"))
		.await
		.unwrap();
	let hub = Hub::new(metrics.clone());
	let scheduler = ConnectionScheduler::new(SchedulerConfig {
		max_workers: 8,
		max_per_ip: 5,
		idle_timeout: Duration::from_secs(2),
		queue_cap: 8,
		drain_grace: Duration::from_secs(1),
	});
	let capture = Arc::new(CapturePipeline::new(
		scheduler.clone(),
		geo,
		store.clone(),
		hub.clone(),
		metrics,
	));
	Harness {
		scheduler,
		store,
		hub,
		capture,
		_dir: dir,
	}
}

fn expect_login_attempt(out: Outbound) -> trapgate::types::Attempt {
	match out {
		Outbound::Frame(f) => match &*f {
			ServerFrame::LoginAttempt(attempt) => attempt.clone(),
			other => panic!("expected login_attempt, got {other:?}"),
		},
		Outbound::Probe => panic!("unexpected probe"),
	}
}

#[tokio::test]
async fn capture_persists_and_broadcasts() {
	let h = harness().await;
	let mut observer = h.hub.subscribe("test-observer".into());

	let ip: IpAddr = "127.0.0.1".parse().unwrap();
	h.capture
		.record(Protocol::Ftp, Credentials::new("anonymous", "guest@"), ip)
		.await;

	// Persisted with a server-assigned id.
	let rows = h.store.query_all(None).await.unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].protocol, Protocol::Ftp);
	assert_eq!(rows[0].username, "anonymous");
	assert!(rows[0].id.is_some());
	// Loopback clients carry no geolocation.
	assert!(rows[0].latitude.is_none());

	// Broadcast carried the same attempt, id included.
	let attempt = expect_login_attempt(observer.rx.recv().await.unwrap());
	assert_eq!(attempt.username, "anonymous");
	assert_eq!(attempt.id, rows[0].id);
}

#[tokio::test]
async fn store_failure_does_not_suppress_broadcast() {
	let h = harness().await;
	let mut observer = h.hub.subscribe("test-observer".into());

	// Close the pool out from under the pipeline; appends now fail.
	h.store.close().await;

	let ip: IpAddr = "127.0.0.1".parse().unwrap();
	h.capture
		.record(Protocol::Telnet, Credentials::new("root", "toor"), ip)
		.await;

	let attempt = expect_login_attempt(observer.rx.recv().await.unwrap());
	assert_eq!(attempt.username, "root");
	assert!(attempt.id.is_none(), "unpersisted attempts broadcast with no id");
}

#[tokio::test]
async fn tcp_exchange_through_scheduler_lands_in_store() {
	let h = harness().await;
	let handlers = Arc::new(Handlers::new().unwrap());

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let client = tokio::spawn(async move {
		let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
		sock
			.write_all(b"USER anonymous\r\nPASS guest@\r\n")
			.await
			.unwrap();
		let mut out = Vec::new();
		let _ = sock.read_to_end(&mut out).await;
		String::from_utf8_lossy(&out).to_string()
	});

	let (stream, peer) = listener.accept().await.unwrap();
	let ip = peer.ip();
	let ctx = HandlerCtx {
		client_ip: ip,
		touch: h.scheduler.toucher(ip),
		cfg: ProtoConfig::default(),
	};
	let capture = h.capture.clone();
	assert!(h.scheduler.admit(ip, async move {
		handlers.drive(Protocol::Ftp, stream, ctx, capture).await;
	}));

	let out = client.await.unwrap();
	assert!(out.contains("331 Please specify the password."));
	assert!(out.contains("530 Login incorrect."));

	// The handler records after replying; give the pipeline a beat.
	tokio::time::sleep(Duration::from_millis(200)).await;
	let rows = h.store.query_all(None).await.unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].protocol, Protocol::Ftp);
	assert_eq!(rows[0].username, "anonymous");
	assert_eq!(rows[0].password, "guest@");
	assert_eq!(h.scheduler.live_connections(), 0);
}
