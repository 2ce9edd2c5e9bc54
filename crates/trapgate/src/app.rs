use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;
use trap_core::{readiness, signal};

use crate::capture::CapturePipeline;
use crate::config::Config;
use crate::geo::GeoResolver;
use crate::hub::{ws, Hub};
use crate::listener::Listeners;
use crate::metrics::Metrics;
use crate::monitor::SystemMonitor;
use crate::proto::Handlers;
use crate::scheduler::ConnectionScheduler;
use crate::store::EventStore;

/// Constructs every component, binds all listeners and the observer
/// endpoint, and returns a handle that drives the shutdown cascade.
pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let token = CancellationToken::new();
	let ready = readiness::Ready::new();
	let boot = ready.register_task("listeners");

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(trap_core::metrics::sub_registry(&mut registry)));

	let geo = GeoResolver::new(cfg.geo_cache_file.clone())?;
	let store = EventStore::connect(&cfg.database_path)
		.await
		.context("open event store")?;
	tokio::spawn(store.clone().supervise(token.child_token()));

	let monitor = SystemMonitor::new(&cfg.ports)?;
	let hub = Hub::new(metrics.clone());
	tokio::spawn(
		hub
			.clone()
			.run_cleanup(monitor.clone(), token.child_token()),
	);

	let scheduler = ConnectionScheduler::new(cfg.scheduler.clone());
	let capture = Arc::new(CapturePipeline::new(
		scheduler.clone(),
		geo.clone(),
		store.clone(),
		hub.clone(),
		metrics.clone(),
	));
	let handlers = Arc::new(Handlers::new()?);

	let listeners = Arc::new(Listeners {
		cfg: cfg.clone(),
		scheduler: scheduler.clone(),
		capture,
		geo: geo.clone(),
		handlers,
		monitor: monitor.clone(),
		metrics,
	});
	let listener_tasks = listeners.bind_and_run(token.child_token()).await?;

	// Observer endpoint: WebSocket fan-out, metrics and health.
	let ws_app = ws::App::new(
		hub.clone(),
		store.clone(),
		monitor,
		Arc::new(registry),
		ready.clone(),
	);
	let web_addr = SocketAddr::new(cfg.host, cfg.ports.web);
	let web_listener = tokio::net::TcpListener::bind(web_addr)
		.await
		.with_context(|| format!("bind observer endpoint on {web_addr}"))?;
	info!(%web_addr, "observer endpoint listening");
	let web_token = token.child_token();
	tokio::spawn(async move {
		let svc = ws_app
			.router()
			.into_make_service_with_connect_info::<SocketAddr>();
		let serve = axum::serve(web_listener, svc)
			.with_graceful_shutdown(async move { web_token.cancelled().await });
		if let Err(e) = serve.await {
			error!(err = %e, "observer endpoint serving error");
		}
	});

	drop(boot);
	Ok(Bound {
		shutdown,
		token,
		scheduler,
		hub,
		geo,
		store,
		listener_tasks,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	token: CancellationToken,
	scheduler: ConnectionScheduler,
	hub: Hub,
	geo: GeoResolver,
	store: EventStore,
	listener_tasks: JoinSet<()>,
}

impl Bound {
	/// Waits for a shutdown signal and then runs the cascade: stop
	/// admissions and cancel live records, stop listeners, close observer
	/// connections, flush the geolocation cache, close the store.
	pub async fn wait_termination(mut self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		info!("shutdown starting");

		self.scheduler.shutdown().await;
		self.token.cancel();
		while self.listener_tasks.join_next().await.is_some() {}
		self.hub.close_all();
		self.geo.shutdown().await;
		self.store.close().await;

		info!("shutdown complete");
		Ok(())
	}
}
