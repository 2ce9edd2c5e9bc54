use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;

use crate::capture::CapturePipeline;
use crate::config::Config;
use crate::geo::GeoResolver;
use crate::metrics::{Metrics, ProtocolLabels};
use crate::monitor::SystemMonitor;
use crate::proto::{self, HandlerCtx, Handlers, ProtocolDescriptor};
use crate::scheduler::ConnectionScheduler;
use crate::types::Protocol;

const TCP_BACKLOG: i32 = 1024;
const MAX_DATAGRAM: usize = 65535;

/// Binds one accept loop per protocol descriptor and hands accepted
/// connections to the scheduler. Binding is fatal-at-startup: a port we
/// cannot claim propagates and the process exits nonzero.
pub struct Listeners {
	pub cfg: Arc<Config>,
	pub scheduler: ConnectionScheduler,
	pub capture: Arc<CapturePipeline>,
	pub geo: GeoResolver,
	pub handlers: Arc<Handlers>,
	pub monitor: SystemMonitor,
	pub metrics: Arc<Metrics>,
}

impl Listeners {
	pub async fn bind_and_run(
		self: Arc<Self>,
		token: CancellationToken,
	) -> anyhow::Result<JoinSet<()>> {
		let mut js = JoinSet::new();
		for desc in proto::registry() {
			let addr = SocketAddr::new(self.cfg.host, self.cfg.ports.for_protocol(desc.protocol));
			let listener = bind_tcp(addr)
				.with_context(|| format!("bind {} listener on {addr}", desc.protocol))?;
			info!(protocol = %desc.protocol, %addr, "honeypot listening");
			self.monitor.mark_running(desc.protocol, true);
			js.spawn(accept_loop(
				self.clone(),
				desc,
				listener,
				token.child_token(),
			));
			if desc.udp {
				let udp = UdpSocket::bind(addr)
					.await
					.with_context(|| format!("bind {} datagram socket on {addr}", desc.protocol))?;
				info!(protocol = %desc.protocol, %addr, "honeypot listening (udp)");
				js.spawn(udp_loop(self.clone(), desc, udp, token.child_token()));
			}
		}
		Ok(js)
	}
}

fn bind_tcp(addr: SocketAddr) -> anyhow::Result<TcpListener> {
	let domain = Domain::for_address(addr);
	let socket = Socket::new(domain, Type::STREAM, None)?;
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(TCP_BACKLOG)?;
	socket.set_nonblocking(true)?;
	Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(
	listeners: Arc<Listeners>,
	desc: ProtocolDescriptor,
	listener: TcpListener,
	token: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = token.cancelled() => {
				info!(protocol = %desc.protocol, "listener stopping");
				listeners.monitor.mark_running(desc.protocol, false);
				return;
			}
			res = listener.accept() => match res {
				Ok((stream, peer)) => handle_accept(&listeners, desc.protocol, stream, peer),
				Err(e) => {
					error!(protocol = %desc.protocol, err = %e, "accept error");
					tokio::time::sleep(Duration::from_millis(100)).await;
				},
			}
		}
	}
}

fn handle_accept(
	listeners: &Arc<Listeners>,
	protocol: Protocol,
	stream: TcpStream,
	peer: SocketAddr,
) {
	let ip = peer.ip();
	debug!(protocol = %protocol, client = %ip, "connection accepted");
	listeners
		.metrics
		.downstream_connections
		.get_or_create(&ProtocolLabels::from(protocol))
		.inc();
	// Warm the geolocation cache while the handler runs.
	listeners.geo.prefetch(ip);

	let ctx = HandlerCtx {
		client_ip: ip,
		touch: listeners.scheduler.toucher(ip),
		cfg: listeners.cfg.proto,
	};
	let handlers = listeners.handlers.clone();
	let capture = listeners.capture.clone();
	let work = async move {
		handlers.drive(protocol, stream, ctx, capture).await;
	};
	if !listeners.scheduler.admit(ip, work) {
		// `work` (and the socket inside it) was dropped: transport closed.
		listeners
			.metrics
			.rejected_connections
			.get_or_create(&ProtocolLabels::from(protocol))
			.inc();
	}
}

async fn udp_loop(
	listeners: Arc<Listeners>,
	desc: ProtocolDescriptor,
	socket: UdpSocket,
	token: CancellationToken,
) {
	let socket = Arc::new(socket);
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		let (n, peer) = tokio::select! {
			_ = token.cancelled() => {
				info!(protocol = %desc.protocol, "datagram listener stopping");
				return;
			}
			res = socket.recv_from(&mut buf) => match res {
				Ok(r) => r,
				Err(e) => {
					error!(protocol = %desc.protocol, err = %e, "datagram receive error");
					tokio::time::sleep(Duration::from_millis(100)).await;
					continue;
				},
			}
		};
		let ip = peer.ip();
		listeners
			.metrics
			.downstream_connections
			.get_or_create(&ProtocolLabels::from(desc.protocol))
			.inc();
		listeners.geo.prefetch(ip);

		let data = buf[..n].to_vec();
		let socket = socket.clone();
		let capture = listeners.capture.clone();
		let protocol = desc.protocol;
		let work = async move {
			let (creds, response) = crate::proto::sip::process_message(&data);
			if let Some(response) = response {
				if let Err(e) = socket.send_to(response.as_bytes(), peer).await {
					debug!(client = %ip, err = %e, "failed to send datagram response");
				}
			}
			if let Some(creds) = creds {
				capture.record(protocol, creds, ip).await;
			}
		};
		if !listeners.scheduler.admit(ip, work) {
			warn!(protocol = %desc.protocol, client = %ip, "datagram dropped: admission refused");
			listeners
				.metrics
				.rejected_connections
				.get_or_create(&ProtocolLabels::from(desc.protocol))
				.inc();
		}
	}
}
