// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;

/// Shutdown coordinates process termination from OS signals or an explicit
/// trigger (e.g. an admin endpoint or a fatal component error).
pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	/// Returns a handle that can request shutdown from anywhere in the process.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	/// Completes once shutdown has been requested, by signal or trigger.
	pub async fn wait(mut self) {
		imp::shutdown(&mut self.rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{signal, SignalKind};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {
				// A second Ctrl+C skips the graceful drain entirely.
				tokio::spawn(async move {
					watch_signal(SignalKind::interrupt(), "SIGINT").await;
					info!("second SIGINT, exiting immediately");
					process::exit(0);
				});
			}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => { info!("received explicit shutdown request") }
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal() => {}
			_ = receiver.recv() => { info!("received explicit shutdown request") }
		};
	}

	async fn watch_signal() {
		tokio::signal::windows::ctrl_c()
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received ctrl-c, starting shutdown");
	}
}
