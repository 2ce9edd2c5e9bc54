use std::collections::HashMap;

use serde::Serialize;
use sysinfo::System;
use trap_core::prelude::*;
use trap_core::telemetry::APPLICATION_START_TIME;

use crate::config::Ports;
use crate::types::Protocol;

const EXTERNAL_IP_TTL: Duration = Duration::from_secs(3600);
const MEMORY_PRESSURE_THRESHOLD: f32 = 0.85;

#[derive(Clone, Debug, Serialize)]
pub struct ServiceState {
	pub port: u16,
	pub running: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemMetrics {
	pub cpu: CpuMetrics,
	pub memory: MemoryMetrics,
	pub load: [f64; 3],
	pub uptime: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CpuMetrics {
	pub percent: f32,
	pub count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemoryMetrics {
	pub total: u64,
	pub used: u64,
	pub available: u64,
	pub percent: f32,
}

/// Process and host statistics backing the observer `system_metrics`,
/// `service_status` and `external_ip` frames, plus the memory-pressure
/// signal that accelerates hub cleanup.
#[derive(Clone)]
pub struct SystemMonitor {
	inner: Arc<MonitorInner>,
}

struct MonitorInner {
	system: Mutex<System>,
	client: reqwest::Client,
	external_ip: Mutex<Option<(String, Instant)>>,
	services: Mutex<HashMap<Protocol, ServiceState>>,
}

impl SystemMonitor {
	pub fn new(ports: &Ports) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(5))
			.build()
			.context("build monitor client")?;
		let services = Protocol::ALL
			.iter()
			.map(|p| {
				(
					*p,
					ServiceState {
						port: ports.for_protocol(*p),
						running: false,
					},
				)
			})
			.collect();
		Ok(SystemMonitor {
			inner: Arc::new(MonitorInner {
				system: Mutex::new(System::new()),
				client,
				external_ip: Mutex::new(None),
				services: Mutex::new(services),
			}),
		})
	}

	pub fn mark_running(&self, protocol: Protocol, running: bool) {
		if let Some(state) = self.inner.services.lock().unwrap().get_mut(&protocol) {
			state.running = running;
		}
	}

	pub fn service_status(&self) -> HashMap<String, ServiceState> {
		self
			.inner
			.services
			.lock()
			.unwrap()
			.iter()
			.map(|(p, s)| (p.as_str().to_string(), s.clone()))
			.collect()
	}

	pub fn system_metrics(&self) -> SystemMetrics {
		let mut sys = self.inner.system.lock().unwrap();
		sys.refresh_cpu_usage();
		sys.refresh_memory();
		let total = sys.total_memory();
		let used = sys.used_memory();
		let load = System::load_average();
		SystemMetrics {
			cpu: CpuMetrics {
				percent: sys.global_cpu_usage(),
				count: sys.cpus().len(),
			},
			memory: MemoryMetrics {
				total,
				used,
				available: sys.available_memory(),
				percent: if total > 0 {
					used as f32 / total as f32 * 100.0
				} else {
					0.0
				},
			},
			load: [load.one, load.five, load.fifteen],
			uptime: APPLICATION_START_TIME.elapsed().as_secs(),
		}
	}

	/// True when host memory usage is high enough that the hub should clean
	/// up subscribers more aggressively.
	pub fn memory_pressure(&self) -> bool {
		let mut sys = self.inner.system.lock().unwrap();
		sys.refresh_memory();
		let total = sys.total_memory();
		total > 0 && sys.used_memory() as f32 / total as f32 > MEMORY_PRESSURE_THRESHOLD
	}

	/// The host's external address, fetched over HTTPS and cached for an
	/// hour. Returns "unknown" when the upstream is unreachable.
	pub async fn external_ip(&self) -> String {
		{
			let cached = self.inner.external_ip.lock().unwrap();
			if let Some((ip, at)) = cached.as_ref() {
				if at.elapsed() < EXTERNAL_IP_TTL {
					return ip.clone();
				}
			}
		}
		match self.fetch_external_ip().await {
			Some(ip) => {
				*self.inner.external_ip.lock().unwrap() = Some((ip.clone(), Instant::now()));
				ip
			},
			None => "unknown".to_string(),
		}
	}

	async fn fetch_external_ip(&self) -> Option<String> {
		let resp = match self
			.inner
			.client
			.get("https://api.ipify.org")
			.send()
			.await
		{
			Ok(r) => r,
			Err(e) => {
				warn!(err = %e, "failed to fetch external IP");
				return None;
			},
		};
		match resp.text().await {
			Ok(body) => {
				let ip = body.trim().to_string();
				ip.parse::<IpAddr>().ok().map(|_| ip)
			},
			Err(e) => {
				warn!(err = %e, "failed to read external IP response");
				None
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Ports;

	fn ports() -> Ports {
		Ports {
			ssh: 22,
			telnet: 23,
			ftp: 21,
			smtp: 25,
			rdp: 3389,
			sip: 5060,
			mysql: 3306,
			web: 8080,
		}
	}

	#[test]
	fn tracks_service_state() {
		let m = SystemMonitor::new(&ports()).unwrap();
		let status = m.service_status();
		assert_eq!(status.len(), 7);
		assert!(!status["ssh"].running);
		assert_eq!(status["rdp"].port, 3389);

		m.mark_running(Protocol::Ssh, true);
		assert!(m.service_status()["ssh"].running);
	}

	#[test]
	fn metrics_have_sane_shape() {
		let m = SystemMonitor::new(&ports()).unwrap();
		let metrics = m.system_metrics();
		assert!(metrics.memory.total > 0);
		assert!(metrics.memory.percent >= 0.0 && metrics.memory.percent <= 100.0);
	}
}
