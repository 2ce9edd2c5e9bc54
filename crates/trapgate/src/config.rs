use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use trap_core::telemetry::RollingConfig;

use crate::scheduler::SchedulerConfig;
use crate::types::Protocol;

/// Process configuration, sourced from the environment with defaults.
/// Constructed once at startup and injected; nothing reads the environment
/// after this point.
#[derive(Clone, Debug)]
pub struct Config {
	pub host: IpAddr,
	pub ports: Ports,
	pub scheduler: SchedulerConfig,
	pub proto: ProtoConfig,
	pub database_path: PathBuf,
	pub geo_cache_file: PathBuf,
	pub log_level: String,
	pub log_file: RollingConfig,
}

#[derive(Clone, Copy, Debug)]
pub struct Ports {
	pub ssh: u16,
	pub telnet: u16,
	pub ftp: u16,
	pub smtp: u16,
	pub rdp: u16,
	pub sip: u16,
	pub mysql: u16,
	/// Observer listener: WebSocket fan-out, metrics, health.
	pub web: u16,
}

impl Ports {
	pub fn for_protocol(&self, protocol: Protocol) -> u16 {
		match protocol {
			Protocol::Ssh => self.ssh,
			Protocol::Telnet => self.telnet,
			Protocol::Ftp => self.ftp,
			Protocol::Smtp => self.smtp,
			Protocol::Rdp => self.rdp,
			Protocol::Sip => self.sip,
			Protocol::Mysql => self.mysql,
		}
	}
}

/// Timeouts and limits shared by all protocol handlers.
#[derive(Clone, Copy, Debug)]
pub struct ProtoConfig {
	/// Read timeout during protocol negotiation.
	pub base_read_timeout: Duration,
	/// Read timeout while awaiting interactive input (prompts).
	pub extended_read_timeout: Duration,
	/// Maximum accepted line length; longer lines are treated as disconnect.
	pub max_line: usize,
}

impl Default for ProtoConfig {
	fn default() -> Self {
		ProtoConfig {
			base_read_timeout: Duration::from_secs(5),
			extended_read_timeout: Duration::from_secs(15),
			max_line: 4096,
		}
	}
}

impl Config {
	pub fn from_env() -> anyhow::Result<Config> {
		let base_dir = parse_default("BASE_DIR", PathBuf::from("."))?;
		let host = parse_default("HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;

		let ports = Ports {
			ssh: parse_default("SSH_PORT", 22)?,
			telnet: parse_default("TELNET_PORT", 23)?,
			ftp: parse_default("FTP_PORT", 21)?,
			smtp: parse_default("SMTP_PORT", 25)?,
			rdp: parse_default("RDP_PORT", 3389)?,
			sip: parse_default("SIP_PORT", 5060)?,
			mysql: parse_default("MYSQL_PORT", 3306)?,
			web: parse_default("WEB_PORT", 8080)?,
		};

		let scheduler = SchedulerConfig {
			max_workers: parse_default("MAX_THREADS", 50)?,
			max_per_ip: parse_default("MAX_CONNECTIONS_PER_IP", 5)?,
			idle_timeout: Duration::from_secs(parse_default("CONNECTION_TIMEOUT", 15)?),
			queue_cap: parse_default("MAX_QUEUED_CONNECTIONS", 100)?,
			drain_grace: Duration::from_secs(5),
		};

		let database_path = match parse::<String>("DATABASE_URL")? {
			Some(url) => PathBuf::from(url.trim_start_matches("sqlite://")),
			None => base_dir.join("honeypot.db"),
		};

		let log_file = RollingConfig {
			path: parse_default("LOG_FILE", base_dir.join("honeypot.log"))?,
			..Default::default()
		};

		Ok(Config {
			host,
			ports,
			scheduler,
			proto: ProtoConfig::default(),
			database_path,
			geo_cache_file: parse_default("GEO_CACHE_FILE", base_dir.join("geolocation_cache.json"))?,
			log_level: parse_default("LOG_LEVEL", "info".to_string()).map(|l| l.to_lowercase())?,
			log_file,
		})
	}
}

fn parse<T: FromStr>(field: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(field) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.with_context(|| format!("invalid value for {field}: {val}")),
		_ => Ok(None),
	}
}

fn parse_default<T: FromStr>(field: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	Ok(parse(field)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		// Scoped to keys this test does not set; from_env reads the live
		// environment, so only assert on defaults.
		let cfg = Config::from_env().unwrap();
		assert_eq!(cfg.scheduler.max_per_ip, 5);
		assert_eq!(cfg.scheduler.max_workers, 50);
		assert_eq!(cfg.scheduler.idle_timeout, Duration::from_secs(15));
		assert_eq!(cfg.ports.for_protocol(Protocol::Rdp), 3389);
		assert_eq!(cfg.proto.max_line, 4096);
	}
}
