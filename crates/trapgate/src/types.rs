use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The protocols we emulate. The serialized token doubles as the value of
/// the `protocol` column in the event store and the tag on observer frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Ssh,
	Telnet,
	Ftp,
	Smtp,
	Rdp,
	Sip,
	Mysql,
}

impl Protocol {
	pub const ALL: [Protocol; 7] = [
		Protocol::Ssh,
		Protocol::Telnet,
		Protocol::Ftp,
		Protocol::Smtp,
		Protocol::Rdp,
		Protocol::Sip,
		Protocol::Mysql,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::Ssh => "ssh",
			Protocol::Telnet => "telnet",
			Protocol::Ftp => "ftp",
			Protocol::Smtp => "smtp",
			Protocol::Rdp => "rdp",
			Protocol::Sip => "sip",
			Protocol::Mysql => "mysql",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Protocol {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ssh" => Ok(Protocol::Ssh),
			"telnet" => Ok(Protocol::Telnet),
			"ftp" => Ok(Protocol::Ftp),
			"smtp" => Ok(Protocol::Smtp),
			"rdp" => Ok(Protocol::Rdp),
			"sip" => Ok(Protocol::Sip),
			"mysql" => Ok(Protocol::Mysql),
			other => anyhow::bail!("unknown protocol token {other:?}"),
		}
	}
}

/// A username/password pair as submitted by the peer. For SIP and MySQL the
/// password slot may hold a digest or a marker such as `[Password Null]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

impl Credentials {
	pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
		Credentials {
			username: username.into(),
			password: password.into(),
		}
	}
}

pub const MAX_USERNAME_LEN: usize = 256;
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Resolved geolocation for an attacker IP. Presence of a `Location` always
/// implies valid coordinates; the textual fields are best-effort.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
	pub latitude: f64,
	pub longitude: f64,
	pub country: Option<String>,
	pub city: Option<String>,
	pub region: Option<String>,
}

/// One captured credential attempt, as persisted and broadcast. `id` is
/// assigned by the store; an attempt that failed to persist is still
/// broadcast with `id` unset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attempt {
	pub id: Option<i64>,
	pub protocol: Protocol,
	pub username: String,
	pub password: String,
	pub client_ip: String,
	pub timestamp: DateTime<Utc>,
	pub latitude: Option<f64>,
	pub longitude: Option<f64>,
	pub country: Option<String>,
	pub city: Option<String>,
	pub region: Option<String>,
}

impl Attempt {
	pub fn new(
		protocol: Protocol,
		creds: Credentials,
		client_ip: String,
		location: Option<Location>,
	) -> Self {
		let mut username = creds.username;
		let mut password = creds.password;
		truncate_lossy(&mut username, MAX_USERNAME_LEN);
		truncate_lossy(&mut password, MAX_PASSWORD_LEN);
		let (latitude, longitude, country, city, region) = match location {
			Some(loc) => (
				Some(loc.latitude),
				Some(loc.longitude),
				loc.country,
				loc.city,
				loc.region,
			),
			None => (None, None, None, None, None),
		};
		Attempt {
			id: None,
			protocol,
			username,
			password,
			client_ip,
			timestamp: Utc::now(),
			latitude,
			longitude,
			country,
			city,
			region,
		}
	}
}

/// Caps `s` at `max` bytes without splitting a character;
/// `String::truncate` panics on a non-boundary index.
fn truncate_lossy(s: &mut String, max: usize) {
	if s.len() <= max {
		return;
	}
	let mut end = max;
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	s.truncate(end);
}
