use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use trap_core::prelude::*;

use super::{read_some, HandlerCtx, HandlerResult};
use crate::types::Credentials;

// TPKT/X.224 Connection Confirm + RDP Negotiation Response.
const CONNECTION_CONFIRM: &[u8] =
	b"\x03\x00\x00\x13\x0e\xd0\x00\x00\x00\x00\x00\x02\x0f\x08\x00\x00\x00";
// X.224 Data TPDU carrying Server Security Data.
const SERVER_SECURITY: &[u8] = b"\x03\x00\x00\x0c\x02\xf0\x80\x04\x01\x00\x01\x00";
// Security Exchange nudge for clients that have not volunteered credentials.
const SECURITY_REQUEST: &[u8] = b"\x03\x00\x00\x0c\x02\xf0\x80\x04\x00\x01\x00\x00";
// X.224 Disconnect Request with an error code.
const DISCONNECT: &[u8] = b"\x03\x00\x00\x09\x02\xf0\x80\x21\x80";

const STATE_TTL: Duration = Duration::from_secs(300);
const MAX_USERNAME: usize = 50;
const MAX_PASSWORD: usize = 100;

static USER_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
	vec![
		Regex::new(r"(?i)USER(?:NAME)?=([^\x00\r\n& ]+)").expect("static regex"),
		Regex::new(r"(?i)Cookie:\s*mstshash=([^\x00\r\n& ]+)").expect("static regex"),
	]
});
static PASS_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
	vec![
		Regex::new(r"(?i)PASS(?:WORD)?=([^\x00\r\n& ]+)").expect("static regex"),
		Regex::new(r"(?i)PWD=([^\x00\r\n& ]+)").expect("static regex"),
	]
});
const AUTH_MARKERS: [&[u8]; 6] = [
	b"NTLM",
	b"Kerberos",
	b"CredSSP",
	b"SPNEGO",
	b"TLS_RSA",
	b"SSPI",
];

/// RDP negotiation prefix, just deep enough to coax credential material out
/// of clients that put it in the clear (connection cookies, legacy logon
/// fields). Encrypted clients yield nothing and are simply disconnected.
///
/// Remembers recent usernames per source IP so repeated probes from one
/// scanner only produce an event when something new appears.
pub struct RdpServer {
	states: Mutex<HashMap<IpAddr, IpState>>,
}

struct IpState {
	last_attempt: Instant,
	username: Option<String>,
	attempts: u32,
}

impl RdpServer {
	pub fn new() -> Self {
		RdpServer {
			states: Mutex::new(HashMap::new()),
		}
	}

	pub async fn serve<S>(&self, mut stream: S, ctx: &HandlerCtx) -> HandlerResult
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		let mut all = Vec::new();
		let mut buf = [0u8; 8192];

		// Connection request first; a silent probe gets nothing back.
		match read_some(&mut stream, ctx, &mut buf, ctx.cfg.base_read_timeout).await {
			Ok(Some(n)) => all.extend_from_slice(&buf[..n]),
			_ => return Ok(None),
		}
		if all.len() >= 4 && all[0] == 0x03 && all[1] == 0x00 {
			stream.write_all(CONNECTION_CONFIRM).await?;
			stream.write_all(SERVER_SECURITY).await?;
			if let Ok(Some(n)) =
				read_some(&mut stream, ctx, &mut buf, Duration::from_millis(1000)).await
			{
				all.extend_from_slice(&buf[..n]);
			}
		}

		let (mut username, mut password) = extract_credentials(&all);

		if password.is_none() {
			// Nudge the client through a security exchange, with escalating
			// patience; many tools only emit credentials at this stage.
			let _ = stream.write_all(SECURITY_REQUEST).await;
			for millis in [500u64, 1000, 1500] {
				match read_some(&mut stream, ctx, &mut buf, Duration::from_millis(millis)).await {
					Ok(Some(n)) => {
						all.extend_from_slice(&buf[..n]);
						let (u, p) = extract_credentials(&all);
						if u.is_some() {
							username = u;
						}
						if p.is_some() {
							password = p;
							break;
						}
					},
					Ok(None) => continue,
					Err(_) => break,
				}
			}
		}

		let result = self.note_and_filter(ctx.client_ip, username, password);
		let _ = stream.write_all(DISCONNECT).await;
		self.expire_states();
		Ok(result)
	}

	/// Only produce an event for a decoded username, and only when it is new
	/// for this IP or finally accompanied by a password.
	fn note_and_filter(
		&self,
		ip: IpAddr,
		username: Option<String>,
		password: Option<String>,
	) -> Option<Credentials> {
		let username = username?;
		let password = password.unwrap_or_default();
		let mut states = self.states.lock().unwrap();
		let state = states.entry(ip).or_insert(IpState {
			last_attempt: Instant::now(),
			username: None,
			attempts: 0,
		});
		state.last_attempt = Instant::now();
		state.attempts += 1;
		if state.username.as_deref() == Some(username.as_str()) && password.is_empty() {
			debug!(client = %ip, attempts = state.attempts, "repeat RDP probe, nothing new");
			return None;
		}
		state.username = Some(username.clone());
		Some(Credentials::new(username, password))
	}

	fn expire_states(&self) {
		let mut states = self.states.lock().unwrap();
		states.retain(|_, s| s.last_attempt.elapsed() < STATE_TTL);
	}
}

impl Default for RdpServer {
	fn default() -> Self {
		Self::new()
	}
}

/// Scans handshake bytes for credential markers in both ASCII and
/// UTF-16-LE renderings.
fn extract_credentials(data: &[u8]) -> (Option<String>, Option<String>) {
	for marker in AUTH_MARKERS {
		if data.windows(marker.len()).any(|w| w == marker) {
			debug!(
				marker = %String::from_utf8_lossy(marker),
				"security provider marker in RDP handshake"
			);
			break;
		}
	}

	let ascii = String::from_utf8_lossy(data).into_owned();
	let utf16: String = {
		let units: Vec<u16> = data
			.chunks_exact(2)
			.map(|c| u16::from_le_bytes([c[0], c[1]]))
			.collect();
		String::from_utf16_lossy(&units)
	};

	let mut username = None;
	let mut password = None;
	for text in [&ascii, &utf16] {
		if username.is_none() {
			username = first_match(&USER_RES, text, MAX_USERNAME);
		}
		if password.is_none() {
			password = first_match(&PASS_RES, text, MAX_PASSWORD);
		}
	}
	(username, password)
}

fn first_match(res: &[Regex], text: &str, max_len: usize) -> Option<String> {
	for re in res {
		if let Some(caps) = re.captures(text) {
			let value = caps[1].trim().to_string();
			if plausible(&value, max_len) {
				return Some(value);
			}
		}
	}
	None
}

/// Filters out hex dumps and escape soup that the loose patterns would
/// otherwise pick up from binary negotiation data.
fn plausible(value: &str, max_len: usize) -> bool {
	!value.is_empty()
		&& value.len() < max_len
		&& !value.starts_with("0x")
		&& !value.starts_with("\\x")
		&& !value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::super::testutil::ctx;
	use super::*;

	fn utf16le(s: &str) -> Vec<u8> {
		s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
	}

	#[test]
	fn extracts_mstshash_cookie() {
		let data = b"\x03\x00\x00\x2aCookie: mstshash=WIN-ADMIN\r\n\x01\x02";
		let (user, pass) = extract_credentials(data);
		assert_eq!(user.as_deref(), Some("WIN-ADMIN"));
		assert!(pass.is_none());
	}

	#[test]
	fn extracts_ascii_user_and_password_with_terminators() {
		let data = b"junkUSER=bob&PASSWORD=hunter2 morejunk";
		let (user, pass) = extract_credentials(data);
		assert_eq!(user.as_deref(), Some("bob"));
		assert_eq!(pass.as_deref(), Some("hunter2"));
	}

	#[test]
	fn extracts_utf16le_password() {
		let data = utf16le("Password=Tr0ub4dor\0");
		let (_, pass) = extract_credentials(&data);
		assert_eq!(pass.as_deref(), Some("Tr0ub4dor"));
	}

	#[test]
	fn rejects_hex_and_escape_noise() {
		let (user, _) = extract_credentials(b"USERNAME=deadbeef ");
		assert!(user.is_none(), "pure hex must be rejected");
		let (_, pass) = extract_credentials(b"PWD=0x41414141 ");
		assert!(pass.is_none(), "0x-prefixed must be rejected");
		let long = format!("USER={} ", "a".repeat(80));
		let (user, _) = extract_credentials(long.as_bytes());
		assert!(user.is_none(), "overlong must be rejected");
	}

	#[tokio::test]
	async fn handshake_captures_cookie_and_disconnects() {
		let server = RdpServer::new();
		let ctx = ctx();
		let (mut client, stream) = tokio::io::duplex(16384);
		client
			.write_all(b"\x03\x00\x00\x2a\x02\xf0\x80Cookie: mstshash=scanner7\r\n")
			.await
			.unwrap();
		client.shutdown().await.unwrap();
		let collect = tokio::spawn(async move {
			let mut out = Vec::new();
			let mut buf = [0u8; 1024];
			loop {
				match client.read(&mut buf).await {
					Ok(0) | Err(_) => break,
					Ok(n) => out.extend_from_slice(&buf[..n]),
				}
			}
			out
		});
		let result = server.serve(stream, &ctx).await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "scanner7");
		assert_eq!(creds.password, "");
		let out = collect.await.unwrap();
		assert!(out.starts_with(CONNECTION_CONFIRM));
		assert!(out
			.windows(DISCONNECT.len())
			.any(|w| w == DISCONNECT));
	}

	#[tokio::test]
	async fn repeat_probe_from_same_ip_is_deduplicated() {
		let server = RdpServer::new();
		let ctx = ctx();
		for expect_event in [true, false] {
			let (mut client, stream) = tokio::io::duplex(16384);
			client
				.write_all(b"\x03\x00\x00\x20Cookie: mstshash=repeat\r\n")
				.await
				.unwrap();
			client.shutdown().await.unwrap();
			let result = server.serve(stream, &ctx).await.unwrap();
			assert_eq!(result.is_some(), expect_event);
		}
	}

	#[tokio::test]
	async fn silent_probe_produces_nothing() {
		let server = RdpServer::new();
		let ctx = ctx();
		let (client, stream) = tokio::io::duplex(1024);
		drop(client);
		let result = server.serve(stream, &ctx).await.unwrap();
		assert!(result.is_none());
	}
}
