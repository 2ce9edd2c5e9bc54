use bytes::BytesMut;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HandlerCtx, HandlerError, HandlerResult};
use crate::types::Credentials;

const MAX_MESSAGE: usize = 16 * 1024;

static AUTH_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"(?is)Authorization:\s*Digest\s+username\s*=\s*"([^"]+)".*?response\s*=\s*"([^"]+)""#)
		.expect("static regex")
});
static FROM_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)From:\s*<?sip:([^@>\s]+)@").expect("static regex"));
static URI_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)^(REGISTER|INVITE)\s+sip:([^@\s;>]+)@").expect("static regex"));
static VIA_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)Via:\s*([^\r\n]*)").expect("static regex"));
static FROM_HDR_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)From:\s*([^\r\n]*)").expect("static regex"));
static TO_HDR_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)To:\s*([^\r\n]*)").expect("static regex"));
static CALL_ID_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)Call-ID:\s*([^\r\n]*)").expect("static regex"));
static CSEQ_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?i)CSeq:\s*([^\r\n]*)").expect("static regex"));

/// TCP path: one SIP request, complete through the blank line, then a
/// response and disconnect.
pub async fn serve<S>(mut stream: S, ctx: &HandlerCtx) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let message = read_message(&mut stream, ctx).await?;
	if message.is_empty() {
		return Ok(None);
	}
	let (creds, response) = process_message(&message);
	if let Some(response) = response {
		stream.write_all(response.as_bytes()).await?;
	}
	Ok(creds)
}

/// Shared by TCP and UDP: extract credentials by priority (Authorization
/// digest, then From header, then request URI for REGISTER/INVITE) and
/// build the method-appropriate response.
pub fn process_message(data: &[u8]) -> (Option<Credentials>, Option<String>) {
	let message = String::from_utf8_lossy(data);
	let first_line = message.lines().next().unwrap_or_default().trim();
	let method = first_line
		.split_whitespace()
		.next()
		.unwrap_or_default()
		.to_ascii_uppercase();

	let creds = extract_credentials(&message);

	let response = match method.as_str() {
		"REGISTER" | "INVITE" => Some(unauthorized(&message)),
		"BYE" | "CANCEL" => Some(ok(&message, false)),
		"OPTIONS" => Some(ok(&message, true)),
		// No response for ACK or anything we do not recognize.
		_ => None,
	};
	(creds, response)
}

fn extract_credentials(message: &str) -> Option<Credentials> {
	if let Some(caps) = AUTH_RE.captures(message) {
		return Some(Credentials::new(&caps[1], &caps[2]));
	}
	if let Some(caps) = FROM_RE.captures(message) {
		return Some(Credentials::new(&caps[1], "[FROM_HEADER]"));
	}
	if let Some(caps) = URI_RE.captures(message) {
		return Some(Credentials::new(&caps[2], "[URI]"));
	}
	None
}

fn unauthorized(message: &str) -> String {
	format!(
		"SIP/2.0 401 Unauthorized\r\n\
		{}\
		WWW-Authenticate: Digest realm=\"asterisk\", nonce=\"{}\", algorithm=MD5\r\n\
		Content-Length: 0\r\n\r\n",
		echoed_headers(message),
		generate_nonce(),
	)
}

fn ok(message: &str, with_allow: bool) -> String {
	let allow = if with_allow {
		"Allow: INVITE, ACK, CANCEL, BYE, NOTIFY, REFER, MESSAGE, OPTIONS, INFO, SUBSCRIBE, UPDATE\r\n"
	} else {
		""
	};
	format!(
		"SIP/2.0 200 OK\r\n{}{}Content-Length: 0\r\n\r\n",
		echoed_headers(message),
		allow,
	)
}

/// Via, From, To, Call-ID and CSeq are echoed verbatim from the request.
fn echoed_headers(message: &str) -> String {
	let grab = |re: &Regex| {
		re.captures(message)
			.map(|c| c[1].trim().to_string())
			.unwrap_or_default()
	};
	format!(
		"Via: {}\r\nFrom: {}\r\nTo: {}\r\nCall-ID: {}\r\nCSeq: {}\r\n",
		grab(&VIA_RE),
		grab(&FROM_HDR_RE),
		grab(&TO_HDR_RE),
		grab(&CALL_ID_RE),
		grab(&CSEQ_RE),
	)
}

fn generate_nonce() -> String {
	let mut bytes = [0u8; 16];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}

async fn read_message<S: AsyncRead + Unpin>(
	stream: &mut S,
	ctx: &HandlerCtx,
) -> Result<Vec<u8>, HandlerError> {
	let mut buf = BytesMut::with_capacity(1024);
	loop {
		if find_blank_line(&buf).is_some() {
			return Ok(buf.to_vec());
		}
		if buf.len() > MAX_MESSAGE {
			return Err(HandlerError::Protocol("message too long".to_string()));
		}
		let mut chunk = [0u8; 1024];
		let n = match tokio::time::timeout(
			ctx.cfg.extended_read_timeout,
			stream.read(&mut chunk),
		)
		.await
		{
			Err(_) => return Ok(buf.to_vec()),
			Ok(r) => r?,
		};
		if n == 0 {
			return Ok(buf.to_vec());
		}
		ctx.activity();
		buf.extend_from_slice(&chunk[..n]);
	}
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n").or_else(|| {
		buf.windows(2).position(|w| w == b"\n\n")
	})
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::super::testutil::ctx;
	use super::*;

	const REGISTER: &str = "REGISTER sip:2000@honeypot SIP/2.0\r\n\
		Via: SIP/2.0/UDP 1.2.3.4\r\n\
		From: <sip:2000@x>\r\n\
		To: <sip:2000@x>\r\n\
		Call-ID: abc\r\n\
		CSeq: 1 REGISTER\r\n\r\n";

	#[test]
	fn register_with_from_header_prefers_from() {
		let (creds, response) = process_message(REGISTER.as_bytes());
		let creds = creds.unwrap();
		assert_eq!(creds.username, "2000");
		assert_eq!(creds.password, "[FROM_HEADER]");
		let response = response.unwrap();
		assert!(response.starts_with("SIP/2.0 401 Unauthorized\r\n"));
		assert!(response.contains("Via: SIP/2.0/UDP 1.2.3.4\r\n"));
		assert!(response.contains("From: <sip:2000@x>\r\n"));
		assert!(response.contains("To: <sip:2000@x>\r\n"));
		assert!(response.contains("Call-ID: abc\r\n"));
		assert!(response.contains("CSeq: 1 REGISTER\r\n"));
		assert!(response.contains("WWW-Authenticate: Digest realm="));
		assert!(response.contains("algorithm=MD5"));
	}

	#[test]
	fn register_uri_fallback() {
		let msg = "REGISTER sip:alice@example SIP/2.0\r\nVia: SIP/2.0/TCP h\r\n\r\n";
		let (creds, _) = process_message(msg.as_bytes());
		let creds = creds.unwrap();
		assert_eq!(creds.username, "alice");
		assert_eq!(creds.password, "[URI]");
	}

	#[test]
	fn from_header_beats_uri() {
		let msg = "REGISTER sip:alice@example SIP/2.0\r\nFrom: <sip:bob@x>\r\n\r\n";
		let (creds, _) = process_message(msg.as_bytes());
		let creds = creds.unwrap();
		assert_eq!(creds.username, "bob");
		assert_eq!(creds.password, "[FROM_HEADER]");
	}

	#[test]
	fn authorization_digest_beats_everything() {
		let msg = "REGISTER sip:alice@example SIP/2.0\r\n\
			From: <sip:bob@x>\r\n\
			Authorization: Digest username=\"bob\", realm=\"r\", nonce=\"n\", response=\"abc\"\r\n\r\n";
		let (creds, _) = process_message(msg.as_bytes());
		let creds = creds.unwrap();
		assert_eq!(creds.username, "bob");
		assert_eq!(creds.password, "abc");
	}

	#[test]
	fn nonce_is_fresh_per_response() {
		let (_, a) = process_message(REGISTER.as_bytes());
		let (_, b) = process_message(REGISTER.as_bytes());
		let nonce = |s: &str| {
			let start = s.find("nonce=\"").unwrap() + 7;
			s[start..start + 32].to_string()
		};
		assert_ne!(nonce(&a.unwrap()), nonce(&b.unwrap()));
	}

	#[test]
	fn bye_and_options_get_200_ack_gets_nothing() {
		let bye = "BYE sip:x@y SIP/2.0\r\nCSeq: 2 BYE\r\n\r\n";
		let (_, response) = process_message(bye.as_bytes());
		assert!(response.unwrap().starts_with("SIP/2.0 200 OK\r\n"));

		let options = "OPTIONS sip:x@y SIP/2.0\r\n\r\n";
		let (_, response) = process_message(options.as_bytes());
		assert!(response.unwrap().contains("Allow: INVITE, ACK"));

		let ack = "ACK sip:x@y SIP/2.0\r\n\r\n";
		let (_, response) = process_message(ack.as_bytes());
		assert!(response.is_none());
	}

	#[test]
	fn garbage_yields_nothing() {
		let (creds, response) = process_message(b"\x01\x02\x03 not sip at all");
		assert!(creds.is_none());
		assert!(response.is_none());
	}

	#[tokio::test]
	async fn tcp_path_reads_through_blank_line() {
		let (mut client, server) = tokio::io::duplex(8192);
		let ctx = ctx();
		client.write_all(REGISTER.as_bytes()).await.unwrap();
		let handle = tokio::spawn(async move {
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
		let result = serve(server, &ctx).await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "2000");
		let out = handle.await.unwrap();
		assert!(String::from_utf8_lossy(&out).starts_with("SIP/2.0 401 Unauthorized"));
	}
}
