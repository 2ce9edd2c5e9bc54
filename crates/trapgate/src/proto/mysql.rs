use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HandlerCtx, HandlerError, HandlerResult};
use crate::types::Credentials;

const PROTOCOL_VERSION: u8 = 10;
const SERVER_VERSION: &[u8] = b"8.0.32";
const AUTH_PLUGIN: &[u8] = b"caching_sha2_password";
const ERR_ACCESS_DENIED: u16 = 1045;
const MAX_PACKET: usize = 64 * 1024;
/// Marker recorded when the client sent no password material.
const PASSWORD_NULL: &str = "[Password Null]";

/// MySQL protocol v10 emulation: send the server greeting, read the
/// client's handshake response, pull the username and credential blob out
/// of it, and reply with an access-denied error packet.
pub async fn serve<S>(mut stream: S, ctx: &HandlerCtx) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	send_handshake(&mut stream).await?;

	let payload = match read_packet(&mut stream, ctx).await? {
		Some(p) => p,
		None => return Ok(None), // port scanner; never spoke
	};
	let parsed = parse_auth_packet(&payload)?;

	send_error_packet(&mut stream, "Access denied for user").await?;

	match parsed {
		Some(creds) => Ok(Some(creds)),
		None => Ok(None),
	}
}

async fn send_handshake<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<(), HandlerError> {
	let (mut salt, connection_id) = {
		let mut rng = rand::rng();
		let mut salt = [0u8; 20];
		rng.fill(&mut salt);
		let connection_id: u32 = rng.random();
		(salt, connection_id)
	};
	for b in &mut salt {
		// The salt is a NUL-free string on the wire.
		if *b == 0 {
			*b = 0x5a;
		}
	}

	let mut payload = Vec::with_capacity(64);
	payload.push(PROTOCOL_VERSION);
	payload.extend_from_slice(SERVER_VERSION);
	payload.push(0);
	payload.extend_from_slice(&connection_id.to_le_bytes());
	payload.extend_from_slice(&salt[..8]);
	payload.push(0); // filler
	payload.extend_from_slice(&salt[8..]);
	payload.extend_from_slice(AUTH_PLUGIN);
	payload.push(0);

	write_packet(stream, 0, &payload).await
}

async fn send_error_packet<S: AsyncWrite + Unpin>(
	stream: &mut S,
	message: &str,
) -> Result<(), HandlerError> {
	let mut payload = Vec::with_capacity(message.len() + 9);
	payload.push(0xff);
	payload.extend_from_slice(&ERR_ACCESS_DENIED.to_le_bytes());
	payload.push(b'#');
	payload.extend_from_slice(b"28000");
	payload.extend_from_slice(message.as_bytes());
	write_packet(stream, 1, &payload).await
}

/// Frame: 3-byte little-endian length, 1-byte sequence id, payload.
async fn write_packet<S: AsyncWrite + Unpin>(
	stream: &mut S,
	seq: u8,
	payload: &[u8],
) -> Result<(), HandlerError> {
	let len = payload.len();
	let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
	stream.write_all(&header).await?;
	stream.write_all(payload).await?;
	Ok(())
}

async fn read_packet<S: AsyncRead + Unpin>(
	stream: &mut S,
	ctx: &HandlerCtx,
) -> Result<Option<Vec<u8>>, HandlerError> {
	let mut header = [0u8; 4];
	match tokio::time::timeout(ctx.cfg.base_read_timeout, stream.read_exact(&mut header)).await {
		Err(_) => return Ok(None),
		Ok(Err(_)) => return Ok(None),
		Ok(Ok(_)) => {},
	}
	ctx.activity();
	let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
	if len == 0 || len > MAX_PACKET {
		return Err(HandlerError::Protocol(format!(
			"implausible packet length {len}"
		)));
	}
	let mut payload = vec![0u8; len];
	tokio::time::timeout(ctx.cfg.base_read_timeout, stream.read_exact(&mut payload))
		.await
		.map_err(|_| HandlerError::Timeout)??;
	ctx.activity();
	Ok(Some(payload))
}

/// Client handshake response: 4 bytes capabilities, 4 bytes max packet
/// size, 1 byte charset, 23 reserved bytes, then NUL-terminated username,
/// NUL-terminated auth plugin, and the credential blob as the remainder.
fn parse_auth_packet(payload: &[u8]) -> Result<Option<Credentials>, HandlerError> {
	if payload.len() < 33 {
		return Err(HandlerError::Protocol("auth packet too short".to_string()));
	}
	let mut pos = 32;
	let username = read_cstring(payload, &mut pos);
	let plugin = read_cstring(payload, &mut pos);
	let blob = &payload[pos.min(payload.len())..];

	if username.is_empty() {
		return Ok(None);
	}

	let password = if blob.is_empty()
		|| blob == plugin.as_bytes()
		|| blob == AUTH_PLUGIN
	{
		PASSWORD_NULL.to_string()
	} else {
		String::from_utf8_lossy(blob).into_owned()
	};
	Ok(Some(Credentials::new(username, password)))
}

fn read_cstring(data: &[u8], pos: &mut usize) -> String {
	let start = *pos;
	while *pos < data.len() && data[*pos] != 0 {
		*pos += 1;
	}
	let s = String::from_utf8_lossy(&data[start..*pos]).into_owned();
	if *pos < data.len() {
		*pos += 1; // skip the NUL
	}
	s
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::super::testutil::ctx;
	use super::*;

	fn auth_packet(user: &[u8], plugin: &[u8], blob: &[u8]) -> Vec<u8> {
		let mut p = Vec::new();
		p.extend_from_slice(&0x0aff_u32.to_le_bytes()); // capabilities
		p.extend_from_slice(&16_777_216_u32.to_le_bytes()); // max packet
		p.push(0x21); // charset
		p.extend_from_slice(&[0u8; 23]);
		p.extend_from_slice(user);
		p.push(0);
		p.extend_from_slice(plugin);
		p.push(0);
		p.extend_from_slice(blob);
		p
	}

	fn framed(seq: u8, payload: &[u8]) -> Vec<u8> {
		let len = payload.len();
		let mut out = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
		out.extend_from_slice(payload);
		out
	}

	async fn exchange(auth: &[u8]) -> (HandlerResult, Vec<u8>) {
		let (mut client, server) = tokio::io::duplex(8192);
		let ctx = ctx();
		client.write_all(auth).await.unwrap();
		client.shutdown().await.unwrap();
		let result = serve(server, &ctx).await;
		let mut out = Vec::new();
		let _ = client.read_to_end(&mut out).await;
		(result, out)
	}

	#[tokio::test]
	async fn captures_username_and_blob() {
		let auth = framed(1, &auth_packet(b"root", b"mysql_native_password", b"hunter2"));
		let (result, out) = exchange(&auth).await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "root");
		assert_eq!(creds.password, "hunter2");

		// Handshake packet: sequence 0, protocol version 10, our server
		// version string and plugin name.
		assert_eq!(out[3], 0);
		assert_eq!(out[4], PROTOCOL_VERSION);
		let handshake_len = out[0] as usize | (out[1] as usize) << 8 | (out[2] as usize) << 16;
		let handshake = &out[4..4 + handshake_len];
		assert!(handshake.windows(SERVER_VERSION.len()).any(|w| w == SERVER_VERSION));
		assert!(handshake.windows(AUTH_PLUGIN.len()).any(|w| w == AUTH_PLUGIN));

		// Error packet: marker 0xff, code 1045 little-endian, state #28000.
		let err = &out[4 + handshake_len..];
		assert_eq!(err[3], 1); // sequence id
		assert_eq!(err[4], 0xff);
		assert_eq!(u16::from_le_bytes([err[5], err[6]]), 1045);
		assert_eq!(&err[7..13], b"#28000");
	}

	#[tokio::test]
	async fn plugin_echo_blob_is_null_password() {
		let auth = framed(
			1,
			&auth_packet(b"root", b"caching_sha2_password", b"caching_sha2_password"),
		);
		let (result, _) = exchange(&auth).await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.password, PASSWORD_NULL);
	}

	#[tokio::test]
	async fn empty_blob_is_null_password() {
		let auth = framed(1, &auth_packet(b"admin", b"caching_sha2_password", b""));
		let (result, _) = exchange(&auth).await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "admin");
		assert_eq!(creds.password, PASSWORD_NULL);
	}

	#[tokio::test]
	async fn empty_username_is_not_an_event() {
		let auth = framed(1, &auth_packet(b"", b"caching_sha2_password", b"x"));
		let (result, _) = exchange(&auth).await;
		assert!(result.unwrap().is_none());
	}

	#[tokio::test]
	async fn silent_scanner_is_ignored() {
		let (result, out) = exchange(b"").await;
		assert!(result.unwrap().is_none());
		// Greeting was still sent.
		assert_eq!(out[4], PROTOCOL_VERSION);
	}
}
