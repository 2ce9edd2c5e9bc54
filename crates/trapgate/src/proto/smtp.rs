use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{HandlerCtx, HandlerResult, LineReader};
use crate::types::Credentials;

/// SMTP emulation covering the three credential paths: inline `AUTH PLAIN`,
/// `AUTH PLAIN` with a continuation line, and `AUTH LOGIN`.
pub async fn serve<S>(stream: S, ctx: &HandlerCtx) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut io = LineReader::new(stream, ctx.cfg.max_line);
	io.send(b"220 smtp.example ESMTP ready\r\n").await?;

	loop {
		let Some(line) = io.next_line(ctx, ctx.cfg.extended_read_timeout).await? else {
			return Ok(None);
		};
		let line = String::from_utf8_lossy(&line).trim().to_string();
		if line.is_empty() {
			return Ok(None);
		}
		let mut parts = line.split_whitespace();
		let cmd = parts.next().unwrap_or_default().to_ascii_uppercase();
		match cmd.as_str() {
			"EHLO" | "HELO" => {
				io.send(
					b"250-smtp.example\r\n\
					250-PIPELINING\r\n\
					250-SIZE 35882577\r\n\
					250-AUTH LOGIN PLAIN\r\n\
					250 8BITMIME\r\n",
				)
				.await?;
			},
			"AUTH" => {
				let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
				let initial = parts.next();
				match (mechanism.as_str(), initial) {
					("PLAIN", Some(payload)) => {
						return finish_plain(&mut io, payload).await;
					},
					("PLAIN", None) => {
						io.send(b"334 \r\n").await?;
						let Some(payload) = io.next_line(ctx, ctx.cfg.extended_read_timeout).await? else {
							return Ok(None);
						};
						let payload = String::from_utf8_lossy(&payload).trim().to_string();
						return finish_plain(&mut io, &payload).await;
					},
					("LOGIN", _) => {
						// 334 prompts carry base64 "Username:" / "Password:".
						io.send(b"334 VXNlcm5hbWU6\r\n").await?;
						let Some(user) = io.next_line(ctx, ctx.cfg.extended_read_timeout).await? else {
							return Ok(None);
						};
						io.send(b"334 UGFzc3dvcmQ6\r\n").await?;
						let Some(pass) = io.next_line(ctx, ctx.cfg.extended_read_timeout).await? else {
							return Ok(None);
						};
						let (Some(user), Some(pass)) = (decode_b64(&user), decode_b64(&pass)) else {
							io.send(b"501 Authentication failed\r\n").await?;
							return Ok(None);
						};
						io.send(b"535 Authentication failed\r\n").await?;
						return Ok(Some(Credentials::new(user, pass)));
					},
					_ => {
						io.send(b"504 Authentication mechanism not supported\r\n")
							.await?;
					},
				}
			},
			"QUIT" => {
				io.send(b"221 Goodbye\r\n").await?;
				return Ok(None);
			},
			_ => {
				io.send(b"500 Error: command not recognized\r\n").await?;
			},
		}
	}
}

/// Decodes an `AUTH PLAIN` payload shaped `\0username\0password`, replies,
/// and terminates the session either way.
async fn finish_plain<S>(io: &mut LineReader<S>, payload: &str) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	match decode_plain(payload) {
		Some(creds) => {
			io.send(b"535 Authentication failed\r\n").await?;
			Ok(Some(creds))
		},
		None => {
			io.send(b"501 Authentication failed\r\n").await?;
			Ok(None)
		},
	}
}

fn decode_plain(payload: &str) -> Option<Credentials> {
	let decoded = BASE64.decode(payload.trim()).ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let mut parts = decoded.split('\0');
	let _authzid = parts.next()?;
	let username = parts.next()?;
	let password = parts.next()?;
	Some(Credentials::new(username, password))
}

fn decode_b64(line: &[u8]) -> Option<String> {
	let decoded = BASE64
		.decode(String::from_utf8_lossy(line).trim())
		.ok()?;
	String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::super::testutil::ctx;
	use super::*;

	async fn exchange(input: &[u8]) -> (HandlerResult, String) {
		let (mut client, server) = tokio::io::duplex(8192);
		let ctx = ctx();
		client.write_all(input).await.unwrap();
		client.shutdown().await.unwrap();
		let result = serve(server, &ctx).await;
		let mut out = Vec::new();
		let _ = client.read_to_end(&mut out).await;
		(result, String::from_utf8_lossy(&out).to_string())
	}

	#[tokio::test]
	async fn auth_plain_inline() {
		// base64("\0admin\0s3cret")
		let (result, out) = exchange(b"EHLO x\r\nAUTH PLAIN AGFkbWluAHMzY3JldA==\r\n").await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "admin");
		assert_eq!(creds.password, "s3cret");
		assert!(out.contains("250-PIPELINING"));
		assert!(out.contains("250-AUTH LOGIN PLAIN"));
		assert!(out.contains("250 8BITMIME"));
		assert!(out.contains("535 Authentication failed"));
	}

	#[tokio::test]
	async fn auth_plain_continuation() {
		let (result, out) = exchange(b"AUTH PLAIN\r\nAGFkbWluAHMzY3JldA==\r\n").await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "admin");
		assert_eq!(creds.password, "s3cret");
		assert!(out.contains("334 \r\n"));
	}

	#[tokio::test]
	async fn auth_login_two_step() {
		// base64("root") / base64("toor")
		let (result, out) = exchange(b"AUTH LOGIN\r\ncm9vdA==\r\ndG9vcg==\r\n").await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "root");
		assert_eq!(creds.password, "toor");
		assert!(out.contains("334 VXNlcm5hbWU6"));
		assert!(out.contains("334 UGFzc3dvcmQ6"));
	}

	#[tokio::test]
	async fn malformed_base64_is_rejected_without_event() {
		let (result, out) = exchange(b"AUTH PLAIN not-base64!!\r\n").await;
		assert!(result.unwrap().is_none());
		assert!(out.contains("501 Authentication failed"));
	}

	#[tokio::test]
	async fn unsupported_mechanism_and_unknown_command() {
		let (result, out) = exchange(b"AUTH CRAM-MD5\r\nVRFY someone\r\nQUIT\r\n").await;
		assert!(result.unwrap().is_none());
		assert!(out.contains("504 Authentication mechanism not supported"));
		assert!(out.contains("500 Error: command not recognized"));
		assert!(out.contains("221 Goodbye"));
	}
}
