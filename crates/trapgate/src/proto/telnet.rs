use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HandlerCtx, HandlerError, HandlerResult};
use crate::types::Credentials;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const ECHO: u8 = 1;
const SUPPRESS_GO_AHEAD: u8 = 3;
const LINEMODE: u8 = 34;

/// Telnet login emulation. Negotiates a minimal option set, prompts for a
/// username and password, captures, and reports a failed login. In-stream
/// option traffic is answered and stripped so option chatter interleaved
/// with the credentials is inert.
pub async fn serve<S>(stream: S, ctx: &HandlerCtx) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut io = TelnetIo::new(stream);
	io.stream
		.write_all(&[
			IAC, WILL, ECHO, IAC, WILL, SUPPRESS_GO_AHEAD, IAC, WONT, LINEMODE,
		])
		.await?;

	io.stream.write_all(b"login: ").await?;
	let Some(username) = io.read_line(ctx).await? else {
		return Ok(None);
	};

	io.stream.write_all(b"Password: ").await?;
	let Some(password) = io.read_line(ctx).await? else {
		return Ok(None);
	};

	let creds = Credentials::new(
		String::from_utf8_lossy(&username).trim().to_string(),
		String::from_utf8_lossy(&password).trim().to_string(),
	);
	io.stream.write_all(b"Login incorrect\r\n").await?;
	Ok(Some(creds))
}

struct TelnetIo<S> {
	stream: S,
	buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TelnetIo<S> {
	fn new(stream: S) -> Self {
		TelnetIo {
			stream,
			buf: BytesMut::with_capacity(256),
		}
	}

	async fn read_byte(&mut self, ctx: &HandlerCtx) -> Result<Option<u8>, HandlerError> {
		if self.buf.is_empty() {
			let mut chunk = [0u8; 256];
			let n = tokio::time::timeout(
				ctx.cfg.extended_read_timeout,
				self.stream.read(&mut chunk),
			)
			.await
			.map_err(|_| HandlerError::Timeout)??;
			if n == 0 {
				return Ok(None);
			}
			ctx.activity();
			self.buf.extend_from_slice(&chunk[..n]);
		}
		Ok(Some(self.buf.split_to(1)[0]))
	}

	async fn must_read(&mut self, ctx: &HandlerCtx) -> Result<u8, HandlerError> {
		self.read_byte(ctx).await?.ok_or(HandlerError::Disconnect)
	}

	/// Reads one input line, answering and stripping option negotiation:
	/// DO/DONT are refused with WONT, WILL/WONT with DONT, and
	/// subnegotiation blocks are skipped through IAC SE.
	async fn read_line(&mut self, ctx: &HandlerCtx) -> Result<Option<Vec<u8>>, HandlerError> {
		let mut line = Vec::new();
		loop {
			let Some(byte) = self.read_byte(ctx).await? else {
				return Ok(if line.is_empty() { None } else { Some(line) });
			};
			match byte {
				IAC => {
					let cmd = self.must_read(ctx).await?;
					match cmd {
						DO | DONT => {
							let opt = self.must_read(ctx).await?;
							self.stream.write_all(&[IAC, WONT, opt]).await?;
						},
						WILL | WONT => {
							let opt = self.must_read(ctx).await?;
							self.stream.write_all(&[IAC, DONT, opt]).await?;
						},
						SB => loop {
							if self.must_read(ctx).await? == IAC && self.must_read(ctx).await? == SE {
								break;
							}
						},
						// Escaped 0xff data byte.
						IAC => line.push(IAC),
						_ => {},
					}
				},
				b'\r' => {
					// CR LF and CR NUL both end the line; bare CR is data.
					match self.read_byte(ctx).await? {
						Some(b'\n') | Some(0) | None => return Ok(Some(line)),
						Some(other) => {
							line.push(b'\r');
							line.push(other);
						},
					}
				},
				b'\n' => return Ok(Some(line)),
				other => {
					line.push(other);
					if line.len() > ctx.cfg.max_line {
						return Err(HandlerError::Protocol("line too long".to_string()));
					}
				},
			}
		}
	}
}
