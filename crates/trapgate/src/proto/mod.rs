use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use trap_core::prelude::*;

use crate::capture::CapturePipeline;
use crate::config::ProtoConfig;
use crate::types::{Credentials, Protocol};

pub mod ftp;
pub mod mysql;
pub mod rdp;
pub mod sip;
pub mod smtp;
pub mod ssh;
pub mod telnet;

/// Per-connection context handed to every protocol handler.
pub struct HandlerCtx {
	pub client_ip: IpAddr,
	pub touch: Arc<dyn Fn() + Send + Sync>,
	pub cfg: ProtoConfig,
}

impl HandlerCtx {
	/// Reports inbound activity to the scheduler.
	pub fn activity(&self) {
		(self.touch)();
	}
}

#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("peer disconnected")]
	Disconnect,
	#[error("read timed out")]
	Timeout,
	#[error("i/o error: {0}")]
	Io(#[from] io::Error),
	#[error("protocol error: {0}")]
	Protocol(String),
}

pub type HandlerResult = Result<Option<Credentials>, HandlerError>;

/// Static listener descriptors, collected explicitly at startup rather than
/// through registration side effects.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolDescriptor {
	pub protocol: Protocol,
	pub default_port: u16,
	/// SIP additionally binds a datagram socket on the same port.
	pub udp: bool,
}

pub fn registry() -> Vec<ProtocolDescriptor> {
	vec![
		ProtocolDescriptor {
			protocol: Protocol::Ssh,
			default_port: 22,
			udp: false,
		},
		ProtocolDescriptor {
			protocol: Protocol::Telnet,
			default_port: 23,
			udp: false,
		},
		ProtocolDescriptor {
			protocol: Protocol::Ftp,
			default_port: 21,
			udp: false,
		},
		ProtocolDescriptor {
			protocol: Protocol::Smtp,
			default_port: 25,
			udp: false,
		},
		ProtocolDescriptor {
			protocol: Protocol::Rdp,
			default_port: 3389,
			udp: false,
		},
		ProtocolDescriptor {
			protocol: Protocol::Sip,
			default_port: 5060,
			udp: true,
		},
		ProtocolDescriptor {
			protocol: Protocol::Mysql,
			default_port: 3306,
			udp: false,
		},
	]
}

/// Stateful handler instances (SSH holds the host key, RDP per-IP probe
/// memory); the stateless protocols dispatch straight to their modules.
pub struct Handlers {
	pub ssh: ssh::SshServer,
	pub rdp: rdp::RdpServer,
}

impl Handlers {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Handlers {
			ssh: ssh::SshServer::new()?,
			rdp: rdp::RdpServer::new(),
		})
	}

	async fn serve(&self, protocol: Protocol, stream: TcpStream, ctx: &HandlerCtx) -> HandlerResult {
		match protocol {
			Protocol::Ssh => self.ssh.serve(stream, ctx).await,
			Protocol::Telnet => telnet::serve(stream, ctx).await,
			Protocol::Ftp => ftp::serve(stream, ctx).await,
			Protocol::Smtp => smtp::serve(stream, ctx).await,
			Protocol::Rdp => self.rdp.serve(stream, ctx).await,
			Protocol::Sip => sip::serve(stream, ctx).await,
			Protocol::Mysql => mysql::serve(stream, ctx).await,
		}
	}

	/// Runs one connection to completion and records any captured pair.
	/// Errors never escape: every failure just ends this connection.
	pub async fn drive(
		&self,
		protocol: Protocol,
		stream: TcpStream,
		ctx: HandlerCtx,
		capture: Arc<CapturePipeline>,
	) {
		match self.serve(protocol, stream, &ctx).await {
			Ok(Some(creds)) => capture.record(protocol, creds, ctx.client_ip).await,
			Ok(None) => debug!(protocol = %protocol, client = %ctx.client_ip, "unproductive exchange"),
			Err(e) => {
				debug!(protocol = %protocol, client = %ctx.client_ip, err = %e, "handler terminated")
			},
		}
	}
}

/// Buffered CRLF/LF line reader shared by the text protocols. Lines longer
/// than `max_line` terminate the connection.
pub struct LineReader<S> {
	stream: S,
	buf: BytesMut,
	max_line: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineReader<S> {
	pub fn new(stream: S, max_line: usize) -> Self {
		LineReader {
			stream,
			buf: BytesMut::with_capacity(512),
			max_line,
		}
	}

	/// Next line with the terminator stripped; `None` on clean EOF.
	pub async fn next_line(
		&mut self,
		ctx: &HandlerCtx,
		timeout: Duration,
	) -> Result<Option<Vec<u8>>, HandlerError> {
		loop {
			if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
				let mut line = self.buf.split_to(pos + 1);
				line.truncate(pos);
				if line.last() == Some(&b'\r') {
					line.truncate(line.len() - 1);
				}
				return Ok(Some(line.to_vec()));
			}
			if self.buf.len() > self.max_line {
				return Err(HandlerError::Protocol("line too long".to_string()));
			}
			let mut chunk = [0u8; 512];
			let n = tokio::time::timeout(timeout, self.stream.read(&mut chunk))
				.await
				.map_err(|_| HandlerError::Timeout)??;
			if n == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				// EOF mid-line: hand back what we have, like a terminated line.
				let line = self.buf.split().to_vec();
				return Ok(Some(line));
			}
			ctx.activity();
			self.buf.extend_from_slice(&chunk[..n]);
		}
	}

	pub async fn send(&mut self, bytes: &[u8]) -> Result<(), HandlerError> {
		self.stream.write_all(bytes).await?;
		Ok(())
	}
}

/// One timed read into a scratch buffer; `Ok(None)` on timeout, which most
/// binary handlers treat as "no more data coming".
pub async fn read_some<S: AsyncRead + Unpin>(
	stream: &mut S,
	ctx: &HandlerCtx,
	buf: &mut [u8],
	timeout: Duration,
) -> Result<Option<usize>, HandlerError> {
	match tokio::time::timeout(timeout, stream.read(buf)).await {
		Err(_) => Ok(None),
		Ok(Ok(0)) => Err(HandlerError::Disconnect),
		Ok(Ok(n)) => {
			ctx.activity();
			Ok(Some(n))
		},
		Ok(Err(e)) => Err(e.into()),
	}
}

#[cfg(test)]
pub(crate) mod testutil {
	use std::net::Ipv4Addr;

	use super::*;

	pub fn ctx() -> HandlerCtx {
		HandlerCtx {
			client_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77)),
			touch: Arc::new(|| {}),
			cfg: ProtoConfig::default(),
		}
	}
}
