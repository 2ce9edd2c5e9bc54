use tokio::io::{AsyncRead, AsyncWrite};

use super::{HandlerCtx, HandlerResult, LineReader};
use crate::types::Credentials;

/// FTP control-channel emulation: enough command coverage that real clients
/// reach `USER`/`PASS`, then a `530` and disconnect.
pub async fn serve<S>(stream: S, ctx: &HandlerCtx) -> HandlerResult
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut io = LineReader::new(stream, ctx.cfg.max_line);
	io.send(b"220 Welcome to FTP server\r\n").await?;

	let mut username: Option<String> = None;
	loop {
		let Some(line) = io.next_line(ctx, ctx.cfg.extended_read_timeout).await? else {
			return Ok(None);
		};
		let line = String::from_utf8_lossy(&line).trim().to_string();
		if line.is_empty() {
			return Ok(None);
		}
		let (verb, arg) = match line.split_once(' ') {
			Some((v, a)) => (v.to_ascii_uppercase(), Some(a.trim().to_string())),
			None => (line.to_ascii_uppercase(), None),
		};
		match verb.as_str() {
			"USER" => {
				username = Some(arg.unwrap_or_default());
				io.send(b"331 Please specify the password.\r\n").await?;
			},
			"PASS" => {
				let Some(user) = username.take() else {
					io.send(b"503 Login with USER first.\r\n").await?;
					continue;
				};
				let creds = Credentials::new(user, arg.unwrap_or_default());
				io.send(b"530 Login incorrect.\r\n").await?;
				return Ok(Some(creds));
			},
			"QUIT" => {
				io.send(b"221 Goodbye.\r\n").await?;
				return Ok(None);
			},
			"SYST" => io.send(b"215 UNIX Type: L8\r\n").await?,
			"FEAT" => io.send(b"211-Features:\r\n PASV\r\n211 End\r\n").await?,
			"PWD" => {
				io.send(b"257 \"/\" is the current directory.\r\n")
					.await?
			},
			"TYPE" => io.send(b"200 Switching to ASCII mode.\r\n").await?,
			"PASV" => {
				io.send(b"227 Entering Passive Mode (127,0,0,1,0,0).\r\n")
					.await?
			},
			"PORT" => io.send(b"200 PORT command successful.\r\n").await?,
			_ => io.send(b"500 Unknown command.\r\n").await?,
		}
	}
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
	async fn pipelined_user_pass_captures_once() {
		let (result, out) = exchange(b"USER anonymous\r\nPASS guest@\r\n").await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "anonymous");
		assert_eq!(creds.password, "guest@");
		assert!(out.starts_with("220 "));
		assert!(out.contains("331 Please specify the password."));
		assert!(out.contains("530 Login incorrect."));
	}

	#[tokio::test]
	async fn canned_commands_keep_client_going() {
		let (result, out) =
			exchange(b"SYST\r\nFEAT\r\nPWD\r\nTYPE I\r\nPASV\r\nPORT 1,2,3,4,5,6\r\nNOOP\r\nQUIT\r\n")
				.await;
		assert!(result.unwrap().is_none());
		assert!(out.contains("215 UNIX Type: L8"));
		assert!(out.contains("211 End"));
		assert!(out.contains("257 \"/\""));
		assert!(out.contains("200 Switching to ASCII mode."));
		assert!(out.contains("227 Entering Passive Mode"));
		assert!(out.contains("200 PORT command successful."));
		assert!(out.contains("500 Unknown command."));
		assert!(out.contains("221 Goodbye."));
	}

	#[tokio::test]
	async fn verbs_are_case_insensitive() {
		let (result, _) = exchange(b"user Root\r\npass Secret1\r\n").await;
		let creds = result.unwrap().unwrap();
		assert_eq!(creds.username, "Root");
		assert_eq!(creds.password, "Secret1");
	}

	#[tokio::test]
	async fn pass_without_user_is_not_an_event() {
		let (result, out) = exchange(b"PASS lonely\r\nQUIT\r\n").await;
		assert!(result.unwrap().is_none());
		assert!(out.contains("503 "));
	}
}
