use russh::server::{Auth, Config, Handler};
use russh::{MethodSet, SshId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use trap_core::prelude::*;

use super::{HandlerCtx, HandlerError, HandlerResult};
use crate::types::Credentials;

/// Grace period for the auth-failure reply to flush before we cut the
/// session after the first password attempt.
const POST_CAPTURE_LINGER: Duration = Duration::from_millis(500);

/// SSH server emulation built on russh: ephemeral ed25519 host key, an
/// OpenSSH-looking banner, password authentication only. The first password
/// attempt is captured and rejected, then the session is torn down. Peers
/// that never complete a key exchange run into the inactivity timeout and
/// are dropped silently.
pub struct SshServer {
	config: Arc<Config>,
}

impl SshServer {
	pub fn new() -> anyhow::Result<Self> {
		let key = russh_keys::key::KeyPair::generate_ed25519()
			.context("generate ephemeral ed25519 host key")?;
		info!(algorithm = key.name(), "generated ephemeral SSH host key");
		let config = Config {
			server_id: SshId::Standard("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.10".to_string()),
			methods: MethodSet::PASSWORD,
			auth_rejection_time: Duration::from_millis(300),
			auth_rejection_time_initial: Some(Duration::ZERO),
			inactivity_timeout: Some(Duration::from_secs(15)),
			keys: vec![key],
			..Default::default()
		};
		Ok(SshServer {
			config: Arc::new(config),
		})
	}

	pub async fn serve<S>(&self, stream: S, ctx: &HandlerCtx) -> HandlerResult
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (tx, mut rx) = mpsc::channel(1);
		let session = russh::server::run_stream(
			self.config.clone(),
			stream,
			Session {
				touch: ctx.touch.clone(),
				tx,
			},
		)
		.await
		.map_err(|e| HandlerError::Protocol(e.to_string()))?;
		tokio::pin!(session);

		tokio::select! {
			// Session ended on its own: banner-less scanner, key-exchange
			// failure, or a client that gave up before authenticating.
			res = &mut session => {
				if let Err(e) = res {
					debug!(client = %ctx.client_ip, err = %e, "ssh session ended without auth");
				}
				Ok(None)
			}
			creds = rx.recv() => {
				// Let the rejection reply flush, then drop the session; we
				// never answer a second attempt.
				let _ = tokio::time::timeout(POST_CAPTURE_LINGER, &mut session).await;
				Ok(creds)
			}
		}
	}
}

struct Session {
	touch: Arc<dyn Fn() + Send + Sync>,
	tx: mpsc::Sender<Credentials>,
}

#[async_trait::async_trait]
impl Handler for Session {
	type Error = russh::Error;

	async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
		(self.touch)();
		let _ = self.tx.try_send(Credentials::new(user, password));
		Ok(Auth::Reject {
			proceed_with_methods: None,
		})
	}

	async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
		Ok(Auth::Reject {
			proceed_with_methods: Some(MethodSet::PASSWORD),
		})
	}

	async fn auth_publickey(
		&mut self,
		_user: &str,
		_key: &russh_keys::key::PublicKey,
	) -> Result<Auth, Self::Error> {
		(self.touch)();
		Ok(Auth::Reject {
			proceed_with_methods: Some(MethodSet::PASSWORD),
		})
	}
}
