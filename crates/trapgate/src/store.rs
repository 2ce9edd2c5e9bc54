use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;

use crate::types::{Attempt, Protocol};

const POOL_SIZE: u32 = 20;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(30);
const LONG_HELD: Duration = Duration::from_secs(60);

/// Append-only persistence for credential attempts, backed by a pooled,
/// health-checked SQLite connection. Rows are never mutated or deleted.
#[derive(Clone)]
pub struct EventStore {
	pool: SqlitePool,
	inflight: Arc<Mutex<HashMap<u64, Instant>>>,
	next_op: Arc<AtomicU64>,
}

impl EventStore {
	pub async fn connect(path: &Path) -> anyhow::Result<EventStore> {
		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.busy_timeout(Duration::from_secs(5))
			.foreign_keys(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(POOL_SIZE)
			.min_connections(1)
			.acquire_timeout(ACQUIRE_TIMEOUT)
			.max_lifetime(Duration::from_secs(3600))
			.test_before_acquire(true)
			.connect_with(opts)
			.await
			.context("open sqlite event store")?;
		let store = EventStore {
			pool,
			inflight: Arc::new(Mutex::new(HashMap::new())),
			next_op: Arc::new(AtomicU64::new(0)),
		};
		store.ensure_schema().await?;
		Ok(store)
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS login_attempts (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				protocol TEXT NOT NULL,
				username TEXT NOT NULL,
				password TEXT NOT NULL,
				client_ip TEXT NOT NULL,
				timestamp TEXT NOT NULL,
				latitude REAL,
				longitude REAL,
				country TEXT,
				city TEXT,
				region TEXT
			)",
		)
		.execute(&self.pool)
		.await?;
		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_login_attempts_timestamp
				ON login_attempts (timestamp)",
		)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Persists one attempt in its own transaction and backfills the
	/// server-assigned id. Rolls back on any error; no partial commit.
	pub async fn append(&self, attempt: &mut Attempt) -> anyhow::Result<()> {
		let op = self.track();
		let res = self.append_inner(attempt).await;
		self.untrack(op);
		res
	}

	async fn append_inner(&self, attempt: &mut Attempt) -> anyhow::Result<()> {
		let mut tx = self.pool.begin().await.context("begin append transaction")?;
		let id: i64 = sqlx::query_scalar(
			"INSERT INTO login_attempts
				(protocol, username, password, client_ip, timestamp,
				 latitude, longitude, country, city, region)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
				RETURNING id",
		)
		.bind(attempt.protocol.as_str())
		.bind(&attempt.username)
		.bind(&attempt.password)
		.bind(&attempt.client_ip)
		.bind(attempt.timestamp)
		.bind(attempt.latitude)
		.bind(attempt.longitude)
		.bind(&attempt.country)
		.bind(&attempt.city)
		.bind(&attempt.region)
		.fetch_one(&mut *tx)
		.await
		.context("insert login attempt")?;
		tx.commit().await.context("commit login attempt")?;
		attempt.id = Some(id);
		Ok(())
	}

	/// Snapshot of all attempts ordered newest-first, for backfill.
	pub async fn query_all(&self, limit: Option<i64>) -> anyhow::Result<Vec<Attempt>> {
		let op = self.track();
		let res = self.query_all_inner(limit).await;
		self.untrack(op);
		res
	}

	async fn query_all_inner(&self, limit: Option<i64>) -> anyhow::Result<Vec<Attempt>> {
		let sql = match limit {
			Some(_) => {
				"SELECT * FROM login_attempts ORDER BY timestamp DESC, id DESC LIMIT ?"
			},
			None => "SELECT * FROM login_attempts ORDER BY timestamp DESC, id DESC",
		};
		let mut query = sqlx::query(sql);
		if let Some(n) = limit {
			query = query.bind(n);
		}
		let rows = query.fetch_all(&self.pool).await.context("query attempts")?;
		rows.iter().map(row_to_attempt).collect()
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}

	/// Periodically logs pool statistics; operations held past the long-held
	/// threshold are reported as potential leaks and the in-flight registry
	/// is flushed.
	pub async fn supervise(self, token: CancellationToken) {
		let mut tick = tokio::time::interval(SUPERVISOR_INTERVAL);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = token.cancelled() => return,
				_ = tick.tick() => {}
			}
			let (inflight, long_held) = {
				let map = self.inflight.lock().unwrap();
				let long = map
					.values()
					.filter(|started| started.elapsed() > LONG_HELD)
					.count();
				(map.len(), long)
			};
			debug!(
				pool_size = self.pool.size(),
				idle = self.pool.num_idle(),
				inflight,
				"event store pool stats"
			);
			if long_held > 0 {
				warn!(
					long_held,
					"event store operations held over {LONG_HELD:?}; flushing session registry"
				);
				self.inflight.lock().unwrap().clear();
			}
		}
	}

	fn track(&self) -> u64 {
		let op = self.next_op.fetch_add(1, Ordering::Relaxed);
		self.inflight.lock().unwrap().insert(op, Instant::now());
		op
	}

	fn untrack(&self, op: u64) {
		self.inflight.lock().unwrap().remove(&op);
	}
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Attempt> {
	let protocol: String = row.try_get("protocol")?;
	let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
	Ok(Attempt {
		id: Some(row.try_get("id")?),
		protocol: protocol.parse::<Protocol>()?,
		username: row.try_get("username")?,
		password: row.try_get("password")?,
		client_ip: row.try_get("client_ip")?,
		timestamp,
		latitude: row.try_get("latitude")?,
		longitude: row.try_get("longitude")?,
		country: row.try_get("country")?,
		city: row.try_get("city")?,
		region: row.try_get("region")?,
	})
}
