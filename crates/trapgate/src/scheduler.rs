use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
	/// Upper bound on concurrently running handlers.
	pub max_workers: usize,
	/// Per-IP concurrency cap.
	pub max_per_ip: usize,
	/// A connection with no observed activity for this long is evicted.
	pub idle_timeout: Duration,
	/// Admissions allowed to wait for a free worker before `admit` rejects.
	pub queue_cap: usize,
	/// How long `shutdown` waits for running handlers to drain.
	pub drain_grace: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		SchedulerConfig {
			max_workers: 50,
			max_per_ip: 5,
			idle_timeout: Duration::from_secs(15),
			queue_cap: 100,
			drain_grace: Duration::from_secs(5),
		}
	}
}

/// ConnectionScheduler owns the worker pool for all protocol handlers.
///
/// Admission enforces the per-IP cap and worker capacity; a background
/// monitor evicts connections whose handlers stop reporting activity.
/// Every admitted handler decrements its per-IP count exactly once, on
/// whichever of completion/eviction removes its connection record.
#[derive(Clone)]
pub struct ConnectionScheduler {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: SchedulerConfig,
	workers: Arc<Semaphore>,
	queued: AtomicUsize,
	next_id: AtomicU64,
	closed: AtomicBool,
	monitor: CancellationToken,
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	counts: HashMap<IpAddr, usize>,
	records: HashMap<u64, ConnRecord>,
}

struct ConnRecord {
	ip: IpAddr,
	started: Instant,
	last_active: Instant,
	cancel: CancellationToken,
}

impl ConnectionScheduler {
	pub fn new(cfg: SchedulerConfig) -> Self {
		let inner = Arc::new(Inner {
			workers: Arc::new(Semaphore::new(cfg.max_workers)),
			queued: AtomicUsize::new(0),
			next_id: AtomicU64::new(0),
			closed: AtomicBool::new(false),
			monitor: CancellationToken::new(),
			state: Mutex::new(State::default()),
			cfg,
		});
		tokio::spawn(monitor_idle(inner.clone()));
		info!(
			max_workers = inner.cfg.max_workers,
			max_per_ip = inner.cfg.max_per_ip,
			idle_timeout = ?inner.cfg.idle_timeout,
			"connection scheduler started"
		);
		ConnectionScheduler { inner }
	}

	/// Attempts to run `work` on the pool. Returns false when the per-IP cap
	/// is met, the admission queue is full, or the scheduler is shutting
	/// down; the caller must close the transport on rejection.
	pub fn admit<F>(&self, ip: IpAddr, work: F) -> bool
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let inner = &self.inner;
		if inner.closed.load(Ordering::SeqCst) || inner.cfg.max_per_ip == 0 {
			return false;
		}

		// Single read-modify-write under the lock.
		{
			let mut st = inner.state.lock().unwrap();
			let cur = st.counts.get(&ip).copied().unwrap_or(0);
			if cur >= inner.cfg.max_per_ip {
				warn!(client = %ip, connections = cur, "rejecting connection: per-IP cap reached");
				return false;
			}
			st.counts.insert(ip, cur + 1);
		}

		let permit = match inner.workers.clone().try_acquire_owned() {
			Ok(p) => Some(p),
			Err(_) => {
				let queued = inner
					.queued
					.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
						(q < inner.cfg.queue_cap).then_some(q + 1)
					});
				if queued.is_err() {
					warn!(client = %ip, "rejecting connection: admission queue full");
					inner.release_ip(ip);
					return false;
				}
				None
			},
		};

		tokio::spawn(run_admitted(inner.clone(), ip, permit, work));
		true
	}

	/// Marks every live connection from `ip` as active. Called by handlers
	/// on any inbound byte; cheap and idempotent.
	pub fn touch(&self, ip: IpAddr) {
		let now = Instant::now();
		let mut st = self.inner.state.lock().unwrap();
		for rec in st.records.values_mut() {
			if rec.ip == ip {
				rec.last_active = now;
			}
		}
	}

	/// A `touch` closure bound to one client IP, handed to handlers.
	pub fn toucher(&self, ip: IpAddr) -> Arc<dyn Fn() + Send + Sync> {
		let scheduler = self.clone();
		Arc::new(move || scheduler.touch(ip))
	}

	pub fn live_connections(&self) -> usize {
		self.inner.state.lock().unwrap().records.len()
	}

	pub fn connections_for(&self, ip: IpAddr) -> usize {
		self
			.inner
			.state
			.lock()
			.unwrap()
			.counts
			.get(&ip)
			.copied()
			.unwrap_or(0)
	}

	/// Stops the monitor, refuses new admissions, cancels live records and
	/// waits (bounded) for the workers to drain.
	pub async fn shutdown(&self) {
		let inner = &self.inner;
		inner.closed.store(true, Ordering::SeqCst);
		inner.monitor.cancel();
		inner.workers.close();
		let cancels: Vec<CancellationToken> = {
			let st = inner.state.lock().unwrap();
			st.records.values().map(|r| r.cancel.clone()).collect()
		};
		for c in cancels {
			c.cancel();
		}
		let deadline = Instant::now() + inner.cfg.drain_grace;
		while Instant::now() < deadline {
			if inner.state.lock().unwrap().records.is_empty() {
				info!("connection scheduler drained");
				return;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		warn!(
			remaining = self.live_connections(),
			"scheduler drain grace expired with live connections"
		);
	}
}

impl Inner {
	fn release_ip(&self, ip: IpAddr) {
		let mut st = self.state.lock().unwrap();
		decrement(&mut st, ip);
	}

	/// Removes the record and, if this call was the one that removed it,
	/// performs the single per-IP decrement. Safe to race with eviction.
	fn finish(&self, id: u64) {
		let mut st = self.state.lock().unwrap();
		if let Some(rec) = st.records.remove(&id) {
			decrement(&mut st, rec.ip);
		}
	}
}

fn decrement(st: &mut State, ip: IpAddr) {
	if let Some(count) = st.counts.get_mut(&ip) {
		*count = count.saturating_sub(1);
		if *count == 0 {
			st.counts.remove(&ip);
		}
	}
}

async fn run_admitted<F>(
	inner: Arc<Inner>,
	ip: IpAddr,
	permit: Option<tokio::sync::OwnedSemaphorePermit>,
	work: F,
) where
	F: Future<Output = ()> + Send + 'static,
{
	let permit = match permit {
		Some(p) => p,
		None => {
			// Queued admission: wait for capacity, but not past the idle
			// timeout; the unserved socket is closed when `work` is dropped.
			let res = tokio::time::timeout(
				inner.cfg.idle_timeout,
				inner.workers.clone().acquire_owned(),
			)
			.await;
			inner.queued.fetch_sub(1, Ordering::SeqCst);
			match res {
				Ok(Ok(p)) => p,
				_ => {
					debug!(client = %ip, "queued connection expired before a worker freed up");
					inner.release_ip(ip);
					return;
				},
			}
		},
	};

	let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
	let cancel = CancellationToken::new();
	{
		let now = Instant::now();
		let mut st = inner.state.lock().unwrap();
		st.records.insert(
			id,
			ConnRecord {
				ip,
				started: now,
				last_active: now,
				cancel: cancel.clone(),
			},
		);
	}

	tokio::select! {
		_ = cancel.cancelled() => {
			debug!(client = %ip, "connection cancelled");
		}
		res = AssertUnwindSafe(work).catch_unwind() => {
			if res.is_err() {
				error!(client = %ip, "handler panicked; counters remain consistent");
			}
		}
	}

	drop(permit);
	inner.finish(id);
}

async fn monitor_idle(inner: Arc<Inner>) {
	let mut tick = tokio::time::interval(Duration::from_secs(1));
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = inner.monitor.cancelled() => return,
			_ = tick.tick() => {}
		}
		let now = Instant::now();
		let expired: Vec<(u64, IpAddr, Duration, CancellationToken)> = {
			let st = inner.state.lock().unwrap();
			st.records
				.iter()
				.filter(|(_, r)| now.duration_since(r.last_active) > inner.cfg.idle_timeout)
				.map(|(id, r)| (*id, r.ip, now.duration_since(r.started), r.cancel.clone()))
				.collect()
		};
		for (id, ip, age, cancel) in expired {
			info!(client = %ip, age = ?age, "terminating inactive connection");
			cancel.cancel();
			// Removing a record whose handler already returned is a no-op;
			// the decrement belongs to whoever removes the record.
			inner.finish(id);
		}
	}
}
