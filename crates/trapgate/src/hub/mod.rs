use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;

use crate::metrics::Metrics;
use crate::monitor::SystemMonitor;
use crate::types::Attempt;

pub mod frames;
pub mod ws;

pub use frames::{ClientFrame, ServerFrame};

const CHANNEL_CAP: usize = 256;
const BROADCAST_RETRY_DELAY: Duration = Duration::from_millis(250);
const BATCH_RETRIES: usize = 3;
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);
const PROBE_AFTER: Duration = Duration::from_secs(120);
const STALE_AFTER: Duration = Duration::from_secs(600);
const STALE_AFTER_PRESSURE: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL_PRESSURE: Duration = Duration::from_secs(30);

/// What flows down a subscriber's channel: JSON frames, or a liveness probe
/// that the transport layer turns into a protocol-level ping.
#[derive(Clone, Debug)]
pub enum Outbound {
	Frame(Arc<ServerFrame>),
	Probe,
}

/// Handle returned by `subscribe`; the transport drains `rx` into the peer.
pub struct SubscriberHandle {
	pub id: u64,
	pub rx: mpsc::Receiver<Outbound>,
}

struct Subscriber {
	tx: mpsc::Sender<Outbound>,
	info: String,
	connected_at: Instant,
	last_active: Instant,
	failed_probes: u32,
	sent: u64,
	received: u64,
}

/// Hub owns the live observer registry and fans captured attempts out to
/// every subscriber. Each subscriber has its own bounded channel, so one
/// slow observer never blocks delivery to the others, and per-subscriber
/// ordering follows channel order.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<HubInner>,
}

struct HubInner {
	subs: Mutex<HashMap<u64, Subscriber>>,
	next_id: AtomicU64,
	metrics: Arc<Metrics>,
}

impl Hub {
	pub fn new(metrics: Arc<Metrics>) -> Self {
		Hub {
			inner: Arc::new(HubInner {
				subs: Mutex::new(HashMap::new()),
				next_id: AtomicU64::new(0),
				metrics,
			}),
		}
	}

	pub fn subscribe(&self, info: String) -> SubscriberHandle {
		let (tx, rx) = mpsc::channel(CHANNEL_CAP);
		let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
		let now = Instant::now();
		let mut subs = self.inner.subs.lock().unwrap();
		subs.insert(
			id,
			Subscriber {
				tx,
				info: info.clone(),
				connected_at: now,
				last_active: now,
				failed_probes: 0,
				sent: 0,
				received: 0,
			},
		);
		self.inner.metrics.subscribers.set(subs.len() as i64);
		info!(subscriber = %info, id, "observer subscribed");
		SubscriberHandle { id, rx }
	}

	pub fn disconnect(&self, id: u64) {
		let mut subs = self.inner.subs.lock().unwrap();
		if let Some(sub) = subs.remove(&id) {
			info!(subscriber = %sub.info, id, remaining = subs.len(), "observer removed");
		}
		self.inner.metrics.subscribers.set(subs.len() as i64);
	}

	/// Record inbound traffic from a subscriber: refreshes liveness.
	pub fn mark_received(&self, id: u64) {
		let mut subs = self.inner.subs.lock().unwrap();
		if let Some(sub) = subs.get_mut(&id) {
			sub.last_active = Instant::now();
			sub.failed_probes = 0;
			sub.received += 1;
		}
	}

	/// Record a frame delivered to the peer socket.
	pub fn note_sent(&self, id: u64) {
		let mut subs = self.inner.subs.lock().unwrap();
		if let Some(sub) = subs.get_mut(&id) {
			sub.last_active = Instant::now();
			sub.sent += 1;
		}
	}

	pub fn connection_uptime(&self, id: u64) -> Option<Duration> {
		let subs = self.inner.subs.lock().unwrap();
		subs.get(&id).map(|s| s.connected_at.elapsed())
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.subs.lock().unwrap().len()
	}

	/// Delivers one attempt to every currently-registered subscriber.
	/// Best-effort, at-most-once per call per subscriber: a failed send is
	/// retried once after a short delay, then the subscriber is removed.
	pub fn broadcast_attempt(&self, attempt: &Attempt) {
		let frame = Arc::new(ServerFrame::LoginAttempt(attempt.clone()));
		let targets: Vec<(u64, mpsc::Sender<Outbound>)> = {
			let subs = self.inner.subs.lock().unwrap();
			subs.iter().map(|(id, s)| (*id, s.tx.clone())).collect()
		};
		if targets.is_empty() {
			return;
		}
		self.inner.metrics.broadcasts.inc();
		let mut delivered = 0;
		for (id, tx) in targets {
			if tx.try_send(Outbound::Frame(frame.clone())).is_ok() {
				delivered += 1;
				continue;
			}
			// One subscriber failing must not affect the rest.
			let hub = self.clone();
			let frame = frame.clone();
			tokio::spawn(async move {
				tokio::time::sleep(BROADCAST_RETRY_DELAY).await;
				if tx.try_send(Outbound::Frame(frame)).is_err() {
					warn!(id, "subscriber failed broadcast twice, removing");
					hub.disconnect(id);
				}
			});
		}
		debug!(delivered, "broadcast login attempt");
	}

	/// Sends a single frame to one subscriber, waiting for channel capacity.
	/// Returns false if the subscriber is gone.
	pub async fn send_frame(&self, id: u64, frame: ServerFrame) -> bool {
		let tx = {
			let subs = self.inner.subs.lock().unwrap();
			match subs.get(&id) {
				Some(s) => s.tx.clone(),
				None => return false,
			}
		};
		tx.send(Outbound::Frame(Arc::new(frame))).await.is_ok()
	}

	/// Streams the full dataset to one subscriber in numbered batches, with
	/// per-batch retry and pacing. Frame order: `batch_start`, N ×
	/// `batch_data`, `batch_complete`.
	pub async fn send_backfill(&self, id: u64, dataset: Vec<Attempt>) {
		let plan = BatchPlan::new(dataset.len());
		info!(
			id,
			total = plan.total,
			batches = plan.batches,
			"starting batched backfill"
		);
		if !self
			.send_with_retry(
				id,
				ServerFrame::BatchStart {
					total_attempts: plan.total,
					total_batches: plan.batches,
				},
			)
			.await
		{
			return;
		}
		for number in 1..=plan.batches {
			if number > 1 {
				tokio::time::sleep(plan.delay()).await;
			}
			let frame = ServerFrame::BatchData {
				batch_number: number,
				total_batches: plan.batches,
				attempts: plan.slice(&dataset, number).to_vec(),
			};
			if !self.send_with_retry(id, frame).await {
				warn!(id, number, "backfill aborted: batch undeliverable");
				let _ = self
					.send_frame(
						id,
						ServerFrame::BatchError {
							error: format!("failed to deliver batch {number}"),
							message: "error occurred during batch data transmission".to_string(),
						},
					)
					.await;
				return;
			}
		}
		let _ = self
			.send_frame(
				id,
				ServerFrame::BatchComplete {
					total_attempts: plan.total,
					total_batches: plan.batches,
				},
			)
			.await;
		info!(id, batches = plan.batches, "backfill complete");
	}

	/// Re-sends individual batches a subscriber reported missing, using the
	/// same sizing as the original transfer.
	pub async fn resend_batches(&self, id: u64, dataset: Vec<Attempt>, numbers: Vec<usize>) {
		let plan = BatchPlan::new(dataset.len());
		for number in numbers {
			if number < 1 || number > plan.batches {
				debug!(id, number, "ignoring out-of-range batch request");
				continue;
			}
			let frame = ServerFrame::BatchData {
				batch_number: number,
				total_batches: plan.batches,
				attempts: plan.slice(&dataset, number).to_vec(),
			};
			if !self.send_with_retry(id, frame).await {
				return;
			}
		}
	}

	async fn send_with_retry(&self, id: u64, frame: ServerFrame) -> bool {
		let frame = Arc::new(frame);
		for attempt in 0..BATCH_RETRIES {
			if attempt > 0 {
				tokio::time::sleep(BATCH_RETRY_DELAY).await;
			}
			let tx = {
				let subs = self.inner.subs.lock().unwrap();
				match subs.get(&id) {
					Some(s) => s.tx.clone(),
					None => return false,
				}
			};
			if tx.send(Outbound::Frame(frame.clone())).await.is_ok() {
				return true;
			}
		}
		false
	}

	/// Liveness and staleness sweep. Probes subscribers idle beyond the
	/// probe window; removes any with a failed probe or past the staleness
	/// cutoff. Memory pressure accelerates the loop and halves the cutoff.
	pub async fn run_cleanup(self, monitor: SystemMonitor, token: CancellationToken) {
		loop {
			let pressure = monitor.memory_pressure();
			let interval = if pressure {
				CLEANUP_INTERVAL_PRESSURE
			} else {
				CLEANUP_INTERVAL
			};
			tokio::select! {
				_ = token.cancelled() => return,
				_ = tokio::time::sleep(interval) => {}
			}
			let stale_after = if pressure {
				STALE_AFTER_PRESSURE
			} else {
				STALE_AFTER
			};
			self.sweep(stale_after);
			let (count, sent, received) = self.stats();
			if count > 0 {
				info!(
					subscribers = count,
					sent, received, "observer connection stats"
				);
			}
		}
	}

	fn sweep(&self, stale_after: Duration) {
		let now = Instant::now();
		let mut to_remove = Vec::new();
		{
			let mut subs = self.inner.subs.lock().unwrap();
			for (id, sub) in subs.iter_mut() {
				let idle = now.duration_since(sub.last_active);
				if sub.failed_probes > 0 || idle > stale_after {
					to_remove.push(*id);
					continue;
				}
				if idle > PROBE_AFTER {
					debug!(subscriber = %sub.info, "probing idle observer");
					if sub.tx.try_send(Outbound::Probe).is_err() {
						sub.failed_probes += 1;
					}
				}
			}
		}
		for id in to_remove {
			info!(id, "removing stale observer");
			self.disconnect(id);
		}
	}

	pub fn stats(&self) -> (usize, u64, u64) {
		let subs = self.inner.subs.lock().unwrap();
		let sent = subs.values().map(|s| s.sent).sum();
		let received = subs.values().map(|s| s.received).sum();
		(subs.len(), sent, received)
	}

	pub fn close_all(&self) {
		let mut subs = self.inner.subs.lock().unwrap();
		let n = subs.len();
		subs.clear();
		self.inner.metrics.subscribers.set(0);
		if n > 0 {
			info!(closed = n, "closed all observer connections");
		}
	}
}

/// Batch sizing for large backfills. Sizes shrink again past 30 000 rows to
/// bound peak memory; pacing slows as datasets grow to cap the sustained
/// ingress rate at the observer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchPlan {
	pub total: usize,
	pub size: usize,
	pub batches: usize,
}

impl BatchPlan {
	pub fn new(total: usize) -> BatchPlan {
		if total == 0 {
			// An empty dataset still produces one (empty) data batch.
			return BatchPlan {
				total: 0,
				size: 0,
				batches: 1,
			};
		}
		let size = match total {
			0..=100 => total,
			101..=1000 => 100,
			1001..=10000 => 500,
			10001..=29999 => 1000,
			_ => 500,
		};
		BatchPlan {
			total,
			size,
			batches: total.div_ceil(size),
		}
	}

	/// The 1-based batch `number`'s slice of the dataset.
	pub fn slice<'a>(&self, dataset: &'a [Attempt], number: usize) -> &'a [Attempt] {
		if self.total == 0 {
			return &[];
		}
		let start = (number - 1) * self.size;
		let end = (start + self.size).min(self.total);
		&dataset[start..end]
	}

	pub fn delay(&self) -> Duration {
		if self.total > 30000 {
			Duration::from_millis(200)
		} else if self.total > 10000 {
			Duration::from_millis(100)
		} else {
			Duration::from_millis(50)
		}
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::registry::Registry;
	use test_case::test_case;

	use super::*;
	use crate::types::{Credentials, Protocol};

	fn hub() -> Hub {
		let mut registry = Registry::default();
		Hub::new(Arc::new(Metrics::new(&mut registry)))
	}

	fn attempt(user: &str) -> Attempt {
		Attempt::new(
			Protocol::Ftp,
			Credentials::new(user, "pw"),
			"203.0.113.2".into(),
			None,
		)
	}

	fn dataset(n: usize) -> Vec<Attempt> {
		(0..n).map(|i| attempt(&format!("u{i}"))).collect()
	}

	#[test_case(1, 1, 1; "single row single batch")]
	#[test_case(100, 100, 1; "boundary full single batch")]
	#[test_case(101, 100, 2; "just past single batch")]
	#[test_case(1000, 100, 10; "top of hundred range")]
	#[test_case(1234, 100, 13; "documented thirteen batches")]
	#[test_case(10000, 500, 20; "top of five hundred range")]
	#[test_case(10001, 1000, 11; "first thousand sized")]
	#[test_case(30000, 500, 60; "thirty thousand reduced to five hundred")]
	#[test_case(30001, 500, 61; "past thirty thousand")]
	fn batch_plan_sizes(total: usize, size: usize, batches: usize) {
		let plan = BatchPlan::new(total);
		assert_eq!(plan.size, size);
		assert_eq!(plan.batches, batches);
	}

	#[test]
	fn batch_plan_covers_all_rows_without_gaps() {
		for total in [1usize, 99, 100, 101, 1234, 10007] {
			let data = dataset(total);
			let plan = BatchPlan::new(total);
			let mut seen = 0;
			for n in 1..=plan.batches {
				let slice = plan.slice(&data, n);
				assert!(!slice.is_empty());
				assert_eq!(slice[0].username, format!("u{seen}"));
				seen += slice.len();
			}
			assert_eq!(seen, total, "gap or duplicate for N={total}");
		}
	}

	#[test]
	fn empty_dataset_still_produces_one_batch() {
		let plan = BatchPlan::new(0);
		assert_eq!(plan.batches, 1);
		assert!(plan.slice(&[], 1).is_empty());
	}

	#[tokio::test]
	async fn broadcast_reaches_all_live_subscribers_in_order() {
		let hub = hub();
		let mut a = hub.subscribe("a".into());
		let mut b = hub.subscribe("b".into());
		for user in ["first", "second", "third"] {
			hub.broadcast_attempt(&attempt(user));
		}
		for rx in [&mut a.rx, &mut b.rx] {
			for expect in ["first", "second", "third"] {
				match rx.recv().await.unwrap() {
					Outbound::Frame(f) => match &*f {
						ServerFrame::LoginAttempt(at) => assert_eq!(at.username, expect),
						other => panic!("unexpected frame {other:?}"),
					},
					Outbound::Probe => panic!("unexpected probe"),
				}
			}
		}
	}

	#[tokio::test]
	async fn dead_subscriber_is_removed_after_retry() {
		let hub = hub();
		let handle = hub.subscribe("dead".into());
		// Dropping the receiver makes every send fail.
		drop(handle.rx);
		hub.broadcast_attempt(&attempt("x"));
		tokio::time::sleep(BROADCAST_RETRY_DELAY + Duration::from_millis(100)).await;
		assert_eq!(hub.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn backfill_emits_exact_frame_sequence() {
		let hub = hub();
		let mut handle = hub.subscribe("observer".into());
		let data = dataset(234);
		let hub2 = hub.clone();
		let id = handle.id;
		tokio::spawn(async move { hub2.send_backfill(id, data).await });

		match handle.rx.recv().await.unwrap() {
			Outbound::Frame(f) => match &*f {
				ServerFrame::BatchStart {
					total_attempts,
					total_batches,
				} => {
					assert_eq!(*total_attempts, 234);
					assert_eq!(*total_batches, 3);
				},
				other => panic!("expected batch_start, got {other:?}"),
			},
			_ => panic!("expected frame"),
		}
		let mut sizes = Vec::new();
		for expected_number in 1..=3 {
			match handle.rx.recv().await.unwrap() {
				Outbound::Frame(f) => match &*f {
					ServerFrame::BatchData {
						batch_number,
						attempts,
						..
					} => {
						assert_eq!(*batch_number, expected_number);
						sizes.push(attempts.len());
					},
					other => panic!("expected batch_data, got {other:?}"),
				},
				_ => panic!("expected frame"),
			}
		}
		assert_eq!(sizes, vec![100, 100, 34]);
		match handle.rx.recv().await.unwrap() {
			Outbound::Frame(f) => assert!(matches!(&*f, ServerFrame::BatchComplete { .. })),
			_ => panic!("expected batch_complete"),
		}
	}

	#[tokio::test]
	async fn missing_batches_are_resent_individually() {
		let hub = hub();
		let mut handle = hub.subscribe("observer".into());
		let data = dataset(250);
		hub.resend_batches(handle.id, data, vec![2, 99]).await;
		match handle.rx.recv().await.unwrap() {
			Outbound::Frame(f) => match &*f {
				ServerFrame::BatchData {
					batch_number,
					attempts,
					..
				} => {
					assert_eq!(*batch_number, 2);
					assert_eq!(attempts[0].username, "u100");
				},
				other => panic!("unexpected {other:?}"),
			},
			_ => panic!("expected frame"),
		}
		// The out-of-range request is ignored; nothing further arrives.
		assert!(handle.rx.try_recv().is_err());
	}
}
