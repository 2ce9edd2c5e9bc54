use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trap_core::prelude::*;

use crate::types::Location;

/// ip-api.com free tier allows 45 requests per minute.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1334);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const SAVE_DEBOUNCE: Duration = Duration::from_secs(300);
const PREFETCH_QUEUE: usize = 1024;

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
	status: String,
	message: Option<String>,
	#[serde(default)]
	lat: f64,
	#[serde(default)]
	lon: f64,
	country: Option<String>,
	city: Option<String>,
	#[serde(rename = "regionName")]
	region_name: Option<String>,
}

/// IP geolocation with an in-memory cache persisted to disk, a rate-limited
/// upstream, and a background prefetch worker so that handlers usually hit
/// the cache. Lookups never fail; on any upstream problem the caller gets
/// "no location".
#[derive(Clone)]
pub struct GeoResolver {
	inner: Arc<GeoInner>,
}

struct GeoInner {
	client: reqwest::Client,
	upstream: String,
	cache: Mutex<HashMap<String, Location>>,
	// Serializes upstream calls; held across the request so concurrent
	// misses cannot burst past the rate limit.
	limiter: AsyncMutex<Option<Instant>>,
	cache_file: PathBuf,
	last_save: Mutex<Instant>,
	prefetch_tx: mpsc::Sender<IpAddr>,
	worker: CancellationToken,
}

impl GeoResolver {
	pub fn new(cache_file: PathBuf) -> anyhow::Result<Self> {
		Self::with_upstream(cache_file, "http://ip-api.com/json".to_string())
	}

	pub fn with_upstream(cache_file: PathBuf, upstream: String) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(UPSTREAM_TIMEOUT)
			.build()
			.context("build geolocation client")?;
		let (prefetch_tx, prefetch_rx) = mpsc::channel(PREFETCH_QUEUE);
		let cache = load_cache(&cache_file);
		if !cache.is_empty() {
			info!(entries = cache.len(), "loaded geolocation cache");
		}
		let inner = Arc::new(GeoInner {
			client,
			upstream,
			cache: Mutex::new(cache),
			limiter: AsyncMutex::new(None),
			cache_file,
			last_save: Mutex::new(Instant::now()),
			prefetch_tx,
			worker: CancellationToken::new(),
		});
		tokio::spawn(prefetch_worker(inner.clone(), prefetch_rx));
		Ok(GeoResolver { inner })
	}

	/// Cache-first lookup. Private and loopback addresses resolve to `None`
	/// synchronously, with no upstream or cache traffic.
	pub async fn lookup(&self, ip: IpAddr) -> Option<Location> {
		if !is_public(ip) {
			return None;
		}
		let key = ip.to_string();
		if let Some(hit) = self.inner.cache.lock().unwrap().get(&key) {
			return Some(hit.clone());
		}
		self.inner.fetch(ip).await
	}

	/// Fire-and-forget: enqueue `ip` for background resolution. Dropped
	/// silently when the queue is full.
	pub fn prefetch(&self, ip: IpAddr) {
		if !is_public(ip) {
			return;
		}
		if self.inner.cache.lock().unwrap().contains_key(&ip.to_string()) {
			return;
		}
		if self.inner.prefetch_tx.try_send(ip).is_err() {
			debug!(client = %ip, "prefetch queue full, dropping");
		}
	}

	/// Stops the worker and flushes the cache to disk.
	pub async fn shutdown(&self) {
		self.inner.worker.cancel();
		self.inner.save();
	}

	#[cfg(test)]
	pub(crate) fn insert_cached(&self, ip: &str, loc: Location) {
		self
			.inner
			.cache
			.lock()
			.unwrap()
			.insert(ip.to_string(), loc);
	}

	#[cfg(test)]
	pub(crate) fn cached(&self, ip: &str) -> Option<Location> {
		self.inner.cache.lock().unwrap().get(ip).cloned()
	}

	#[cfg(test)]
	pub(crate) fn save_now(&self) {
		self.inner.save();
	}
}

impl GeoInner {
	async fn fetch(&self, ip: IpAddr) -> Option<Location> {
		{
			let mut last = self.limiter.lock().await;
			if let Some(at) = *last {
				let since = at.elapsed();
				if since < MIN_REQUEST_INTERVAL {
					tokio::time::sleep(MIN_REQUEST_INTERVAL - since).await;
				}
			}
			*last = Some(Instant::now());
		}

		let url = format!("{}/{ip}", self.upstream);
		let resp = match self.client.get(&url).send().await {
			Ok(r) => r,
			Err(e) => {
				warn!(client = %ip, err = %e, "geolocation upstream request failed");
				return None;
			},
		};
		if !resp.status().is_success() {
			warn!(client = %ip, status = %resp.status(), "geolocation upstream returned non-success");
			return None;
		}
		let body: UpstreamResponse = match resp.json().await {
			Ok(b) => b,
			Err(e) => {
				warn!(client = %ip, err = %e, "geolocation upstream returned unparseable body");
				return None;
			},
		};
		if body.status != "success" {
			warn!(
				client = %ip,
				message = body.message.as_deref().unwrap_or("unknown error"),
				"geolocation upstream rejected lookup"
			);
			return None;
		}
		let location = Location {
			latitude: body.lat,
			longitude: body.lon,
			country: body.country,
			city: body.city,
			region: body.region_name,
		};
		self
			.cache
			.lock()
			.unwrap()
			.insert(ip.to_string(), location.clone());
		self.maybe_save();
		Some(location)
	}

	fn maybe_save(&self) {
		let due = {
			let last = self.last_save.lock().unwrap();
			last.elapsed() >= SAVE_DEBOUNCE
		};
		if due {
			self.save();
		}
	}

	fn save(&self) {
		let snapshot = self.cache.lock().unwrap().clone();
		match serde_json::to_vec(&snapshot) {
			Ok(bytes) => {
				if let Err(e) = std::fs::write(&self.cache_file, bytes) {
					warn!(file = %self.cache_file.display(), err = %e, "failed to save geolocation cache");
				} else {
					debug!(entries = snapshot.len(), "saved geolocation cache");
					*self.last_save.lock().unwrap() = Instant::now();
				}
			},
			Err(e) => warn!(err = %e, "failed to serialize geolocation cache"),
		}
	}
}

async fn prefetch_worker(inner: Arc<GeoInner>, mut rx: mpsc::Receiver<IpAddr>) {
	loop {
		let ip = tokio::select! {
			_ = inner.worker.cancelled() => return,
			ip = rx.recv() => match ip {
				Some(ip) => ip,
				None => return,
			},
		};
		if inner.cache.lock().unwrap().contains_key(&ip.to_string()) {
			continue;
		}
		let _ = inner.fetch(ip).await;
	}
}

fn load_cache(path: &PathBuf) -> HashMap<String, Location> {
	match std::fs::read(path) {
		Ok(bytes) => match serde_json::from_slice(&bytes) {
			Ok(map) => map,
			Err(e) => {
				warn!(file = %path.display(), err = %e, "geolocation cache file unreadable, starting empty");
				HashMap::new()
			},
		},
		Err(_) => HashMap::new(),
	}
}

fn is_public(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			!(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
		},
		IpAddr::V6(v6) => {
			let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
			let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
			!(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
		},
	}
}
