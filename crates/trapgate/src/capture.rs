use trap_core::metrics::IncrementRecorder;
use trap_core::prelude::*;

use crate::geo::GeoResolver;
use crate::hub::Hub;
use crate::metrics::Metrics;
use crate::scheduler::ConnectionScheduler;
use crate::store::EventStore;
use crate::types::{Attempt, Credentials, Protocol};

/// Joins handler output to the rest of the system: activity update, geo
/// enrichment, persistence, observer broadcast. Persistence and broadcast
/// are independent: a store failure never suppresses the broadcast and a
/// broadcast failure never rolls back the row.
pub struct CapturePipeline {
	scheduler: ConnectionScheduler,
	geo: GeoResolver,
	store: EventStore,
	hub: Hub,
	metrics: Arc<Metrics>,
}

impl CapturePipeline {
	pub fn new(
		scheduler: ConnectionScheduler,
		geo: GeoResolver,
		store: EventStore,
		hub: Hub,
		metrics: Arc<Metrics>,
	) -> Self {
		CapturePipeline {
			scheduler,
			geo,
			store,
			hub,
			metrics,
		}
	}

	pub async fn record(&self, protocol: Protocol, creds: Credentials, client_ip: IpAddr) {
		self.scheduler.touch(client_ip);
		info!(
			protocol = %protocol,
			client = %client_ip,
			username = %creds.username,
			password = %creds.password,
			"captured login attempt"
		);

		// Usually a cache hit thanks to the prefetch at accept time.
		let location = self.geo.lookup(client_ip).await;
		let mut attempt = Attempt::new(protocol, creds, client_ip.to_string(), location);

		if let Err(e) = self.store.append(&mut attempt).await {
			// Still broadcast the in-memory attempt, id unset.
			error!(client = %client_ip, err = %e, "failed to persist login attempt");
		}
		self.metrics.increment(&protocol);
		self.hub.broadcast_attempt(&attempt);
	}
}
