use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use trap_core::metrics::Recorder;

use crate::types::Protocol;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
	pub protocol: String,
}

impl From<Protocol> for ProtocolLabels {
	fn from(p: Protocol) -> Self {
		ProtocolLabels {
			protocol: p.as_str().to_string(),
		}
	}
}

#[derive(Debug)]
pub struct Metrics {
	pub downstream_connections: Family<ProtocolLabels, Counter>,
	pub rejected_connections: Family<ProtocolLabels, Counter>,
	captures: Family<ProtocolLabels, Counter>,
	pub broadcasts: Counter,
	pub subscribers: Gauge,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let downstream_connections = Family::default();
		registry.register(
			"downstream_connections",
			"The total number of accepted honeypot connections",
			downstream_connections.clone(),
		);

		let rejected_connections = Family::default();
		registry.register(
			"rejected_connections",
			"The total number of connections refused by the scheduler",
			rejected_connections.clone(),
		);

		let captures = Family::default();
		registry.register(
			"captured_attempts",
			"The total number of captured credential attempts",
			captures.clone(),
		);

		let broadcasts = Counter::default();
		registry.register(
			"broadcasts",
			"The total number of attempts broadcast to observers",
			broadcasts.clone(),
		);

		let subscribers = Gauge::default();
		registry.register(
			"subscribers",
			"The number of currently connected observers",
			subscribers.clone(),
		);

		Self {
			downstream_connections,
			rejected_connections,
			captures,
			broadcasts,
			subscribers,
		}
	}
}

impl Recorder<Protocol, u64> for Metrics {
	fn record(&self, protocol: &Protocol, count: u64) {
		self
			.captures
			.get_or_create(&ProtocolLabels::from(*protocol))
			.inc_by(count);
	}
}
