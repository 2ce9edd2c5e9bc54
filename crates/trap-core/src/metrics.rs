use prometheus_client::registry::Registry;

/// Creates the sub registry all trapgate metrics hang off of.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("trapgate")
}

pub trait Recorder<E, T> {
	/// Record the given event
	fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
	/// Record the given event by incrementing its counter by one
	fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
	R: Recorder<E, u64>,
{
	fn increment(&self, event: &E) {
		self.record(event, 1);
	}
}
