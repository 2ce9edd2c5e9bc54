// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Ready tracks whether the process has finished starting up.
///
/// Components register a task before they begin initializing; the process is
/// reported ready once every registered task has been dropped.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// register_task adds a named dependency that blocks readiness until dropped.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed); // removing the same task twice is a bug
		let left = pending.len();
		let dur = telemetry::APPLICATION_START_TIME.elapsed();
		if left == 0 {
			info!(
				"task '{}' complete ({dur:?}), marking server ready",
				self.name
			);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} tasks",
				self.name
			);
		}
	}
}
