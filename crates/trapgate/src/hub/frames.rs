use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::{ServiceState, SystemMetrics};
use crate::types::Attempt;

/// Frames sent to observers. On the wire each frame is a JSON object with a
/// `type` tag and a `data` payload.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
	InitialAttempts(Vec<Attempt>),
	LoginAttempt(Attempt),
	BatchStart {
		total_attempts: usize,
		total_batches: usize,
	},
	BatchData {
		batch_number: usize,
		total_batches: usize,
		attempts: Vec<Attempt>,
	},
	BatchComplete {
		total_attempts: usize,
		total_batches: usize,
	},
	BatchError {
		error: String,
		message: String,
	},
	ExternalIp {
		ip: String,
	},
	SystemMetrics(SystemMetrics),
	ServiceStatus(HashMap<String, ServiceState>),
	HeartbeatResponse {
		timestamp: DateTime<Utc>,
	},
	Pong {
		timestamp: DateTime<Utc>,
	},
	ServerHeartbeat {
		timestamp: DateTime<Utc>,
		uptime: f64,
	},
}

/// Frames received from observers.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
	RequestAttempts,
	RequestDataBatches,
	BatchAck { batch_number: usize },
	RequestMissingBatches { batch_numbers: Vec<usize> },
	Heartbeat,
	Ping,
	RequestSystemMetrics,
	RequestExternalIp,
}
