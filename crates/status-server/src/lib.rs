//! Status Server - HTTP health and status for a running agent
//!
//! Endpoints:
//! - GET /healthcheck: liveness judged by time since the last finalized round
//! - GET /status: the agent's round, phase, keeper and counters
//! - GET /checkpoint: the last persisted checkpoint

pub mod http_server;
pub mod methods;

pub use http_server::StatusServer;
pub use methods::{HealthResponse, StatusContext, StatusError};

/// Default seconds without progress before an agent reports unhealthy
pub const DEFAULT_HEALTH_THRESHOLD_SECS: i64 = 120;

/// Status server configuration
#[derive(Clone, Debug)]
pub struct StatusServerConfig {
    /// HTTP bind address
    pub http_addr: String,
    pub health_threshold_secs: i64,
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8700".to_string(),
            health_threshold_secs: DEFAULT_HEALTH_THRESHOLD_SECS,
        }
    }
}
