//! Agent Configuration
//!
//! One JSON file describes the group, the protocol timing and the local
//! task runner. Everything not given falls back to the devnet defaults.

use agent_runtime::TaskRunnerConfig;
use mech_consensus::ProtocolConfig;
use serde::{Deserialize, Serialize};
use status_server::DEFAULT_HEALTH_THRESHOLD_SECS;
use std::path::Path;

/// Participants in a devnet started without a config file
pub const DEFAULT_DEVNET_SIZE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub runner: TaskRunnerConfig,
    /// Host the status servers bind to
    #[serde(default = "default_status_host")]
    pub status_host: String,
    /// Status server port of the first participant; the rest count up from it
    #[serde(default = "default_status_base_port")]
    pub status_base_port: u16,
    #[serde(default = "default_health_threshold_secs")]
    pub health_threshold_secs: i64,
}

fn default_status_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_base_port() -> u16 {
    8700
}

fn default_health_threshold_secs() -> i64 {
    DEFAULT_HEALTH_THRESHOLD_SECS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::devnet(DEFAULT_DEVNET_SIZE)
    }
}

impl AgentConfig {
    /// A local group of `n` agents with short timeouts
    pub fn devnet(n: usize) -> Self {
        let addresses: Vec<String> = (0..n).map(|i| format!("agent-{}", i)).collect();
        let mut protocol = ProtocolConfig::for_participants(&addresses);
        protocol.round_timeout_ms = 10_000;
        protocol.keeper_timeout_ms = 5_000;
        protocol.settlement_poll_interval_ms = 100;

        Self {
            protocol,
            runner: TaskRunnerConfig {
                task_deadline_ms: 5_000,
                ..Default::default()
            },
            status_host: default_status_host(),
            status_base_port: default_status_base_port(),
            health_threshold_secs: default_health_threshold_secs(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.protocol.validate()?;
        self.runner.validate()?;
        if self.health_threshold_secs <= 0 {
            anyhow::bail!("health_threshold_secs must be positive");
        }
        let last_port = self.status_base_port as usize + self.protocol.participants.len();
        if last_port > u16::MAX as usize {
            anyhow::bail!("status ports starting at {} overflow", self.status_base_port);
        }
        Ok(())
    }

    /// Status server address of the participant at `index`
    pub fn status_addr(&self, index: usize) -> String {
        format!("{}:{}", self.status_host, self.status_base_port as usize + index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devnet_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.protocol.participants.len(), DEFAULT_DEVNET_SIZE);
        assert_eq!(config.protocol.participants[2].address, "agent-2");
        assert_eq!(config.status_addr(2), "127.0.0.1:8702");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{
                "protocol": {
                    "participants": [
                        { "address": "alpha", "rank": 0 },
                        { "address": "beta", "rank": 1 },
                        { "address": "gamma", "rank": 2 }
                    ],
                    "round_timeout_ms": 2000,
                    "keeper_timeout_ms": 1000,
                    "keeper_allowed_retries": 2,
                    "max_attempts": 3
                },
                "status_base_port": 9100
            }"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.protocol.participants.len(), 3);
        assert_eq!(config.protocol.quorum.threshold(3), 2);
        assert_eq!(config.runner, TaskRunnerConfig::default());
        assert_eq!(config.status_addr(1), "127.0.0.1:9101");
    }

    #[test]
    fn test_rejects_invalid() {
        let mut config = AgentConfig::default();
        config.protocol.participants.clear();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.runner.max_executing_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.status_base_port = u16::MAX;
        assert!(config.validate().is_err());

        assert!(AgentConfig::from_json("{").is_err());
    }
}
