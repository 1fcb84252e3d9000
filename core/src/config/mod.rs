pub mod settings;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::session::{ErrorPolicy, SessionConfig};
use serde::{Deserialize, Serialize};

/// Well-known STOMP port.
pub const DEFAULT_PORT: u16 = 61613;

/// Destination every broker registers unless configured otherwise.
pub const DEFAULT_DESTINATION: &str = "/topic/all";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_size: usize,
    /// Frames queued for one connection's writer.
    pub outgoing_queue_size: usize,
    /// Deliveries queued for one session before new ones are dropped.
    pub inbox_size: usize,

    /// Broadcast destinations registered at startup.
    pub destinations: Vec<String>,
    pub auto_create_destinations: bool,

    pub error_policy: ErrorPolicy,

    /// Log a metrics report at this interval.
    pub stats_interval_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outgoing_queue_size: 256,
            inbox_size: 1024,
            destinations: vec![DEFAULT_DESTINATION.to_string()],
            auto_create_destinations: false,
            error_policy: ErrorPolicy::Terminal,
            stats_interval_secs: None,
        }
    }
}

impl BrokerConfig {
    /// Register an additional broadcast destination at startup
    pub fn with_destination(mut self, destination: &str) -> Self {
        if !self.destinations.iter().any(|d| d == destination) {
            self.destinations.push(destination.to_string());
        }
        self
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create_destinations = auto_create;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inbox_size: self.inbox_size,
            error_policy: self.error_policy,
        }
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be > 0".to_string());
        }
        if self.outgoing_queue_size == 0 {
            return Err("outgoing_queue_size must be > 0".to_string());
        }
        if self.inbox_size == 0 {
            return Err("inbox_size must be > 0".to_string());
        }
        if let Some(bad) = self.destinations.iter().find(|d| d.len() <= 1) {
            return Err(format!("invalid destination id '{}'", bad));
        }
        if self.stats_interval_secs == Some(0) {
            return Err("stats_interval_secs must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:61613");
        assert_eq!(config.destinations, vec!["/topic/all"]);
        assert_eq!(config.error_policy, ErrorPolicy::Terminal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = BrokerConfig::default()
            .with_destination("/topic/prices")
            .with_destination("/topic/prices")
            .with_auto_create(true)
            .with_error_policy(ErrorPolicy::Lenient);

        assert_eq!(config.destinations, vec!["/topic/all", "/topic/prices"]);
        assert!(config.auto_create_destinations);
        assert_eq!(config.session_config().error_policy, ErrorPolicy::Lenient);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BrokerConfig::default();
        config.inbox_size = 0;
        assert!(config.validate().is_err());

        let config = BrokerConfig::default().with_destination("/");
        assert_eq!(
            config.validate(),
            Err("invalid destination id '/'".to_string())
        );

        let config = BrokerConfig {
            stats_interval_secs: Some(0),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
