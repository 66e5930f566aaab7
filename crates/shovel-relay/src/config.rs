//! Relay configuration

use serde::{Deserialize, Serialize};

/// Relay configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Mirror reads to the read-side log sink and writes to the write-side
    /// log sink
    pub log_traffic: bool,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_traffic(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_disables_logging() {
        let config = RelayConfig::default();
        assert!(!config.log_traffic);
    }

    #[test]
    fn test_with_log_traffic() {
        let config = RelayConfig::new().with_log_traffic(true);
        assert!(config.log_traffic);
    }

    #[test]
    fn test_deserialize() {
        let config: RelayConfig = serde_json::from_str(r#"{"log_traffic": true}"#).unwrap();
        assert!(config.log_traffic);

        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
    }
}
