use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment};

/// Prefix of the environment variables read by [`BrokerConfig::from_env`],
/// e.g. `STOMPBOX_PORT` or `STOMPBOX_DESTINATIONS=/topic/a,/topic/b`.
pub const ENV_PREFIX: &str = "STOMPBOX";

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("destinations"),
            )
            .build()
            .map_err(|e| crate::StompError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::StompError::Config(e.to_string()))?;

        config.validate().map_err(crate::StompError::Config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ErrorPolicy;

    // The only test in this crate that touches STOMPBOX_* variables.
    #[test]
    fn test_from_env() {
        std::env::set_var("STOMPBOX_PORT", "61614");
        std::env::set_var("STOMPBOX_ERROR_POLICY", "lenient");
        std::env::set_var("STOMPBOX_DESTINATIONS", "/topic/a,/topic/b");

        let config = BrokerConfig::from_env().unwrap();

        std::env::remove_var("STOMPBOX_PORT");
        std::env::remove_var("STOMPBOX_ERROR_POLICY");
        std::env::remove_var("STOMPBOX_DESTINATIONS");

        assert_eq!(config.port, 61614);
        assert_eq!(config.error_policy, ErrorPolicy::Lenient);
        assert_eq!(config.destinations, vec!["/topic/a", "/topic/b"]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_connections, 1000);
    }
}
