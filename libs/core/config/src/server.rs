use crate::{env_or_default, env_parse_or, ConfigError, FromEnv};
use std::net::{Ipv4Addr, SocketAddr};

/// Default port for worker health probes. The OJS backend itself defaults to 8080.
const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Bind address for a worker's health and metrics endpoints
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse the address into a socket address for binding
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address()
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "HEALTH_HOST".to_string(),
                details: e.to_string(),
            })
    }
}

impl FromEnv for ServerConfig {
    /// Reads from environment variables with sensible defaults:
    /// - HEALTH_HOST: defaults to 0.0.0.0 (all interfaces)
    /// - HEALTH_PORT: defaults to 8081
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_parse_or("HEALTH_PORT", DEFAULT_HEALTH_PORT)?;

        Ok(Self { host, port })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: DEFAULT_HEALTH_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_from_env_with_defaults() {
        temp_env::with_vars(
            [("HEALTH_HOST", None::<&str>), ("HEALTH_PORT", None::<&str>)],
            || {
                let config = ServerConfig::from_env().unwrap();
                assert_eq!(config.host, "0.0.0.0");
                assert_eq!(config.port, 8081);
                assert_eq!(config.address(), "0.0.0.0:8081");
            },
        );
    }

    #[test]
    fn test_server_config_from_env_with_custom_values() {
        temp_env::with_vars(
            [("HEALTH_HOST", Some("127.0.0.1")), ("HEALTH_PORT", Some("9100"))],
            || {
                let config = ServerConfig::from_env().unwrap();
                assert_eq!(config.address(), "127.0.0.1:9100");
                assert_eq!(config.socket_addr().unwrap().port(), 9100);
            },
        );
    }

    #[test]
    fn test_server_config_from_env_port_out_of_range() {
        temp_env::with_var("HEALTH_PORT", Some("99999"), || {
            let err = ServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("HEALTH_PORT"));
        });
    }

    #[test]
    fn test_socket_addr_rejects_hostnames() {
        let config = ServerConfig::new("localhost".to_string(), 8081);
        assert!(config.socket_addr().is_err());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::UNSPECIFIED.to_string());
        assert_eq!(config.port, 8081);
    }
}
