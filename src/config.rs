use crate::backend::BackendConfig;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Broker selection and per-broker settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration: embedded defaults, then `path` if given, then
    /// `PROXIMO__SECTION__KEY` environment variables.
    ///
    /// Not validated here; command-line overrides still apply on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("PROXIMO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("backend.kafka.brokers"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject settings no session could run with, before touching a broker
    pub fn validate(&self) -> Result<()> {
        if self.server.grpc_port == 0 {
            return Err(GatewayError::Configuration("grpc_port must be set".to_string()));
        }
        if self.server.probe_enabled && self.server.probe_port == self.server.grpc_port {
            return Err(GatewayError::Configuration(
                "probe_port must differ from grpc_port".to_string(),
            ));
        }
        self.backend
            .validate()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host for both listeners
    #[serde(default = "default_host")]
    pub host: String,

    /// gRPC port
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Health and metrics port
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Serve the health and metrics endpoints
    #[serde(default = "default_true")]
    pub probe_enabled: bool,
}

impl ServerConfig {
    pub fn grpc_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.grpc_port)
    }

    pub fn probe_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.probe_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            grpc_port: default_grpc_port(),
            probe_port: default_probe_port(),
            probe_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let addr = format!("{}:{}", host, port);
    addr.parse().map_err(|_| GatewayError::Address(addr))
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_grpc_port() -> u16 {
    6868
}

fn default_probe_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "proximo_gateway=info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.grpc_port, 6868);
        assert_eq!(config.server.probe_port, 8080);
        assert_eq!(config.backend.kind, BackendKind::Mem);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
grpc_port = 7000

[backend]
kind = "nats"

[backend.nats]
url = "nats://broker:4222"
max_inflight = 25
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.grpc_port, 7000);
        assert_eq!(config.server.probe_port, 8080);
        assert_eq!(config.backend.kind, BackendKind::Nats);
        assert_eq!(config.backend.nats.url, "nats://broker:4222");
        assert_eq!(config.backend.nats.max_inflight, 25);
        assert_eq!(config.backend.nats.ack_wait_secs, 60);
    }

    #[test]
    fn test_zero_inflight_fails_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[backend.mem]\nmax_inflight = 0").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.backend.mem.max_inflight, 0);
        assert!(matches!(config.validate(), Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn test_invalid_host() {
        let server = ServerConfig {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(matches!(server.grpc_addr(), Err(GatewayError::Address(_))));
    }

    #[test]
    fn test_probe_port_collision() {
        let mut config = Config::default();
        config.server.probe_port = config.server.grpc_port;
        assert!(config.validate().is_err());
    }
}
