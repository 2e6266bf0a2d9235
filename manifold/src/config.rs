use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 7323;

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusSection {
    /// Listen address in `<ip_or_domain>:<port>` format.
    pub address: String,
    /// Advertised bus type, handed to activated children.
    pub bus_type: String,
    /// Directories scanned for `.service` descriptor files.
    pub service_dirs: Vec<String>,
    pub log_level: String,
}

impl Default for BusSection {
    fn default() -> BusSection {
        BusSection {
            address: format!("127.0.0.1:{}", DEFAULT_PORT),
            bus_type: "session".to_string(),
            service_dirs: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone)]
#[serde(default)]
pub struct Limits {
    pub max_connections: usize,
    pub max_incomplete_connections: usize,
    pub max_services_per_connection: usize,
    pub max_match_rules_per_connection: usize,
    pub max_incoming_bytes: usize,
    pub max_outgoing_bytes: usize,
    pub auth_timeout_ms: u64,
    pub activation_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_connections: 256,
            max_incomplete_connections: 32,
            max_services_per_connection: 128,
            max_match_rules_per_connection: 128,
            max_incoming_bytes: 131072,
            max_outgoing_bytes: 131072,
            auth_timeout_ms: 5000,
            activation_timeout_ms: 25000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PolicyRuleConfig {
    pub access: String,
    pub send_destination: Option<String>,
    pub receive_sender: Option<String>,
    pub own: Option<String>,
    pub activate: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BusConfig {
    pub bus: BusSection,
    pub limits: Limits,
    pub policy: Vec<PolicyRuleConfig>,
}

impl BusConfig {
    /// Load from a TOML file. Startup treats failure as fatal; a reload
    /// keeps the running config instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BusConfig, String> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| format!("Error loading bus configuration file: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.bus.address, format!("127.0.0.1:{}", DEFAULT_PORT));
        assert_eq!(config.bus.bus_type, "session");
        assert_eq!(config.limits.max_connections, 256);
        assert!(config.policy.is_empty());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.toml");

        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[bus]
address = "127.0.0.1:0"
service_dirs = ["./services"]

[limits]
max_connections = 4

[[policy]]
access = "deny"
own = "org.locked."
"#
        )
        .unwrap();

        let config = BusConfig::load(&path).unwrap();
        assert_eq!(config.bus.address, "127.0.0.1:0");
        assert_eq!(config.bus.bus_type, "session");
        assert_eq!(config.bus.service_dirs, vec!["./services"]);
        assert_eq!(config.limits.max_connections, 4);
        assert_eq!(config.limits.max_match_rules_per_connection, 128);
        assert_eq!(config.policy.len(), 1);
        assert_eq!(config.policy[0].own.as_deref(), Some("org.locked."));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(BusConfig::load("/nonexistent/bus.toml").is_err());
    }
}
