use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `server.port`
pub const PORT_ENV: &str = "PORT";

/// Top-level supervisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Readiness probe policy applied to every service
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Environment passed to every service
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Backend services, in launch order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Time allowed for an upstream to return response headers
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Maximum idle connections kept per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            upstream_timeout_secs: default_upstream_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    /// Attempts before a service is declared failed
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,

    /// Timeout for a single attempt in milliseconds
    #[serde(default = "default_probe_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_probe_attempts(),
            interval_ms: default_probe_interval(),
            attempt_timeout_ms: default_probe_attempt_timeout(),
        }
    }
}

/// One backend service: what to run, where it listens, which paths it owns
///
/// # Security Warning
///
/// `command` and `args` are executed as given. Protect the configuration file
/// with the same care as any script the supervisor's user could run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceSpec {
    /// Name used in logs and errors
    pub name: String,

    /// Executable to launch
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    pub working_dir: Option<String>,

    /// Extra environment for this service only
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Loopback port the service listens on (passed as `PORT`)
    pub port: u16,

    /// URL prefix owned by this service; empty or absent marks the fallback
    #[serde(default)]
    pub prefix: String,
}

impl ServiceSpec {
    pub fn new(name: &str, command: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port,
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.prefix.is_empty()
    }
}

fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_timeout() -> u64 {
    120
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_probe_attempts() -> u32 {
    120
}

fn default_probe_interval() -> u64 {
    500
}

fn default_probe_attempt_timeout() -> u64 {
    2000
}

impl Config {
    /// Load from a TOML file, apply the `PORT` override and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_port_override(std::env::var(PORT_ENV).ok().as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the listen port with an externally supplied value
    pub fn apply_port_override(&mut self, value: Option<&str>) -> anyhow::Result<()> {
        if let Some(raw) = value {
            self.server.port = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {:?}", PORT_ENV, raw))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("At least one service must be configured");
        }
        if self.probe.max_attempts == 0 {
            anyhow::bail!("probe.max_attempts must be at least 1");
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut fallbacks = Vec::new();

        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("Service name must not be empty");
            }
            if !names.insert(service.name.as_str()) {
                anyhow::bail!("Duplicate service name '{}'", service.name);
            }
            if service.command.trim().is_empty() {
                anyhow::bail!("Service '{}' has an empty command", service.name);
            }
            if service.port == 0 {
                anyhow::bail!("Service '{}' must have a non-zero port", service.name);
            }
            if service.port == self.server.port {
                anyhow::bail!(
                    "Service '{}' port {} collides with the public listen port",
                    service.name,
                    service.port
                );
            }
            if !ports.insert(service.port) {
                anyhow::bail!("Port {} is assigned to more than one service", service.port);
            }

            if service.is_fallback() {
                fallbacks.push(service.name.as_str());
                continue;
            }
            if !service.prefix.starts_with('/') {
                anyhow::bail!(
                    "Service '{}' prefix '{}' must start with '/'",
                    service.name,
                    service.prefix
                );
            }
            if service.prefix.ends_with('/') {
                anyhow::bail!(
                    "Service '{}' prefix '{}' must not end with '/'",
                    service.name,
                    service.prefix
                );
            }
            if !prefixes.insert(service.prefix.as_str()) {
                anyhow::bail!("Prefix '{}' is claimed by more than one service", service.prefix);
            }
        }

        match fallbacks.len() {
            1 => Ok(()),
            0 => anyhow::bail!("Exactly one service must have no prefix (the fallback), found none"),
            _ => anyhow::bail!(
                "Exactly one service must have no prefix (the fallback), found: {}",
                fallbacks.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_SERVICES: &str = r#"
[server]
port = 8080
bind = "127.0.0.1"

[probe]
max_attempts = 10
interval_ms = 100

[env]
NODE_ENV = "production"

[[services]]
name = "admin"
command = "node"
args = ["admin/server.js"]
port = 3001
prefix = "/admin"

[[services]]
name = "agency"
command = "node"
args = ["agency/server.js"]
port = 3002
prefix = "/agency"

[[services]]
name = "client"
command = "node"
args = ["client/server.js"]
port = 3003
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(THREE_SERVICES).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.probe.max_attempts, 10);
        assert_eq!(config.probe.interval_ms, 100);
        assert_eq!(config.probe.attempt_timeout_ms, 2000);
        assert_eq!(config.env.get("NODE_ENV"), Some(&"production".to_string()));

        assert_eq!(config.services.len(), 3);
        assert_eq!(config.services[0].name, "admin");
        assert_eq!(config.services[0].prefix, "/admin");
        assert_eq!(config.services[0].args, vec!["admin/server.js"]);
        assert!(config.services[2].is_fallback());

        config.validate().unwrap();
    }

    #[test]
    fn test_default_server_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.upstream_timeout(), Duration::from_secs(120));
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.probe.max_attempts, 120);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_empty_config_fails_validation() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("At least one service"));
    }

    #[test]
    fn test_port_override() {
        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();

        config.apply_port_override(None).unwrap();
        assert_eq!(config.server.port, 8080);

        config.apply_port_override(Some("9090")).unwrap();
        assert_eq!(config.server.port, 9090);

        assert!(config.apply_port_override(Some("not-a-port")).is_err());
        assert!(config.apply_port_override(Some("70000")).is_err());
    }

    #[test]
    fn test_requires_exactly_one_fallback() {
        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[2].prefix = "/client".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("found none"));

        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[1].prefix = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agency, client"));
    }

    #[test]
    fn test_rejects_malformed_prefixes() {
        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[0].prefix = "admin".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("must start with"));

        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[0].prefix = "/admin/".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("must not end with"));

        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[1].prefix = "/admin".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("more than one service"));
    }

    #[test]
    fn test_rejects_port_collisions() {
        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[1].port = 3001;
        assert!(config.validate().unwrap_err().to_string().contains("Port 3001"));

        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[0].port = 8080;
        assert!(config.validate().unwrap_err().to_string().contains("public listen port"));
    }

    #[test]
    fn test_rejects_duplicate_names_and_zero_attempts() {
        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.services[1].name = "admin".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Duplicate service name"));

        let mut config: Config = toml::from_str(THREE_SERVICES).unwrap();
        config.probe.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_with_env_vars() {
        let toml = r#"
name = "client"
command = "node"
port = 3003

[env]
NEXT_TELEMETRY_DISABLED = "1"
"#;
        let service: ServiceSpec = toml::from_str(toml).unwrap();

        assert!(service.is_fallback());
        assert!(service.args.is_empty());
        assert_eq!(service.env.get("NEXT_TELEMETRY_DISABLED"), Some(&"1".to_string()));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.toml");
        std::fs::write(&path, THREE_SERVICES).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.services.len(), 3);

        let missing = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }
}
