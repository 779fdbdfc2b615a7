use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// One entry per bound socket, started in declaration order
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Tenant (application) descriptors, matched in declaration order
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Directory holding `<name>.cert` / `<name>.key` pairs.
    /// Required when any listener is encrypted.
    pub cert_dir: Option<PathBuf>,

    /// `Server` header used when the tenant does not declare one, or when
    /// no tenant could be resolved
    #[serde(default = "default_server_identity")]
    pub server_identity: String,

    /// Upper bound for buffered request bodies (default: 1 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            cert_dir: None,
            server_identity: default_server_identity(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    pub port: u16,

    /// Terminate TLS on this port (default: false)
    #[serde(default)]
    pub encrypted: bool,
}

impl ListenerConfig {
    pub fn plain(port: u16) -> Self {
        Self { port, encrypted: false }
    }

    pub fn encrypted(port: u16) -> Self {
        Self { port, encrypted: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantConfig {
    /// Unique tenant identifier
    pub name: String,

    /// Free-form deployment tag (default: production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Ports this tenant accepts traffic on; the first is canonical
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Hostnames this tenant answers for; the first is canonical.
    /// A tenant with no hostnames is the catch-all for its ports.
    #[serde(default)]
    pub hostnames: Vec<HostnameConfig>,

    /// Value for the `Server` response header
    pub server_identity: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostnameConfig {
    pub hostname: String,

    /// Certificate file stem inside `cert_dir` (default: the hostname)
    #[serde(default, alias = "certificate_name")]
    pub certificate: Option<String>,
}

impl HostnameConfig {
    pub fn new(hostname: &str, certificate: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            certificate: Some(certificate.to_string()),
        }
    }

    pub fn certificate_name(&self) -> &str {
        self.certificate.as_deref().unwrap_or(&self.hostname)
    }
}

impl TenantConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            environment: default_environment(),
            ports: Vec::new(),
            hostnames: Vec::new(),
            server_identity: None,
        }
    }

    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.ports = ports.to_vec();
        self
    }

    pub fn with_hostname(mut self, hostname: &str, certificate: &str) -> Self {
        self.hostnames.push(HostnameConfig::new(hostname, certificate));
        self
    }

    pub fn with_server_identity(mut self, identity: &str) -> Self {
        self.server_identity = Some(identity.to_string());
        self
    }

    pub fn validate(&self, listeners: &[ListenerConfig]) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }

        for port in &self.ports {
            if !listeners.iter().any(|l| l.port == *port) {
                errors.push(format!("port {} has no listener", port));
            }
        }

        for entry in &self.hostnames {
            if entry.hostname.trim().is_empty() {
                errors.push("hostname must not be empty".to_string());
            }
        }

        // The canonical protocol is https whenever any port is encrypted, so
        // the canonical port has to be one of the encrypted ones.
        let prefers_encrypted = self
            .ports
            .iter()
            .any(|p| listeners.iter().any(|l| l.port == *p && l.encrypted));
        if prefers_encrypted {
            if let Some(first) = self.ports.first() {
                if !listeners.iter().any(|l| l.port == *first && l.encrypted) {
                    errors.push(format!(
                        "first port {} must be an encrypted listener because the tenant prefers https",
                        first
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!("tenant '{}': {}", self.name, errors.join(", ")))
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_identity() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_environment() -> String {
    "production".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Lower-case hostnames so lookups against Host headers and SNI names
    /// are case-insensitive
    pub fn normalize(&mut self) {
        for tenant in &mut self.tenants {
            for entry in &mut tenant.hostnames {
                entry.hostname = entry.hostname.trim().to_ascii_lowercase();
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut ports = HashSet::new();
        for listener in &self.listeners {
            if !ports.insert(listener.port) {
                errors.push(format!("listener port {} declared more than once", listener.port));
            }
            if listener.encrypted && self.server.cert_dir.is_none() {
                errors.push(format!(
                    "listener port {} is encrypted but server.cert_dir is not set",
                    listener.port
                ));
            }
        }

        let mut names = HashSet::new();
        let mut hostnames: HashMap<&str, &str> = HashMap::new();
        for tenant in &self.tenants {
            if !names.insert(tenant.name.as_str()) {
                errors.push(format!("tenant '{}' declared more than once", tenant.name));
            }
            if let Err(e) = tenant.validate(&self.listeners) {
                errors.push(e);
            }
            for entry in &tenant.hostnames {
                if let Some(owner) = hostnames.insert(entry.hostname.as_str(), tenant.name.as_str()) {
                    errors.push(format!(
                        "hostname '{}' claimed by both '{}' and '{}'",
                        entry.hostname, owner, tenant.name
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn listener(&self, port: u16) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[server]
bind = "127.0.0.1"
cert_dir = "/etc/hostgate/certs"
server_identity = "frontdoor"

[[listeners]]
port = 80

[[listeners]]
port = 443
encrypted = true

[[tenants]]
name = "example"
environment = "staging"
ports = [443, 80]
server_identity = "example/2.1"

[[tenants.hostnames]]
hostname = "Example.com"
certificate = "example"

[[tenants.hostnames]]
hostname = "www.example.com"
certificate = "example"

[[tenants]]
name = "fallback"
ports = [80]
"#;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.cert_dir, Some(PathBuf::from("/etc/hostgate/certs")));
        assert_eq!(config.listeners.len(), 2);
        assert!(config.listener(443).unwrap().encrypted);
        assert!(!config.listener(80).unwrap().encrypted);

        let example = &config.tenants[0];
        assert_eq!(example.environment, "staging");
        assert_eq!(example.ports, vec![443, 80]);
        assert_eq!(example.hostnames[0].hostname, "example.com");
        assert_eq!(example.hostnames[1].certificate_name(), "example");
        assert_eq!(example.server_identity.as_deref(), Some("example/2.1"));

        assert_eq!(config.tenants[1].environment, "production");
        assert!(config.tenants[1].hostnames.is_empty());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert!(config.cert_dir.is_none());
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert!(config.server_identity.starts_with("hostgate/"));
    }

    #[test]
    fn test_certificate_defaults_to_hostname() {
        let entry: HostnameConfig = toml::from_str(r#"hostname = "api.example.com""#).unwrap();
        assert_eq!(entry.certificate_name(), "api.example.com");
    }

    #[test]
    fn test_empty_config() {
        let config = Config::parse("").unwrap();
        assert!(config.listeners.is_empty());
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn test_validate_duplicate_listener_port() {
        let err = Config::parse("[[listeners]]\nport = 80\n[[listeners]]\nport = 80\n").unwrap_err();
        assert!(err.to_string().contains("port 80 declared more than once"));
    }

    #[test]
    fn test_validate_encrypted_requires_cert_dir() {
        let err = Config::parse("[[listeners]]\nport = 443\nencrypted = true\n").unwrap_err();
        assert!(err.to_string().contains("server.cert_dir is not set"));
    }

    #[test]
    fn test_validate_tenant_port_without_listener() {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig::plain(80));
        config.tenants.push(TenantConfig::new("a").with_ports(&[8080]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port 8080 has no listener"));
    }

    #[test]
    fn test_validate_hostname_claimed_twice() {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig::plain(80));
        config.tenants.push(TenantConfig::new("a").with_ports(&[80]).with_hostname("x.test", "x"));
        config.tenants.push(TenantConfig::new("b").with_ports(&[80]).with_hostname("x.test", "x"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("claimed by both 'a' and 'b'"));
    }

    #[test]
    fn test_validate_canonical_port_must_match_protocol() {
        let mut config = Config::default();
        config.server.cert_dir = Some(PathBuf::from("/tmp"));
        config.listeners.push(ListenerConfig::plain(80));
        config.listeners.push(ListenerConfig::encrypted(443));
        config.tenants.push(TenantConfig::new("a").with_ports(&[80, 443]).with_hostname("a.test", "a"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("first port 80 must be an encrypted listener"));

        config.tenants[0].ports = vec![443, 80];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.listeners.push(ListenerConfig::plain(80));
        config.tenants.push(TenantConfig::new("a").with_ports(&[81]));
        config.tenants.push(TenantConfig::new("a").with_ports(&[82]));
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("port 81 has no listener"));
        assert!(msg.contains("port 82 has no listener"));
        assert!(msg.contains("tenant 'a' declared more than once"));
    }
}
