//! Tenant descriptors and the virtual host index
//!
//! The index is built once from configuration and never mutated, so it is
//! shared between listeners behind an `Arc` without locking.

use crate::config::{ListenerConfig, TenantConfig};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// URL scheme a request arrived on, or should be redirected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn from_encrypted(encrypted: bool) -> Self {
        if encrypted {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hostname a tenant answers for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub hostname: String,
    /// Stem of the `.cert`/`.key` pair; may be shared between hostnames
    pub certificate_name: String,
    pub prefer_encrypted: bool,
}

/// Immutable per-tenant descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub name: String,
    pub environment: String,
    pub ports: Vec<u16>,
    pub hostnames: Vec<HostBinding>,
    pub server_identity: Option<String>,
    /// True iff at least one of `ports` is an encrypted listener
    pub prefer_encrypted: bool,
}

/// Where a tenant wants to be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalLocation {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Protocol,
}

impl Tenant {
    pub fn from_config(config: &TenantConfig, listeners: &[ListenerConfig]) -> Self {
        let prefer_encrypted = config
            .ports
            .iter()
            .any(|port| listeners.iter().any(|l| l.port == *port && l.encrypted));

        let hostnames = config
            .hostnames
            .iter()
            .map(|entry| HostBinding {
                hostname: entry.hostname.to_ascii_lowercase(),
                certificate_name: entry.certificate_name().to_string(),
                prefer_encrypted,
            })
            .collect();

        Self {
            name: config.name.clone(),
            environment: config.environment.clone(),
            ports: config.ports.clone(),
            hostnames,
            server_identity: config.server_identity.clone(),
            prefer_encrypted,
        }
    }

    pub fn canonical_location(&self) -> CanonicalLocation {
        CanonicalLocation {
            host: self.hostnames.first().map(|h| h.hostname.clone()),
            port: self.ports.first().copied(),
            protocol: Protocol::from_encrypted(self.prefer_encrypted),
        }
    }

    /// A tenant without hostnames catches every host on its ports
    pub fn is_catch_all(&self) -> bool {
        self.hostnames.is_empty()
    }

    pub fn accepts_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h.hostname == hostname)
    }
}

/// Lookup seam used by the router
pub trait TenantResolver: Send + Sync {
    fn resolve_tenant(&self, hostname: &str, port: u16) -> Option<Arc<Tenant>>;
}

/// hostname + port -> tenant
#[derive(Debug, Default)]
pub struct VirtualHostIndex {
    tenants: Vec<Arc<Tenant>>,
    by_hostname: HashMap<String, usize>,
    catch_all_by_port: HashMap<u16, usize>,
}

impl VirtualHostIndex {
    pub fn new(tenants: Vec<Tenant>) -> Self {
        let mut by_hostname = HashMap::new();
        let mut catch_all_by_port = HashMap::new();

        for (idx, tenant) in tenants.iter().enumerate() {
            for binding in &tenant.hostnames {
                // First declaration wins if a hostname is repeated
                by_hostname.entry(binding.hostname.clone()).or_insert(idx);
            }
            if tenant.is_catch_all() {
                for port in &tenant.ports {
                    catch_all_by_port.entry(*port).or_insert(idx);
                }
            }
        }

        Self {
            tenants: tenants.into_iter().map(Arc::new).collect(),
            by_hostname,
            catch_all_by_port,
        }
    }

    pub fn from_config(tenants: &[TenantConfig], listeners: &[ListenerConfig]) -> Self {
        Self::new(
            tenants
                .iter()
                .map(|t| Tenant::from_config(t, listeners))
                .collect(),
        )
    }

    /// Exact hostname matches take precedence over port-only (catch-all)
    /// tenants regardless of declaration order.
    pub fn resolve(&self, hostname: &str, port: u16) -> Option<Arc<Tenant>> {
        let idx = self
            .by_hostname
            .get(hostname)
            .or_else(|| self.catch_all_by_port.get(&port))?;
        self.tenants.get(*idx).cloned()
    }

    pub fn tenants(&self) -> &[Arc<Tenant>] {
        &self.tenants
    }

    /// Tenants that accept traffic on `port`, in declaration order
    pub fn tenants_on_port(&self, port: u16) -> impl Iterator<Item = &Arc<Tenant>> {
        self.tenants.iter().filter(move |t| t.accepts_port(port))
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl TenantResolver for VirtualHostIndex {
    fn resolve_tenant(&self, hostname: &str, port: u16) -> Option<Arc<Tenant>> {
        self.resolve(hostname, port)
    }
}
