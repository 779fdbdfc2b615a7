//! Per-listener certificate index and SNI resolution
//!
//! Certificate and key bytes are read from disk once, when the encrypted
//! listener starts. The rustls resolver runs inside the handshake and must
//! not block, so it only ever consults the in-memory index.

use crate::events::{Event, EventBus, EventKind};
use crate::tenant::VirtualHostIndex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CERT_EXTENSION: &str = "cert";
pub const KEY_EXTENSION: &str = "key";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("listener port {port} is encrypted but no certificate directory is configured")]
    MissingCertificateDirectory { port: u16 },

    #[error("certificate directory {path:?} does not exist")]
    CertificateDirectoryNotFound { path: PathBuf },

    #[error("failed to read certificate {path:?}: {source}")]
    CertificateLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read private key {path:?}: {source}")]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("client did not send a server name")]
    MissingServerName,

    #[error("no certificate registered for server name '{0}'")]
    UnknownServerName(String),

    #[error("failed to build TLS context from certificate '{name}': {message}")]
    InvalidCertificate { name: String, message: String },

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

struct CertificateEntry {
    cert: Vec<u8>,
    key: Vec<u8>,
    /// Built on first use from `cert`/`key`; the bytes never change, so
    /// neither does the outcome
    context: OnceLock<Result<Arc<CertifiedKey>, String>>,
}

/// Hostname -> certificate name -> pre-loaded certificate/key bytes, for one
/// encrypted listener. Immutable once built.
pub struct CertificateIndex {
    port: u16,
    certificates: HashMap<String, CertificateEntry>,
    hostnames: HashMap<String, String>,
}

impl std::fmt::Debug for CertificateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIndex")
            .field("port", &self.port)
            .field("certificates", &self.certificates.keys().collect::<Vec<_>>())
            .field("hostnames", &self.hostnames.len())
            .finish()
    }
}

impl CertificateIndex {
    /// Load `<cert_dir>/<name>.cert` and `<cert_dir>/<name>.key` for every
    /// hostname of every tenant that accepts traffic on `port`. Each
    /// certificate name is read once however many hostnames share it.
    pub fn build(tenants: &VirtualHostIndex, port: u16, cert_dir: Option<&Path>) -> Result<Self, TlsError> {
        let cert_dir = cert_dir.ok_or(TlsError::MissingCertificateDirectory { port })?;
        if !cert_dir.is_dir() {
            return Err(TlsError::CertificateDirectoryNotFound {
                path: cert_dir.to_path_buf(),
            });
        }

        let mut certificates = HashMap::new();
        let mut hostnames = HashMap::new();

        for tenant in tenants.tenants_on_port(port) {
            for binding in &tenant.hostnames {
                let name = &binding.certificate_name;
                if !certificates.contains_key(name) {
                    let entry = load_entry(cert_dir, name)?;
                    debug!(port, certificate = %name, "Loaded certificate");
                    certificates.insert(name.clone(), entry);
                }
                hostnames
                    .entry(binding.hostname.clone())
                    .or_insert_with(|| name.clone());
            }
        }

        info!(
            port,
            certificates = certificates.len(),
            hostnames = hostnames.len(),
            "Certificate index built"
        );

        Ok(Self {
            port,
            certificates,
            hostnames,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates.len()
    }

    pub fn certificate_name(&self, hostname: &str) -> Option<&str> {
        self.hostnames
            .get(&hostname.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn certificate_bytes(&self, name: &str) -> Option<&[u8]> {
        self.certificates.get(name).map(|e| e.cert.as_slice())
    }

    pub fn key_bytes(&self, name: &str) -> Option<&[u8]> {
        self.certificates.get(name).map(|e| e.key.as_slice())
    }

    /// Signing context for `server_name`. Never touches the disk.
    pub fn answer_sni(&self, server_name: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let hostname = server_name.to_ascii_lowercase();
        let name = self
            .hostnames
            .get(&hostname)
            .ok_or_else(|| TlsError::UnknownServerName(hostname.clone()))?;
        let entry = self
            .certificates
            .get(name)
            .ok_or_else(|| TlsError::UnknownServerName(hostname.clone()))?;

        entry
            .context
            .get_or_init(|| certified_key(&entry.cert, &entry.key))
            .clone()
            .map_err(|message| TlsError::InvalidCertificate {
                name: name.clone(),
                message,
            })
    }
}

fn load_entry(cert_dir: &Path, name: &str) -> Result<CertificateEntry, TlsError> {
    let cert_path = cert_dir.join(format!("{}.{}", name, CERT_EXTENSION));
    let key_path = cert_dir.join(format!("{}.{}", name, KEY_EXTENSION));

    let cert = std::fs::read(&cert_path).map_err(|source| TlsError::CertificateLoad {
        path: cert_path,
        source,
    })?;
    let key = std::fs::read(&key_path).map_err(|source| TlsError::KeyLoad {
        path: key_path,
        source,
    })?;

    Ok(CertificateEntry {
        cert,
        key,
        context: OnceLock::new(),
    })
}

/// Accepts PEM, falling back to raw DER for files without PEM sections
fn certified_key(cert: &[u8], key: &[u8]) -> Result<Arc<CertifiedKey>, String> {
    let mut chain = rustls_pemfile::certs(&mut &cert[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificate: {}", e))?;
    if chain.is_empty() {
        chain.push(CertificateDer::from(cert.to_vec()));
    }

    let private_key = match rustls_pemfile::private_key(&mut &key[..])
        .map_err(|e| format!("failed to parse private key: {}", e))?
    {
        Some(private_key) => private_key,
        None => PrivateKeyDer::try_from(key.to_vec()).map_err(|e| format!("no private key found: {}", e))?,
    };

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
        .map_err(|e| format!("unsupported private key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// rustls certificate resolver backed by a [`CertificateIndex`]. A failed
/// lookup aborts only the handshake in progress.
#[derive(Debug)]
pub struct SniResolver {
    index: Arc<CertificateIndex>,
    events: EventBus,
}

impl SniResolver {
    pub fn new(index: Arc<CertificateIndex>, events: EventBus) -> Self {
        Self { index, events }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        let result = match server_name {
            Some(name) => self.index.answer_sni(name),
            None => Err(TlsError::MissingServerName),
        };

        match result {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(port = self.index.port(), server_name, error = %e, "SNI lookup failed");
                self.events.publish(
                    Event::warning(EventKind::SniFailure, "SNI lookup failed")
                        .with_cause(&e)
                        .with_info("port", self.index.port())
                        .with_info("server_name", server_name.unwrap_or("")),
                );
                None
            }
        }
    }
}

/// rustls server configuration for an encrypted listener, advertising h2
/// and http/1.1
pub fn server_config(index: Arc<CertificateIndex>, events: EventBus) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(index, events)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
