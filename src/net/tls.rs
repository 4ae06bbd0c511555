//! TLS termination with per-handshake certificate selection.
//!
//! # Responsibilities
//! - Pick the certificate for a handshake from its SNI name
//! - Load PEM certificate chains and private keys
//! - Cache parsed keys for the lifetime of a policy snapshot
//! - Build the rustls server configuration (ALPN `h2`, `http/1.1`)

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};

use crate::config::schema::{GatewayConfig, TlsMaterial};
use crate::routing::host::HostTable;
use crate::routing::pattern::{HostPattern, PatternError};

/// Error raised while selecting or loading a certificate.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no certificate for host {0:?}")]
    NoCertificateForHost(String),

    #[error("client sent no server name")]
    MissingServerName,

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0:?}")]
    EmptyChain(PathBuf),

    #[error("no private key found in {0:?}")]
    MissingKey(PathBuf),

    #[error("unusable private key in {path:?}: {source}")]
    UnsupportedKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
}

/// Chooses the certificate for each handshake.
///
/// Patterns follow the same precedence as host routing. A loaded key is
/// cached under its vhost pattern; failed loads are retried next time.
#[derive(Debug, Default)]
pub struct CertificateSelector {
    table: HostTable<TlsMaterial>,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl CertificateSelector {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, PatternError> {
        let mut table = HostTable::new();
        for (pattern, vhost) in &config.vhosts {
            if let Some(tls) = &vhost.tls {
                table.insert(HostPattern::parse(pattern)?, tls.clone());
            }
        }
        Ok(Self {
            table,
            cache: DashMap::new(),
        })
    }

    /// Resolve the key for an SNI name.
    pub fn select(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, TlsError> {
        let name = server_name.ok_or(TlsError::MissingServerName)?;
        let (pattern, material) = self
            .table
            .resolve(name)
            .ok_or_else(|| TlsError::NoCertificateForHost(name.to_string()))?;

        if let Some(cached) = self.cache.get(pattern.as_str()) {
            return Ok(Arc::clone(cached.value()));
        }

        let key = Arc::new(load_certified_key(material)?);
        self.cache
            .insert(pattern.as_str().to_string(), Arc::clone(&key));
        tracing::debug!(vhost = %pattern, server_name = name, "Certificate loaded");
        Ok(key)
    }
}

/// Load a certificate chain and private key from PEM files.
pub fn load_certified_key(material: &TlsMaterial) -> Result<CertifiedKey, TlsError> {
    let chain = load_certificates(&material.cert)?;
    let key = load_private_key(&material.key)?;
    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|source| TlsError::UnsupportedKey {
            path: material.key.clone(),
            source,
        })?;
    Ok(CertifiedKey::new(chain, signing_key))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::EmptyChain(path.to_path_buf()));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingKey(path.to_path_buf()))
}

/// rustls certificate resolver backed by the current selector.
///
/// The selector is swapped on reload; in-progress handshakes keep the one
/// they loaded.
pub struct SniResolver {
    current: Arc<ArcSwap<CertificateSelector>>,
}

impl SniResolver {
    pub fn new(current: Arc<ArcSwap<CertificateSelector>>) -> Self {
        Self { current }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("vhosts", &self.current.load().table.len())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.current.load().select(hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "TLS handshake rejected");
                None
            }
        }
    }
}

/// Server configuration selecting certificates through `resolver`.
pub fn server_config(resolver: Arc<SniResolver>) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Vhost;

    fn write_pair(dir: &tempfile::TempDir, name: &str, hosts: &[&str]) -> TlsMaterial {
        let generated =
            rcgen::generate_simple_self_signed(hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = dir.path().join(format!("{name}.crt"));
        let key = dir.path().join(format!("{name}.key"));
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        TlsMaterial { cert, key }
    }

    fn selector(entries: Vec<(&str, TlsMaterial)>) -> CertificateSelector {
        let mut config = GatewayConfig::default();
        for (pattern, tls) in entries {
            config.vhosts.insert(
                pattern.to_string(),
                Vhost {
                    tls: Some(tls),
                    ..Default::default()
                },
            );
        }
        CertificateSelector::from_config(&config).unwrap()
    }

    #[test]
    fn exact_name_beats_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let wildcard = write_pair(&dir, "wildcard", &["*.example.com"]);
        let exact = write_pair(&dir, "exact", &["api.example.com"]);
        let exact_der = load_certificates(&exact.cert).unwrap();
        let wildcard_der = load_certificates(&wildcard.cert).unwrap();

        let selector = selector(vec![("*.example.com", wildcard), ("api.example.com", exact)]);

        let key = selector.select(Some("api.example.com")).unwrap();
        assert_eq!(key.cert, exact_der);
        let key = selector.select(Some("www.example.com")).unwrap();
        assert_eq!(key.cert, wildcard_der);
    }

    #[test]
    fn keys_are_cached_per_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let selector = selector(vec![("*.example.com", write_pair(&dir, "w", &["*.example.com"]))]);

        let first = selector.select(Some("a.example.com")).unwrap();
        let second = selector.select(Some("b.example.com")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_or_missing_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let selector = selector(vec![("api.example.com", write_pair(&dir, "a", &["api.example.com"]))]);

        assert!(matches!(
            selector.select(Some("other.org")),
            Err(TlsError::NoCertificateForHost(name)) if name == "other.org"
        ));
        assert!(matches!(selector.select(None), Err(TlsError::MissingServerName)));
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let material = TlsMaterial {
            cert: dir.path().join("late.crt"),
            key: dir.path().join("late.key"),
        };
        let selector = selector(vec![("api.example.com", material)]);
        assert!(matches!(
            selector.select(Some("api.example.com")),
            Err(TlsError::Read { .. })
        ));

        write_pair(&dir, "late", &["api.example.com"]);
        assert!(selector.select(Some("api.example.com")).is_ok());
    }

    #[test]
    fn server_config_advertises_alpn() {
        let resolver = Arc::new(SniResolver::new(Arc::new(ArcSwap::from_pointee(
            CertificateSelector::default(),
        ))));
        let config = server_config(resolver).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
