//! Mutual-TLS server configuration
//!
//! The proxy presents its own certificate chain and requires every client to
//! present a certificate issued by one of the configured CAs. Client hostnames
//! are never checked: identity is the certificate alone.
//!
//! The proxy's key and certificate chain may live in a single PEM file (the
//! historical `*.pkeycert.pem` layout) or in two separate files.

use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

// ============================================================================
// Errors
// ============================================================================

/// Errors while loading certificates or building the TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// A certificate file could not be read or parsed
    CertLoad { path: PathBuf, reason: String },
    /// A private key file could not be read or parsed
    KeyLoad { path: PathBuf, reason: String },
    /// No usable CA certificates were found
    NoTrustAnchors,
    /// rustls rejected the configuration
    Config(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::CertLoad { path, reason } => {
                write!(f, "failed to load certificate from {}: {}", path.display(), reason)
            }
            TlsError::KeyLoad { path, reason } => {
                write!(f, "failed to load private key from {}: {}", path.display(), reason)
            }
            TlsError::NoTrustAnchors => write!(f, "no CA certificates found for client verification"),
            TlsError::Config(msg) => write!(f, "invalid TLS configuration: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl TlsError {
    fn cert_load(path: &Path, reason: impl Into<String>) -> Self {
        TlsError::CertLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn key_load(path: &Path, reason: impl Into<String>) -> Self {
        TlsError::KeyLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// PEM Loading
// ============================================================================

/// Load every certificate in a PEM file (private key blocks are skipped)
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

/// Build the client trust store from a CA bundle and/or a directory of CA files.
///
/// Only `*.pem`, `*.crt` and `*.cer` files are read from the directory.
pub fn load_client_roots(
    ca_file: Option<&Path>,
    ca_dir: Option<&Path>,
) -> Result<RootCertStore, TlsError> {
    let mut ca_certs = Vec::new();

    if let Some(path) = ca_file {
        ca_certs.extend(load_certificates(path)?);
    }

    if let Some(dir) = ca_dir {
        let entries = fs::read_dir(dir).map_err(|e| TlsError::cert_load(dir, e.to_string()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|ext| ext.to_str()),
                    Some("pem") | Some("crt") | Some("cer")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            ca_certs.extend(load_certificates(&path)?);
        }
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(ca_certs);
    if ignored > 0 {
        log::warn!("Ignored {} unparsable CA certificate(s)", ignored);
    }
    if added == 0 {
        return Err(TlsError::NoTrustAnchors);
    }
    log::info!("Loaded {} CA certificate(s) for client verification", added);

    Ok(roots)
}

// ============================================================================
// Server Configuration
// ============================================================================

/// Build a rustls server config that requires client certificates chained to `roots`
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
) -> Result<Arc<ServerConfig>, TlsError> {
    if cert_chain.is_empty() {
        return Err(TlsError::Config("server certificate chain is empty".to_string()));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TlsError::Config(format!("Failed to build client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(format!("Failed to set protocol versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| TlsError::Config(format!("Failed to build TLS config: {}", e)))?;

    Ok(Arc::new(config))
}

/// Build the server config from files on disk.
///
/// `key_file` defaults to `cert_file` for combined key+cert PEM files.
pub fn server_config_from_files(
    cert_file: &Path,
    key_file: Option<&Path>,
    ca_file: Option<&Path>,
    ca_dir: Option<&Path>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_chain = load_certificates(cert_file)?;
    if cert_chain.is_empty() {
        return Err(TlsError::cert_load(cert_file, "no certificates found in file"));
    }

    let key = load_private_key(key_file.unwrap_or(cert_file))?;
    let roots = load_client_roots(ca_file, ca_dir)?;

    server_config(cert_chain, key, roots)
}

// ============================================================================
// Tests
// ============================================================================
