//! mTLS client identity
//!
//! Extracts the subject Common Name and SAN DNS names from the DER-encoded
//! X.509 certificate a client presented during the TLS handshake. The proxy
//! does no authorization on these: the TLS layer has already verified the
//! chain, and meetups are matched purely by URL. The identity is carried on
//! the session for logs and registry reports.

use std::fmt;

use x509_parser::prelude::*;

// ============================================================================
// Types
// ============================================================================

/// Identity extracted from a client's X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientIdentity {
    /// Common Name from the certificate subject, if any
    pub common_name: Option<String>,
    /// DNS entries from the Subject Alternative Name extension
    pub dns_names: Vec<String>,
}

impl ClientIdentity {
    /// Short label for logs: CN, else first SAN, else `-`
    pub fn label(&self) -> &str {
        self.common_name
            .as_deref()
            .or_else(|| self.dns_names.first().map(String::as_str))
            .unwrap_or("-")
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors during certificate parsing
#[derive(Debug)]
pub enum IdentityError {
    /// Failed to parse X.509 DER certificate
    ParseError(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::ParseError(msg) => write!(f, "certificate parse error: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// Identity Extraction
// ============================================================================

/// Extract client identity from a DER-encoded X.509 certificate.
pub fn extract_identity(der_cert: &[u8]) -> Result<ClientIdentity, IdentityError> {
    let (_, cert) = X509Certificate::from_der(der_cert)
        .map_err(|e| IdentityError::ParseError(format!("{}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());

    let dns_names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => return Err(IdentityError::ParseError(format!("{}", e))),
    };

    Ok(ClientIdentity {
        common_name,
        dns_names,
    })
}

/// Identity of the leaf certificate in a verified peer chain.
///
/// Parse failures are logged and yield an empty identity: by the time this
/// runs, rustls has already accepted the chain.
pub fn identity_from_chain(chain: Option<&[rustls::pki_types::CertificateDer<'_>]>) -> ClientIdentity {
    let leaf = match chain.and_then(|c| c.first()) {
        Some(leaf) => leaf,
        None => return ClientIdentity::default(),
    };

    match extract_identity(leaf.as_ref()) {
        Ok(identity) => identity,
        Err(e) => {
            log::debug!("Could not read client certificate identity: {}", e);
            ClientIdentity::default()
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
