use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read cert file '{path}': {source}")]
    CertFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read key file '{path}': {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("no valid certificates found in '{0}'")]
    NoCerts(String),
    #[error("no valid private key found in '{0}'")]
    NoKey(String),
    #[error("invalid CA bundle: {0}")]
    CaBundle(String),
    #[error("invalid client certificate: {0}")]
    ClientCert(String),
    #[error("failed to build TLS config: {0}")]
    RustlsConfig(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, std::io::Error> {
    rustls_pemfile::certs(&mut BufReader::new(pem)).collect()
}

fn parse_key(pem: &[u8]) -> Result<Option<PrivateKeyDer<'static>>, std::io::Error> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
}

pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_data = fs::read(cert_path).map_err(|e| TlsError::CertFileRead {
        path: cert_path.to_string(),
        source: e,
    })?;
    let key_data = fs::read(key_path).map_err(|e| TlsError::KeyFileRead {
        path: key_path.to_string(),
        source: e,
    })?;

    let certs = parse_certs(&cert_data).map_err(|e| TlsError::CertFileRead {
        path: cert_path.to_string(),
        source: e,
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_path.to_string()));
    }

    let key = parse_key(&key_data)
        .map_err(|e| TlsError::KeyFileRead {
            path: key_path.to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoKey(key_path.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// PEM client certificate chain and key presented to webhooks.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

/// Builds the TLS configuration for calling a webhook. Certificates from
/// every PEM bundle in `ca_bundles` are trusted; with no bundle at all the
/// platform roots are used.
pub fn client_tls_config(
    ca_bundles: &[&[u8]],
    identity: Option<&ClientIdentity>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    let mut custom = false;
    for bundle in ca_bundles.iter().filter(|b| !b.is_empty()) {
        custom = true;
        let certs = parse_certs(bundle).map_err(|e| TlsError::CaBundle(e.to_string()))?;
        if certs.is_empty() {
            return Err(TlsError::CaBundle("no PEM certificates found".to_string()));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| TlsError::CaBundle(e.to_string()))?;
        }
    }
    if !custom {
        let native = rustls_native_certs::load_native_certs();
        roots.add_parsable_certificates(native.certs);
    }

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    let config = match identity {
        Some(identity) => {
            let chain = parse_certs(&identity.cert_pem)
                .map_err(|e| TlsError::ClientCert(e.to_string()))?;
            let key = parse_key(&identity.key_pem)
                .map_err(|e| TlsError::ClientCert(e.to_string()))?
                .ok_or_else(|| TlsError::ClientCert("no private key found".to_string()))?;
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}
