//! TLS 1.3 client configuration.
//!
//! Builds a `rustls::ClientConfig` pinned to TLS 1.3 only, with webpki
//! roots by default and optional CA bundle / client cert+key overrides.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};

use crate::config::TlsConfig;
use crate::error::TransportError;

/// Build a `rustls::ClientConfig` pinned to TLS 1.3 only, using either the
/// system webpki trust store or a supplied CA bundle, and an optional
/// client certificate/key pair for mTLS.
pub fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TransportError> {
    let root_store = match &config.ca_cert {
        Some(path) => load_ca_bundle(path)?,
        None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    };

    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(root_store);

    let mut built = match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::TlsHandshake(e.to_string()))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TransportError::TlsHandshake(
                "client_cert and client_key must both be set or both be absent".to_string(),
            ))
        }
    };

    if !config.verify_cert {
        built
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }

    Ok(built)
}

pub fn server_name(sni_override: Option<&str>, host: &str) -> Result<ServerName<'static>, TransportError> {
    let name = sni_override.unwrap_or(host).to_string();
    ServerName::try_from(name).map_err(|e| TransportError::TlsHandshake(e.to_string()))
}

fn load_ca_bundle(path: &str) -> Result<RootCertStore, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::TlsHandshake(format!("opening CA bundle {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        store
            .add(cert)
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
    }
    Ok(store)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::TlsHandshake(format!("opening client cert {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::TlsHandshake(format!("opening client key {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?
        .ok_or_else(|| TransportError::TlsHandshake(format!("no private key found in {path}")))
}

/// Disables certificate verification. Only reachable when `verify_cert`
/// is explicitly set to `false` in configuration.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
