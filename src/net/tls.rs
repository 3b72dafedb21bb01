//! TLS configuration for both legs of the proxy.
//!
//! # Responsibilities
//! - Build client configs for server-facing sockets (ALPN, optional insecure mode)
//! - Build server configs for the front door TLS and HTTP/2 listeners
//! - Check whether a server certificate also covers another hostname
//! - Read PEM material from disk
//!
//! # Design Decisions
//! - Every config is built with an explicit ring provider, so nothing depends
//!   on a process-wide default provider being installed

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ResolvesServerCert;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::error::{ProxyError, Result};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config for server-facing sockets.
///
/// `allow_insecure` skips certificate verification entirely.
pub fn client_config(allow_insecure: bool, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let mut config = if allow_insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Server config whose certificate is picked per SNI hostname by `resolver`.
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// True if the leaf of `certs` is valid for `host`.
///
/// Used before an HTTP/2 session is shared between hostnames resolving to one address.
pub fn certificate_valid_for(certs: &[CertificateDer<'static>], host: &str) -> bool {
    let Some(leaf) = certs.first() else {
        return false;
    };
    let Ok(cert) = webpki::EndEntityCert::try_from(leaf) else {
        return false;
    };
    let Ok(name) = ServerName::try_from(host) else {
        return false;
    };
    cert.verify_is_valid_for_subject_name(&name).is_ok()
}

/// Reads a certificate and key PEM pair, checking both files exist first.
pub fn read_pem_pair(cert_path: &Path, key_path: &Path) -> std::io::Result<(String, String)> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }
    Ok((
        std::fs::read_to_string(cert_path)?,
        std::fs::read_to_string(key_path)?,
    ))
}

/// Parses every certificate in a PEM document.
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate("no certificate in PEM".into()));
    }
    Ok(certs)
}

/// Accepts any server certificate. Signatures are still checked.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> CertificateDer<'static> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        cert.cert.der().clone()
    }

    #[test]
    fn coalescing_requires_matching_san() {
        let certs = vec![self_signed(&["a.example.com", "b.example.com"])];
        assert!(certificate_valid_for(&certs, "a.example.com"));
        assert!(certificate_valid_for(&certs, "b.example.com"));
        assert!(!certificate_valid_for(&certs, "c.example.com"));
        assert!(!certificate_valid_for(&[], "a.example.com"));
    }

    #[test]
    fn client_configs_carry_alpn() {
        let config = client_config(true, &[ALPN_H2, ALPN_HTTP1]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let strict = client_config(false, &[ALPN_HTTP1]).unwrap();
        assert_eq!(strict.alpn_protocols.len(), 1);
    }

    #[test]
    fn missing_pem_files_are_reported() {
        let err = read_pem_pair(Path::new("/nonexistent/ca.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
