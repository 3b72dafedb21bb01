//! Per-hostname certificates for the TLS and HTTP/2 listeners.
//!
//! # Responsibilities
//! - `CertificateGenerator`: the narrow interface that mints a leaf certificate for a host
//! - `CertificateAuthority`: an rcgen-backed generator, CA loaded from PEM or created fresh
//! - `CertificateStore`: one context per hostname for the process lifetime; every
//!   client handshake waits for its host's context before it continues
//!
//! # Data Flow
//! ```text
//! CONNECT host:443
//!     → CertificateStore::add_secure_context(host)   (once per host, concurrent callers share it)
//!         → CertificateGenerator::generate(host) on the blocking pool
//! TLS ClientHello (SNI, else the tunneled host)
//!     → CertificateStore::accept: await the host's context, then finish the handshake
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::config::CaConfig;
use crate::error::{ProxyError, Result};
use crate::net::tls;

/// Hostname used when a client sends no SNI.
const DEFAULT_HOST: &str = "localhost";
const CA_COMMON_NAME: &str = "session-mitm CA";

/// A freshly minted leaf certificate.
pub struct GeneratedCertificate {
    /// Leaf first, then any intermediates.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Mints certificates the browser will accept for `host`.
pub trait CertificateGenerator: Send + Sync {
    fn generate(&self, host: &str) -> Result<GeneratedCertificate>;
}

impl From<rcgen::Error> for ProxyError {
    fn from(e: rcgen::Error) -> Self {
        ProxyError::Certificate(e.to_string())
    }
}

/// Signs leaf certificates with a local CA.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Creates a new self-signed CA.
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate()?;
        let key_pem = key.serialize_pem();
        let params = ca_params();
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_pem,
            issuer: Issuer::new(params, key),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert_der = tls::certs_from_pem(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Certificate("no CA certificate in PEM".into()))?;
        let key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)?;
        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
        })
    }

    /// Loads the configured CA, or generates an ephemeral one.
    pub fn from_config(config: Option<&CaConfig>) -> Result<Self> {
        match config {
            Some(ca) => {
                let (cert_pem, key_pem) = tls::read_pem_pair(Path::new(&ca.cert_path), Path::new(&ca.key_path))?;
                let authority = Self::from_pem(&cert_pem, &key_pem)?;
                tracing::info!(cert_path = %ca.cert_path, "Loaded certificate authority");
                Ok(authority)
            }
            None => {
                let authority = Self::generate()?;
                tracing::info!("Generated ephemeral certificate authority");
                Ok(authority)
            }
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Writes the CA certificate so it can be installed in a browser's trust store.
    pub fn write_cert_pem(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.cert_pem.as_bytes())?;
        Ok(())
    }
}

impl CertificateGenerator for CertificateAuthority {
    fn generate(&self, host: &str) -> Result<GeneratedCertificate> {
        let params = leaf_params(host)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer)?;
        Ok(GeneratedCertificate {
            cert_chain: vec![cert.der().clone(), self.cert_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        })
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = name;
    params
}

fn leaf_params(host: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, host);
    params.distinguished_name = name;
    match host.parse::<IpAddr>() {
        Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
        Err(_) => params.subject_alt_names.push(SanType::DnsName(host.try_into()?)),
    }
    Ok(params)
}

fn certified_key(generated: GeneratedCertificate) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&generated.key)?;
    Ok(Arc::new(CertifiedKey::new(generated.cert_chain, signing_key)))
}

/// Leaf certificates shared by the TLS and HTTP/2 listeners.
pub struct CertificateStore {
    generator: Arc<dyn CertificateGenerator>,
    contexts: DashMap<String, Arc<OnceCell<Arc<CertifiedKey>>>>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("hosts", &self.contexts.len())
            .finish()
    }
}

impl CertificateStore {
    pub fn new(generator: Arc<dyn CertificateGenerator>) -> Self {
        Self {
            generator,
            contexts: DashMap::new(),
        }
    }

    /// Makes sure a certificate for `host` exists before the browser's handshake arrives.
    pub async fn add_secure_context(&self, host: &str) -> Result<()> {
        self.certified_key(host).await.map(|_| ())
    }

    /// The context for `host`. Generation happens once; concurrent callers wait on it.
    pub async fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        let cell = Arc::clone(self.contexts.entry(host.clone()).or_default().value());
        let key = cell
            .get_or_try_init(|| {
                let generator = Arc::clone(&self.generator);
                async move {
                    let generated = tokio::task::spawn_blocking(move || generator.generate(&host))
                        .await
                        .map_err(|e| ProxyError::Certificate(format!("certificate task failed: {}", e)))??;
                    certified_key(generated)
                }
            })
            .await?;
        Ok(Arc::clone(key))
    }

    pub fn has_context(&self, host: &str) -> bool {
        self.contexts
            .get(&normalize_host(host))
            .is_some_and(|cell| cell.initialized())
    }

    /// Accepts one client TLS connection.
    ///
    /// The certificate is picked by SNI, falling back to the host the connection
    /// was tunneled for (clients send no SNI for IP literals). `tunnel_host` is
    /// asked only once the ClientHello is in.
    pub async fn accept<IO, F>(&self, io: IO, tunnel_host: F, alpn: &[&[u8]]) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce() -> Option<String>,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
        let host = handshake_host(&start.client_hello(), tunnel_host);
        let key = self.certified_key(&host).await?;
        let config = tls::server_config(Arc::new(PreparedCertificate { host, key }), alpn)?;
        Ok(start.into_stream(config).await?)
    }
}

fn handshake_host<F>(client_hello: &ClientHello<'_>, tunnel_host: F) -> String
where
    F: FnOnce() -> Option<String>,
{
    client_hello
        .server_name()
        .map(str::to_string)
        .or_else(tunnel_host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// The certificate minted for one connection before its handshake continued.
struct PreparedCertificate {
    host: String,
    key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for PreparedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCertificate")
            .field("host", &self.host)
            .finish()
    }
}

impl ResolvesServerCert for PreparedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        inner: CertificateAuthority,
        calls: AtomicUsize,
    }

    impl CertificateGenerator for CountingGenerator {
        fn generate(&self, host: &str) -> Result<GeneratedCertificate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate(host)
        }
    }

    #[test]
    fn leaf_certificates_cover_their_host() {
        let ca = CertificateAuthority::generate().unwrap();
        let leaf = ca.generate("shop.example.com").unwrap();
        assert_eq!(leaf.cert_chain.len(), 2);
        assert!(tls::certificate_valid_for(&leaf.cert_chain, "shop.example.com"));
        assert!(!tls::certificate_valid_for(&leaf.cert_chain, "other.example.com"));

        let ip_leaf = ca.generate("127.0.0.1").unwrap();
        assert!(tls::certificate_valid_for(&ip_leaf.cert_chain, "127.0.0.1"));
    }

    #[test]
    fn authority_round_trips_through_pem() {
        let ca = CertificateAuthority::generate().unwrap();
        let reloaded = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        assert_eq!(reloaded.cert_der(), ca.cert_der());
        assert!(reloaded.generate("a.test").is_ok());
        assert!(CertificateAuthority::from_pem("not pem", ca.key_pem()).is_err());
    }

    #[tokio::test]
    async fn concurrent_contexts_generate_once() {
        let generator = Arc::new(CountingGenerator {
            inner: CertificateAuthority::generate().unwrap(),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(CertificateStore::new(generator.clone()));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.add_secure_context("Example.COM").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(store.has_context("example.com"));
        assert!(store.certified_key("example.com").await.is_ok());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    async fn handshake(
        store: &CertificateStore,
        authority: &CertificateAuthority,
        server_name: &str,
        tunnel_host: Option<&str>,
    ) -> Vec<u8> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let tunnel_host = tunnel_host.map(str::to_string);
        let server = store.accept(server_io, move || tunnel_host, &[tls::ALPN_H2]);

        let mut roots = rustls::RootCertStore::empty();
        roots.add(authority.cert_der().clone()).unwrap();
        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![tls::ALPN_H2.to_vec()];
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string()).unwrap();
        let client = tokio_rustls::TlsConnector::from(Arc::new(config)).connect(name, client_io);

        let (server, client) = tokio::join!(server, client);
        let server = server.unwrap();
        client.unwrap();
        server.get_ref().1.alpn_protocol().unwrap_or_default().to_vec()
    }

    #[tokio::test]
    async fn handshakes_wait_for_their_certificate() {
        let authority = CertificateAuthority::generate().unwrap();
        let generator = Arc::new(CountingGenerator {
            inner: CertificateAuthority::from_pem(authority.cert_pem(), authority.key_pem()).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let store = CertificateStore::new(generator.clone());

        let alpn = handshake(&store, &authority, "shop.example.com", None).await;
        assert_eq!(alpn, tls::ALPN_H2);
        assert!(store.has_context("shop.example.com"));

        // no SNI for an IP literal: the tunneled host decides
        handshake(&store, &authority, "127.0.0.1", Some("127.0.0.1")).await;
        assert!(store.has_context("127.0.0.1"));

        handshake(&store, &authority, "shop.example.com", None).await;
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }
}
