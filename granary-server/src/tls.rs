//! Mutual-TLS plumbing for the queue endpoint
//!
//! Peers always present a certificate chain. By default any chain is
//! admitted and the peer is identified by its subject public key; with the
//! peer-CA allowlist enabled, only chains rooted in the operator-supplied
//! PEM file pass the handshake.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use granary_core::{Error, NodeId, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_cert::der::{Decode, Encode};

/// TLS options for the server side.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Server certificate chain (PEM).
    pub cert_path: PathBuf,
    /// Server private key (PEM).
    pub key_path: PathBuf,
    /// Restrict client chains to the allowlist.
    pub use_peer_ca_allowlist: bool,
    /// Operator-supplied allowlist file (PEM); required when the
    /// allowlist is enabled.
    pub peer_ca_allowlist_path: Option<PathBuf>,
}

/// Build the server-side acceptor from file-based configuration.
pub fn acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor> {
    let chain = load_certs(&cfg.cert_path)?;
    let key = load_key(&cfg.key_path)?;
    let allowlist = if cfg.use_peer_ca_allowlist {
        let path = cfg.peer_ca_allowlist_path.as_ref().ok_or_else(|| {
            Error::Config("peer CA allowlist enabled but no allowlist file given".to_string())
        })?;
        Some(load_certs(path)?)
    } else {
        None
    };
    acceptor_from_parts(chain, key, allowlist)
}

/// Build the server-side acceptor from in-memory certificates.
pub fn acceptor_from_parts(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    allowlist: Option<Vec<CertificateDer<'static>>>,
) -> Result<TlsAcceptor> {
    let verifier: Arc<dyn ClientCertVerifier> = match allowlist {
        Some(certs) => {
            let mut roots = RootCertStore::empty();
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| Error::Config(format!("bad allowlist certificate: {e}")))?;
            }
            WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Config(format!("allowlist verifier: {e}")))?
        }
        None => Arc::new(AcceptAnyClientCert::new()),
    };

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| Error::Config(format!("server tls: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side connector that trusts `roots` for the server and
/// presents its own certificate.
pub fn connector_from_parts(
    roots: Vec<CertificateDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsConnector> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store
            .add(cert)
            .map_err(|e| Error::Config(format!("bad root certificate: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::Config(format!("client tls: {e}")))?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a client-side connector from PEM files.
pub fn connector(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<TlsConnector> {
    connector_from_parts(
        load_certs(ca_path)?,
        load_certs(cert_path)?,
        load_key(key_path)?,
    )
}

/// Derive the 32-byte peer identity: the hash of the leaf certificate's
/// subject public key.
pub fn peer_node_id(certs: &[CertificateDer<'_>]) -> Result<NodeId> {
    let leaf = certs
        .first()
        .ok_or_else(|| Error::Unauthorized("peer presented no certificate".to_string()))?;
    let cert = x509_cert::Certificate::from_der(leaf)
        .map_err(|e| Error::Unauthorized(format!("unparseable peer certificate: {e}")))?;
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Unauthorized(format!("unencodable subject key: {e}")))?;
    Ok(NodeId(*blake3::hash(&spki).as_bytes()))
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", path.display())))
}

/// Admits any client chain; identity comes from the subject key, and the
/// allowlist (when enabled) replaces this verifier entirely.
#[derive(Debug)]
struct AcceptAnyClientCert {
    supported: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    fn new() -> AcceptAnyClientCert {
        AcceptAnyClientCert {
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Trusts a pinned set of server certificates by exact bytes; used by
/// dialers that know the node they expect rather than a CA chain.
#[derive(Debug)]
pub struct PinnedServerCert {
    pinned: Vec<CertificateDer<'static>>,
    supported: WebPkiSupportedAlgorithms,
}

impl PinnedServerCert {
    /// Pin the given certificates.
    pub fn new(pinned: Vec<CertificateDer<'static>>) -> PinnedServerCert {
        PinnedServerCert {
            pinned,
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }

    /// A client connector that accepts exactly `pinned` as the server.
    pub fn connector(
        pinned: Vec<CertificateDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<TlsConnector> {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerCert::new(pinned)))
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Config(format!("client tls: {e}")))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self.pinned.iter().any(|cert| cert == end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}
