//! TLS material for encrypted node links.
//!
//! Every node presents a self-signed certificate made from its Ed25519
//! identity key, with the node's unique id as common name. Peers do not check
//! the chain: who a peer is gets settled by the cluster id in the
//! authorization handshake. The TLS handshake signatures are still verified,
//! so the remote end must hold the key of the certificate it presents.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

/// ALPN identifier spoken on encrypted links.
pub const ALPN_FLEET: &[u8] = b"fleet/1";

/// Name every node certificate is issued for and every dialer asks for.
pub const SERVER_NAME: &str = "fleet-node.local";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("tls config rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// A node's certificate and the key it was issued from.
pub struct NodeCertificate {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl NodeCertificate {
    /// Issue a certificate for `node_id` from an Ed25519 PKCS#8 key.
    pub fn issue(node_id: &str, pkcs8_der: &[u8]) -> Result<Self, TlsError> {
        let key = PrivatePkcs8KeyDer::from(pkcs8_der.to_vec());
        let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key, &rcgen::PKCS_ED25519)?;

        let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])?;
        let mut name = rcgen::DistinguishedName::new();
        name.push(rcgen::DnType::CommonName, node_id);
        params.distinguished_name = name;

        let cert = params.self_signed(&key_pair)?;
        Ok(Self {
            cert: cert.der().clone(),
            key,
        })
    }

    pub fn cert_der(&self) -> &[u8] {
        self.cert.as_ref()
    }

    /// rustls config for accepting links with this certificate.
    pub fn server_crypto(&self) -> Result<rustls::ServerConfig, TlsError> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], PrivateKeyDer::Pkcs8(self.key.clone_key()))?;
        config.alpn_protocols = vec![ALPN_FLEET.to_vec()];
        Ok(config)
    }
}

/// rustls config for dialing other nodes.
pub fn client_crypto() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerCertVerifier::new()))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_FLEET.to_vec()];
    config
}

/// Accepts any certificate chain but checks handshake signatures against
/// the presented certificate.
#[derive(Debug)]
struct PeerCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl PeerCertVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
