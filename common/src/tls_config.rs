use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};

use crate::error::{Result, SocketError};

/// How a TLS client decides whether to trust the server
#[derive(Debug, Clone, Default)]
pub enum ClientTrust {
    /// Accept any server certificate. Encrypts the stream without
    /// authenticating the peer.
    #[default]
    AcceptAny,
    /// Verify the server against CA certificates from a PEM file
    Roots(PathBuf),
}

/// Builds the server context from one PEM file holding both the certificate
/// chain and the private key
pub fn server_config_from_bundle(bundle: &Path) -> Result<Arc<ServerConfig>> {
    tracing::debug!("Loading TLS bundle from {:?}", bundle);
    let pem = fs::read(bundle)
        .map_err(|e| SocketError::Tls(format!("failed to read {bundle:?}: {e}")))?;

    let cert_chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SocketError::Tls(format!("failed to parse certificates in {bundle:?}: {e}")))?;
    if cert_chain.is_empty() {
        return Err(SocketError::Tls(format!("no certificate found in {bundle:?}")));
    }

    let key = private_key(&mut BufReader::new(&*pem))
        .map_err(|e| SocketError::Tls(format!("failed to parse private key in {bundle:?}: {e}")))?
        .ok_or_else(|| SocketError::Tls(format!("no private key found in {bundle:?}")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| SocketError::Tls(format!("invalid certificate/key pair: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds the client context for the given trust mode
pub fn client_config(trust: &ClientTrust) -> Result<Arc<ClientConfig>> {
    let config = match trust {
        ClientTrust::AcceptAny => {
            tracing::warn!("TLS client is not verifying the server certificate");
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth()
        }
        ClientTrust::Roots(ca_path) => {
            let ca_pem = fs::read(ca_path)
                .map_err(|e| SocketError::Tls(format!("failed to read {ca_path:?}: {e}")))?;
            let mut root_store = RootCertStore::empty();
            let ca_certs = certs(&mut BufReader::new(&*ca_pem))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SocketError::Tls(format!("failed to parse {ca_path:?}: {e}")))?;
            root_store.add_parsable_certificates(ca_certs);

            if root_store.is_empty() {
                return Err(SocketError::Tls(format!(
                    "no valid CA certificates found in {ca_path:?}"
                )));
            }

            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Server name presented in the ClientHello. Hosts that are neither DNS names
/// nor IP literals (UNIX socket paths) fall back to `localhost`.
pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .or_else(|_| ServerName::try_from("localhost"))
        .map_err(|e| SocketError::Tls(format!("invalid server name {host:?}: {e}")))
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
