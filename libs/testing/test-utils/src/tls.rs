//! In-process TLS server for exercising client configurations
//!
//! The server presents `server.pem` (`CN=localhost`) and verifies client
//! certificates against `ca.pem`. Handshakes run over `tokio::io::duplex`, so
//! no sockets are opened.

use crate::fixture;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ProtocolVersion, RootCertStore, ServerConfig};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Name the server certificate is issued for
pub const SERVER_NAME: &str = "localhost";

/// How the test server treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// Reject clients without a certificate signed by the test CA
    Required,
    /// Verify a certificate when one is offered
    Optional,
    /// Never ask for one
    None,
}

/// What the server observed after a successful handshake
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Number of certificates in the client's chain (0 when none was sent)
    pub client_certificates: usize,
    pub protocol: Option<ProtocolVersion>,
}

/// Parse every certificate in a PEM fixture
pub fn certs(name: &str) -> Vec<CertificateDer<'static>> {
    CertificateDer::pem_slice_iter(&fixture(name))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| panic!("invalid certificate fixture {}: {:?}", name, e))
}

/// Build the test server configuration
pub fn server_config(auth: ClientAuth) -> Arc<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let key =
        PrivateKeyDer::from_pem_slice(&fixture("server.key")).expect("invalid server key fixture");

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .expect("protocol versions rejected");

    let builder = match auth {
        ClientAuth::None => builder.with_no_client_auth(),
        ClientAuth::Required | ClientAuth::Optional => {
            let mut roots = RootCertStore::empty();
            for cert in certs("ca.pem") {
                roots.add(cert).expect("invalid CA fixture");
            }

            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if auth == ClientAuth::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };

            builder.with_client_cert_verifier(verifier.build().expect("client verifier"))
        }
    };

    let config = builder
        .with_single_cert(certs("server.pem"), key)
        .expect("server certificate rejected");

    Arc::new(config)
}

/// Run a full handshake between `client` and `server` and exchange one byte.
pub async fn handshake(
    client: Arc<rustls::ClientConfig>,
    server: Arc<ServerConfig>,
) -> io::Result<HandshakeOutcome> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let connector = TlsConnector::from(client);
    let acceptor = TlsAcceptor::from(server);
    let name = ServerName::try_from(SERVER_NAME)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let server_side = async move {
        let mut stream = acceptor.accept(server_io).await?;
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;

        let (_, conn) = stream.get_ref();
        let outcome = HandshakeOutcome {
            client_certificates: conn.peer_certificates().map(|c| c.len()).unwrap_or(0),
            protocol: conn.protocol_version(),
        };

        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok::<_, io::Error>(outcome)
    };

    let client_side = async move {
        let mut stream = connector.connect(name, client_io).await?;
        stream.write_all(b"x").await?;
        stream.flush().await?;

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        Ok::<_, io::Error>(())
    };

    let (server_result, client_result) = tokio::join!(server_side, client_side);

    tracing::debug!(
        server_ok = server_result.is_ok(),
        client_ok = client_result.is_ok(),
        "test handshake finished"
    );

    client_result?;
    server_result
}
