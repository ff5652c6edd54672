//! TLS settings for the wire client.
//!
//! The wire client speaks rustls 0.19, so the material a [`TlsContext`]
//! already decoded (roots, client chains, decrypted keys) is rebuilt into a
//! config of that generation. Nothing is read from disk again.

use crate::client::ClientError;
use rustls::pki_types::PrivateKeyDer;
use rustls_legacy::sign::{self, CertifiedKey};
use rustls_legacy::{
    Certificate, ClientConfig, PrivateKey, ResolvesClientCert, RootCertStore, ServerCertVerified,
    ServerCertVerifier, SignatureScheme, TLSError,
};
use std::net::IpAddr;
use std::sync::Arc;
use tls_config::{ClientIdentity, TlsContext};
use tokio_nsq::NSQConfigSharedTLS;
use tracing::debug;

/// Name presented when verification is off and the host has no DNS name.
const UNVERIFIED_SERVER_NAME: &str = "localhost";

/// A client config shared by every connection of one consumer or producer.
#[derive(Clone)]
pub(super) struct WireTls {
    config: Arc<ClientConfig>,
    skip_verify: bool,
}

impl WireTls {
    pub(super) fn new(context: &TlsContext) -> Result<Self, ClientError> {
        Ok(Self {
            config: Arc::new(client_config(context)?),
            skip_verify: context.insecure_skip_verify(),
        })
    }

    /// Settings for connections to `host`. TLS is required: an nsqd that
    /// does not offer it is treated as unreachable.
    pub(super) fn for_host(&self, host: &str) -> Result<NSQConfigSharedTLS, ClientError> {
        let name = server_name(host, self.skip_verify)?;
        Ok(NSQConfigSharedTLS::new(name)
            .set_required(true)
            .set_client_config(self.config.clone()))
    }

    #[cfg(test)]
    fn config(&self) -> &ClientConfig {
        &self.config
    }
}

fn server_name(host: &str, skip_verify: bool) -> Result<String, ClientError> {
    let is_ip = host.parse::<IpAddr>().is_ok();
    if !is_ip && webpki::DNSNameRef::try_from_ascii_str(host).is_ok() {
        return Ok(host.to_string());
    }
    if skip_verify {
        return Ok(UNVERIFIED_SERVER_NAME.to_string());
    }
    Err(ClientError::Tls(format!(
        "cannot verify the certificate of {host:?}: a DNS name is required"
    )))
}

fn client_config(context: &TlsContext) -> Result<ClientConfig, ClientError> {
    let mut config = ClientConfig::new();

    if context.insecure_skip_verify() {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    } else {
        // native stores may hold roots this webpki generation cannot parse
        let skipped = context
            .root_certificates()
            .iter()
            .filter(|cert| config.root_store.add(&Certificate(cert.to_vec())).is_err())
            .count();
        debug!(
            added = config.root_store.len(),
            skipped,
            "wire client root certificates loaded"
        );
    }

    let keys = context
        .client_identities()
        .iter()
        .map(certified_key)
        .collect::<Result<Vec<_>, _>>()?;
    if !keys.is_empty() {
        config.client_auth_cert_resolver = Arc::new(FirstSupportedCert(keys));
    }

    Ok(config)
}

fn certified_key(identity: &ClientIdentity) -> Result<CertifiedKey, ClientError> {
    // rustls 0.19 reads EC keys from PKCS#8 only
    let der = match &identity.key {
        PrivateKeyDer::Sec1(key) => tls_config::sec1_to_pkcs8(key.secret_sec1_der())
            .map_err(|e| ClientError::Tls(e.to_string()))?,
        key => key.secret_der().to_vec(),
    };

    let key = sign::any_supported_type(&PrivateKey(der))
        .map_err(|()| ClientError::Tls("unsupported client key type".to_string()))?;
    let chain = identity
        .chain
        .iter()
        .map(|cert| Certificate(cert.to_vec()))
        .collect();

    Ok(CertifiedKey::new(chain, Arc::new(key)))
}

struct FirstSupportedCert(Vec<CertifiedKey>);

impl ResolvesClientCert for FirstSupportedCert {
    fn resolve(
        &self,
        _acceptable_issuers: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<CertifiedKey> {
        self.0
            .iter()
            .find(|k| k.key.choose_scheme(sigschemes).is_some())
            .cloned()
    }

    fn has_certs(&self) -> bool {
        !self.0.is_empty()
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifs::MemFs;
    use test_utils::{fixture_str, FIXTURE_PASSWORD};
    use tls_config::{ClientCertConfig, TlsConfig};

    fn context(config: TlsConfig) -> TlsContext {
        TlsConfig {
            enabled: true,
            ..config
        }
        .get(&MemFs::new())
        .unwrap()
        .unwrap()
    }

    fn client_cert(cert: &str, key: &str) -> ClientCertConfig {
        ClientCertConfig {
            cert: Some(fixture_str(cert)),
            key: Some(fixture_str(key)),
            password: Some(FIXTURE_PASSWORD.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_roots_and_keys_carry_over() {
        let context = context(TlsConfig {
            root_cas: Some(fixture_str("ca.pem")),
            client_certs: vec![
                client_cert("client-ec.pem", "client-ec.key"),
                client_cert("client-rsa.pem", "client-rsa-des3.key"),
                client_cert("client-rsa.pem", "client-rsa-pkcs8-enc.key"),
            ],
            ..Default::default()
        });

        let tls = WireTls::new(&context).unwrap();
        assert_eq!(tls.config().root_store.len(), 1);
        assert!(tls.config().client_auth_cert_resolver.has_certs());

        // the EC key only signs ECDSA, the RSA keys only RSA
        let resolver = &tls.config().client_auth_cert_resolver;
        let ec = resolver
            .resolve(&[], &[SignatureScheme::ECDSA_NISTP256_SHA256])
            .unwrap();
        assert_eq!(ec.cert.len(), 1);
        assert!(resolver
            .resolve(&[], &[SignatureScheme::RSA_PSS_SHA256])
            .is_some());
        assert!(resolver
            .resolve(&[], &[SignatureScheme::ED25519])
            .is_none());
    }

    #[test]
    fn test_without_client_certs() {
        let context = context(TlsConfig {
            root_cas: Some(fixture_str("ca.pem")),
            ..Default::default()
        });

        let tls = WireTls::new(&context).unwrap();
        assert!(!tls.config().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_server_name_rules() {
        assert_eq!(server_name("nsqd-0.nsq.svc", false).unwrap(), "nsqd-0.nsq.svc");
        assert_eq!(server_name("localhost", false).unwrap(), "localhost");

        assert_eq!(server_name("127.0.0.1", true).unwrap(), UNVERIFIED_SERVER_NAME);
        assert_eq!(server_name("::1", true).unwrap(), UNVERIFIED_SERVER_NAME);

        let err = server_name("10.0.0.7", false).unwrap_err();
        assert!(matches!(err, ClientError::Tls(_)));
        assert_eq!(
            err.to_string(),
            "tls: cannot verify the certificate of \"10.0.0.7\": a DNS name is required"
        );
    }

    #[test]
    fn test_for_host_checks_the_name() {
        let verified = WireTls::new(&context(TlsConfig {
            root_cas: Some(fixture_str("ca.pem")),
            ..Default::default()
        }))
        .unwrap();
        assert!(verified.for_host("localhost").is_ok());
        assert!(verified.for_host("127.0.0.1").is_err());

        let unverified = WireTls::new(&context(TlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        }))
        .unwrap();
        assert!(unverified.for_host("127.0.0.1").is_ok());
        assert_eq!(unverified.config().root_store.len(), 0);
    }
}
