use crate::error::TlsError;
use crate::keys::decode_private_key;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// A client certificate chain together with its decrypted private key.
///
/// Kept alongside the signing key so other TLS stacks can be fed the same
/// material.
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain", &self.chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Parse a PEM certificate chain, leaf first.
pub fn parse_certificates(pem_bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let chain = CertificateDer::pem_slice_iter(pem_bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(format!("{e:?}")))?;

    if chain.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(chain)
}

/// Pair a certificate chain with its (possibly encrypted) private key.
///
/// The key is loaded through `provider` and must match the leaf's public key.
pub fn load_key_pair(
    provider: &CryptoProvider,
    cert_pem: &[u8],
    key_pem: &[u8],
    password: Option<&str>,
) -> Result<Arc<CertifiedKey>, TlsError> {
    load_identity(provider, cert_pem, key_pem, password).map(|(certified, _)| certified)
}

pub(crate) fn load_identity(
    provider: &CryptoProvider,
    cert_pem: &[u8],
    key_pem: &[u8],
    password: Option<&str>,
) -> Result<(Arc<CertifiedKey>, ClientIdentity), TlsError> {
    let key = decode_private_key(key_pem, password)?;
    let chain = parse_certificates(cert_pem)?;

    let signing_key = provider.key_provider.load_private_key(key.clone_key())?;
    let certified = CertifiedKey::new(chain.clone(), signing_key);

    match certified.keys_match() {
        Ok(()) => {}
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::KeyMismatch)) => {
            return Err(TlsError::KeyMismatch);
        }
        Err(rustls::Error::InconsistentKeys(_)) => {
            tracing::debug!("signing key does not expose a public key, skipping match check");
        }
        Err(e) => return Err(e.into()),
    }

    Ok((Arc::new(certified), ClientIdentity { chain, key }))
}
