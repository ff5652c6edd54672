use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::sync::Arc;

/// Offers the first configured certificate whose key can sign with one of
/// the schemes the server accepts.
#[derive(Debug)]
pub(crate) struct FirstSupportedCert {
    keys: Vec<Arc<CertifiedKey>>,
}

impl FirstSupportedCert {
    pub(crate) fn new(keys: Vec<Arc<CertifiedKey>>) -> Self {
        Self { keys }
    }
}

impl ResolvesClientCert for FirstSupportedCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.keys
            .iter()
            .find(|k| k.key.choose_scheme(sigschemes).is_some())
            .cloned()
    }

    fn has_certs(&self) -> bool {
        !self.keys.is_empty()
    }
}
