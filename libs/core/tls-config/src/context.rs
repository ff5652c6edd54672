use crate::cert::ClientIdentity;
use crate::config::TlsConfig;
use crate::error::TlsError;
use crate::resolver::FirstSupportedCert;
use crate::verifier::NoServerVerification;
use ifs::Fs;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// A materialized, immutable TLS client configuration.
#[derive(Debug, Clone)]
pub struct TlsContext {
    client_config: Arc<ClientConfig>,
    roots: Arc<[CertificateDer<'static>]>,
    identities: Arc<[ClientIdentity]>,
    insecure_skip_verify: bool,
    renegotiation: bool,
}

impl TlsContext {
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Number of client certificates on offer.
    pub fn client_cert_count(&self) -> usize {
        self.identities.len()
    }

    /// Trust anchors the client config verifies against, as DER. Empty when
    /// verification is skipped.
    pub fn root_certificates(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }

    /// Client certificates in the order they are offered.
    pub fn client_identities(&self) -> &[ClientIdentity] {
        &self.identities
    }

    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    /// Whether renegotiation was requested. The TLS stack never
    /// renegotiates, so this is informational only.
    pub fn renegotiation_enabled(&self) -> bool {
        self.renegotiation
    }
}

impl TlsConfig {
    /// Materialize the configuration, or `None` when TLS is disabled.
    ///
    /// An enabled configuration without any other settings yields a default
    /// context (platform roots, no client certificate).
    pub fn get(&self, fs: &dyn Fs) -> Result<Option<TlsContext>, TlsError> {
        if !self.enabled {
            return Ok(None);
        }
        self.materialize(fs).map(Some)
    }

    /// Materialize the configuration ignoring `enabled`.
    ///
    /// Returns `None` when no field asks for TLS.
    pub fn get_non_toggled(&self, fs: &dyn Fs) -> Result<Option<TlsContext>, TlsError> {
        if !self.has_settings() {
            return Ok(None);
        }
        self.materialize(fs).map(Some)
    }

    fn materialize(&self, fs: &dyn Fs) -> Result<TlsContext, TlsError> {
        if self.root_cas_pem().is_some() && self.root_cas_path().is_some() {
            return Err(TlsError::ConflictingRootCas);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let explicit_roots = match (self.root_cas_pem(), self.root_cas_path()) {
            (Some(pem), None) => Some(root_certificates(pem.as_bytes())),
            (None, Some(path)) => Some(root_certificates(&fs.read_file(path)?)),
            _ => None,
        };

        let (keys, identities): (Vec<_>, Vec<_>) = self
            .client_certs
            .iter()
            .map(|cert| cert.load_with_provider(fs, &provider))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();

        if self.enable_renegotiation {
            tracing::warn!("TLS renegotiation requested but not supported, ignoring");
        }

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?;

        let (builder, roots) = if self.insecure_skip_verify {
            tracing::warn!("TLS server certificate verification is disabled");
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoServerVerification::new(provider)));
            (builder, Vec::new())
        } else {
            let roots = explicit_roots.unwrap_or_else(native_root_certificates);
            (builder.with_root_certificates(root_store(&roots)), roots)
        };

        let config = if keys.is_empty() {
            builder.with_no_client_auth()
        } else {
            builder.with_client_cert_resolver(Arc::new(FirstSupportedCert::new(keys)))
        };

        tracing::debug!(
            client_certs = identities.len(),
            roots = roots.len(),
            insecure_skip_verify = self.insecure_skip_verify,
            "TLS client configuration ready"
        );

        Ok(TlsContext {
            client_config: Arc::new(config),
            roots: roots.into(),
            identities: identities.into(),
            insecure_skip_verify: self.insecure_skip_verify,
            renegotiation: self.enable_renegotiation,
        })
    }
}

/// Collect the certificates in a PEM bundle, stopping at malformed PEM.
fn root_certificates(pem_bytes: &[u8]) -> Vec<CertificateDer<'static>> {
    let mut certs = Vec::new();

    for item in CertificateDer::pem_slice_iter(pem_bytes) {
        match item {
            Ok(cert) => certs.push(cert),
            Err(e) => {
                tracing::debug!(error = ?e, "stopping at malformed PEM in root certificates");
                break;
            }
        }
    }

    certs
}

/// Build a root store, skipping anything that is not a usable certificate.
fn root_store(certs: &[CertificateDer<'static>]) -> RootCertStore {
    let mut roots = RootCertStore::empty();

    for cert in certs {
        if let Err(e) = roots.add(cert.clone()) {
            tracing::debug!(error = %e, "skipping unusable root certificate");
        }
    }

    roots
}

fn native_root_certificates() -> Vec<CertificateDer<'static>> {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            tracing::debug!(count = certs.len(), "loaded platform root certificates");
            certs
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load platform root certificates");
            Vec::new()
        }
    }
}
