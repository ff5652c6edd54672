use crate::cert::{load_identity, ClientIdentity};
use crate::error::TlsError;
use core_config::{env_bool, env_opt, ConfigError, FromEnv, VarSource};
use ifs::Fs;
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use serde::Deserialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An empty string counts as unset.
fn non_empty<T: AsRef<OsStr>>(value: &Option<T>) -> Option<&T> {
    value.as_ref().filter(|v| !v.as_ref().is_empty())
}

/// TLS settings for a connector.
///
/// `root_cas` (inline PEM) and `root_cas_file` are mutually exclusive. When
/// neither is set the platform trust store is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub root_cas: Option<String>,
    pub root_cas_file: Option<PathBuf>,
    /// Accept any server certificate. Insecure; meant for development only.
    #[serde(rename = "skip_cert_verify", alias = "insecure_skip_verify")]
    pub insecure_skip_verify: bool,
    pub client_certs: Vec<ClientCertConfig>,
    pub enable_renegotiation: bool,
}

impl TlsConfig {
    /// Whether any field asks for TLS regardless of `enabled`.
    pub fn has_settings(&self) -> bool {
        self.root_cas_pem().is_some()
            || self.root_cas_path().is_some()
            || !self.client_certs.is_empty()
            || self.insecure_skip_verify
            || self.enable_renegotiation
    }

    pub fn root_cas_pem(&self) -> Option<&str> {
        non_empty(&self.root_cas).map(String::as_str)
    }

    pub fn root_cas_path(&self) -> Option<&Path> {
        non_empty(&self.root_cas_file).map(PathBuf::as_path)
    }
}

impl FromEnv for TlsConfig {
    fn from_source(source: &dyn VarSource) -> Result<Self, ConfigError> {
        let cert = ClientCertConfig::from_source(source)?;

        Ok(Self {
            enabled: env_bool(source, "TLS_ENABLE", false)?,
            root_cas: env_opt(source, "TLS_ROOTCAS"),
            root_cas_file: env_opt(source, "TLS_ROOTCAS_FILE").map(PathBuf::from),
            insecure_skip_verify: env_bool(source, "TLS_INSECURE_SKIP_VERIFY", false)?,
            client_certs: if cert.is_empty() { Vec::new() } else { vec![cert] },
            enable_renegotiation: env_bool(source, "TLS_ENABLE_RENEGOTIATION", false)?,
        })
    }
}

/// One client certificate, sourced either from files or inline PEM.
///
/// Setting either file field selects file mode; both must then be present.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientCertConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub cert: Option<String>,
    pub key: Option<String>,
    /// Password for an encrypted key
    pub password: Option<String>,
}

impl ClientCertConfig {
    fn is_empty(&self) -> bool {
        non_empty(&self.cert_file).is_none()
            && non_empty(&self.key_file).is_none()
            && non_empty(&self.cert).is_none()
            && non_empty(&self.key).is_none()
    }

    /// Load the certificate chain and private key, decrypting the key when
    /// needed. Files are read through `fs`.
    pub fn load(&self, fs: &dyn Fs) -> Result<Arc<CertifiedKey>, TlsError> {
        self.load_with_provider(fs, &rustls::crypto::ring::default_provider())
            .map(|(certified, _)| certified)
    }

    pub(crate) fn load_with_provider(
        &self,
        fs: &dyn Fs,
        provider: &CryptoProvider,
    ) -> Result<(Arc<CertifiedKey>, ClientIdentity), TlsError> {
        let password = self.password.as_deref();
        let cert_file = non_empty(&self.cert_file);
        let key_file = non_empty(&self.key_file);

        if cert_file.is_some() || key_file.is_some() {
            let cert_file = cert_file.ok_or(TlsError::MissingField("cert_file"))?;
            let key_file = key_file.ok_or(TlsError::MissingField("key_file"))?;

            let cert = fs.read_file(cert_file)?;
            let key = fs.read_file(key_file)?;

            tracing::debug!(
                cert_file = %cert_file.display(),
                key_file = %key_file.display(),
                "loading client certificate from files"
            );
            return load_identity(provider, &cert, &key, password);
        }

        let cert = non_empty(&self.cert).ok_or(TlsError::MissingField("cert"))?;
        let key = non_empty(&self.key).ok_or(TlsError::MissingField("key"))?;

        load_identity(provider, cert.as_bytes(), key.as_bytes(), password)
    }
}

impl FromEnv for ClientCertConfig {
    fn from_source(source: &dyn VarSource) -> Result<Self, ConfigError> {
        Ok(Self {
            cert_file: env_opt(source, "TLS_CERT_FILE").map(PathBuf::from),
            key_file: env_opt(source, "TLS_KEY_FILE").map(PathBuf::from),
            cert: env_opt(source, "TLS_CERT"),
            key: env_opt(source, "TLS_KEY"),
            password: env_opt(source, "TLS_PASSWORD"),
        })
    }
}

impl fmt::Debug for ClientCertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertConfig")
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("cert", &self.cert.as_ref().map(|_| "<pem>"))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
