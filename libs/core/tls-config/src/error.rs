use ifs::FsError;
use thiserror::Error;

/// Errors raised while loading certificates or building a TLS context
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("missing {0} field in client certificate config")]
    MissingField(&'static str),

    #[error("only one field between root_cas and root_cas_file can be specified")]
    ConflictingRootCas,

    #[error("failed to decode private key")]
    DecodeKey,

    #[error("missing password for PKCS#1 encrypted private key")]
    MissingPkcs1Password,

    #[error("failed to decrypt PKCS#1 key: decryption password incorrect")]
    IncorrectPassword,

    #[error("failed to parse encrypted PKCS#1 private key: {0}")]
    LegacyPem(String),

    #[error("failed to parse encrypted PKCS#1 private key: unsupported cipher {0}")]
    UnsupportedCipher(String),

    #[error("missing password for PKCS#8 encrypted private key")]
    MissingPkcs8Password,

    #[error("failed to parse encrypted PKCS#8 private key: {0}")]
    Pkcs8(String),

    #[error("failed to re-encode EC private key: {0}")]
    Sec1(String),

    #[error("unsupported private key type {0}")]
    UnsupportedKeyType(String),

    #[error("no certificates found")]
    NoCertificates,

    #[error("failed to parse certificate: {0}")]
    InvalidCertificate(String),

    #[error("private key does not match certificate")]
    KeyMismatch,

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),
}
