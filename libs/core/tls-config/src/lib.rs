//! Declarative TLS client configuration.
//!
//! [`TlsConfig`] is plain data (env vars or serde); [`TlsConfig::get`] turns
//! it into a [`TlsContext`] holding a `rustls::ClientConfig`. Certificate and
//! key files are read through an [`ifs::Fs`], so tests can supply them from
//! memory.
//!
//! Private keys may be PKCS#1, PKCS#8 or SEC1 PEM, legacy-encrypted PEM
//! (`Proc-Type: 4,ENCRYPTED`, DES/3DES/AES-CBC) or encrypted PKCS#8.
//!
//! # Example
//!
//! ```ignore
//! use core_config::FromEnv;
//! use tls_config::TlsConfig;
//!
//! let config = TlsConfig::from_env()?;
//! if let Some(context) = config.get(&ifs::os())? {
//!     let connector = tokio_rustls::TlsConnector::from(context.client_config());
//! }
//! ```

mod cert;
mod config;
mod context;
mod error;
mod keys;
mod legacy;
mod resolver;
mod verifier;

pub use cert::{load_key_pair, parse_certificates, ClientIdentity};
pub use config::{ClientCertConfig, TlsConfig};
pub use context::TlsContext;
pub use error::TlsError;
pub use keys::{decode_private_key, sec1_to_pkcs8};
