//! Shared test utilities for connector testing
//!
//! This crate provides reusable test infrastructure for the workspace crates:
//! - `fixture`, `fixture_str`, `fixture_path`: PEM certificates and keys
//!   (plain, legacy-encrypted and PKCS#8-encrypted) signed by a test CA
//! - `tls`: an in-process TLS server and a duplex handshake driver
//! - `nsqd`: a fake nsqd on a loopback port for wire client tests
//! - `init_test_tracing`: log output captured by the test harness
//!
//! # Fixtures
//!
//! | File | Contents |
//! |---|---|
//! | `ca.pem` | test CA (`CN=nsq-test-ca`) |
//! | `server.pem` / `server.key` | `CN=localhost`, signed by the CA |
//! | `client-rsa.pem` / `client-rsa.key` | RSA client pair, PKCS#1 key |
//! | `client-rsa-aes256.key` | same key, legacy PEM encryption (AES-256-CBC) |
//! | `client-rsa-des3.key` | same key, legacy PEM encryption (DES-EDE3-CBC) |
//! | `client-rsa-des.key` | same key, legacy PEM encryption (DES-CBC) |
//! | `client-rsa-pkcs8-enc.key` | same key, encrypted PKCS#8 (PBES2) |
//! | `client-ec.pem` / `client-ec.key` | P-256 client pair, SEC1 key |
//! | `client-ec-aes128.key` | same key, legacy PEM encryption (AES-128-CBC) |
//! | `client-ec-aes192.key` | same key, legacy PEM encryption (AES-192-CBC) |
//! | `client-ec-pkcs8.key` | same key, plain PKCS#8 |
//! | `client-ec-pkcs8-enc.key` | same key, encrypted PKCS#8 (PBES2) |
//!
//! Every encrypted key uses [`FIXTURE_PASSWORD`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{fixture_str, tls};
//!
//! #[tokio::test]
//! async fn my_tls_test() {
//!     let server = tls::server_config(tls::ClientAuth::Required);
//!     let client = build_client_config(fixture_str("ca.pem"));
//!
//!     let outcome = tls::handshake(client, server).await.unwrap();
//!     assert_eq!(outcome.client_certificates, 1);
//! }
//! ```

use std::path::PathBuf;

pub mod nsqd;
pub mod tls;

/// Password protecting every encrypted key fixture
pub const FIXTURE_PASSWORD: &str = "nsq-secret";

/// Absolute path of a fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

/// Raw bytes of a fixture file
pub fn fixture(name: &str) -> Vec<u8> {
    let path = fixture_path(name);
    std::fs::read(&path)
        .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
}

/// Fixture file as UTF-8 text
pub fn fixture_str(name: &str) -> String {
    String::from_utf8(fixture(name)).unwrap_or_else(|_| panic!("fixture {} is not UTF-8", name))
}

/// Install a test-friendly subscriber once per process
///
/// Respects `RUST_LOG`; defaults to `debug`. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
