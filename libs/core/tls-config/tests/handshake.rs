use ifs::MemFs;
use test_utils::tls::{handshake, server_config, ClientAuth};
use test_utils::{fixture_str, init_test_tracing, FIXTURE_PASSWORD};
use tls_config::{ClientCertConfig, TlsConfig};

fn client(cert: &str, key: &str, password: Option<&str>) -> ClientCertConfig {
    ClientCertConfig {
        cert: Some(fixture_str(cert)),
        key: Some(fixture_str(key)),
        password: password.map(str::to_string),
        ..Default::default()
    }
}

fn context(config: TlsConfig) -> std::sync::Arc<rustls::ClientConfig> {
    config
        .get(&MemFs::new())
        .expect("materialize")
        .expect("tls enabled")
        .client_config()
}

#[tokio::test]
async fn test_mutual_tls_with_legacy_encrypted_key() {
    init_test_tracing();

    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        client_certs: vec![client(
            "client-rsa.pem",
            "client-rsa-aes256.key",
            Some(FIXTURE_PASSWORD),
        )],
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::Required))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 1);
    assert_eq!(outcome.protocol, Some(rustls::ProtocolVersion::TLSv1_3));
}

#[tokio::test]
async fn test_mutual_tls_with_encrypted_pkcs8_ec_key() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        client_certs: vec![client(
            "client-ec.pem",
            "client-ec-pkcs8-enc.key",
            Some(FIXTURE_PASSWORD),
        )],
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::Required))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 1);
}

#[tokio::test]
async fn test_mutual_tls_with_encrypted_pkcs8_rsa_key() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        client_certs: vec![client(
            "client-rsa.pem",
            "client-rsa-pkcs8-enc.key",
            Some(FIXTURE_PASSWORD),
        )],
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::Required))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 1);
}

#[tokio::test]
async fn test_mutual_tls_with_des_encrypted_key() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        client_certs: vec![client("client-rsa.pem", "client-rsa-des.key", Some(FIXTURE_PASSWORD))],
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::Required))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 1);
}

#[tokio::test]
async fn test_server_requires_client_certificate() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        ..Default::default()
    };

    let result = handshake(context(config), server_config(ClientAuth::Required)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_optional_client_auth_without_certificate() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("ca.pem")),
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::Optional))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 0);
}

#[tokio::test]
async fn test_untrusted_server_is_rejected() {
    // trusts only a leaf that did not issue the server certificate
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("client-rsa.pem")),
        ..Default::default()
    };

    let result = handshake(context(config), server_config(ClientAuth::None)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_skip_verify_accepts_unknown_server() {
    let config = TlsConfig {
        enabled: true,
        root_cas: Some(fixture_str("client-rsa.pem")),
        insecure_skip_verify: true,
        ..Default::default()
    };

    let outcome = handshake(context(config), server_config(ClientAuth::None))
        .await
        .unwrap();

    assert_eq!(outcome.client_certificates, 0);
}
