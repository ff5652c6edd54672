use ifs::MemFs;
use messaging::{Async, AsyncSink, ConnectorError, Service};
use nsq_connector::{MemoryBroker, NsqReader, NsqReaderConfig, NsqWriter, NsqWriterConfig};
use std::time::Duration;
use test_utils::{fixture_path, FIXTURE_PASSWORD};
use tls_config::{ClientCertConfig, TlsConfig};

fn writer(broker: &MemoryBroker, address: &str) -> NsqWriter<MemoryBroker> {
    NsqWriter::new(
        NsqWriterConfig {
            address: address.to_string(),
            ..Default::default()
        },
        broker.clone(),
        &MemFs::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_written_messages_reach_reader() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "127.0.0.1:4150");
    writer.connect().await.unwrap();

    let reader = NsqReader::new(
        NsqReaderConfig {
            topic: "orders".to_string(),
            channel: "billing".to_string(),
            ..Default::default()
        },
        broker.clone(),
        &MemFs::new(),
    )
    .unwrap();
    reader.connect().await.unwrap();

    writer.write("orders", b"{\"id\":1}").await.unwrap();
    writer.write("orders", b"").await.unwrap();
    writer.write("orders", b"{\"id\":2}").await.unwrap();

    for expected in [&b"{\"id\":1}"[..], &b"{\"id\":2}"[..]] {
        let (message, ack) = reader
            .read_batch(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(message.body, expected);
        ack(Ok(())).unwrap();
    }

    // the empty payload was never published
    assert!(reader
        .read_batch(Some(Duration::from_millis(20)))
        .await
        .is_err_and(|e| e.is_timeout()));

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_write_before_connect() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "127.0.0.1:4150");

    let err = writer.write("orders", b"payload").await.unwrap_err();
    assert!(matches!(err, ConnectorError::NotConnected));
    assert_eq!(err.to_string(), "not connected to target source or sink");
}

#[tokio::test]
async fn test_not_connected_is_checked_before_topic() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "127.0.0.1:4150");

    assert!(matches!(
        writer.write("", b"payload").await,
        Err(ConnectorError::NotConnected)
    ));

    writer.connect().await.unwrap();
    assert!(matches!(
        writer.write("", b"payload").await,
        Err(ConnectorError::Validation(_))
    ));
}

#[tokio::test]
async fn test_connect_to_unknown_nsqd_fails() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "10.1.1.1:4150");

    let err = writer.connect().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "connection error: dial tcp 10.1.1.1:4150: connection refused"
    );
    assert!(!writer.is_connected().await);
}

#[tokio::test]
async fn test_publish_to_lost_nsqd() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "127.0.0.1:4150");
    writer.connect().await.unwrap();

    broker.remove_nsqd("127.0.0.1:4150");

    let err = writer.write("orders", b"payload").await.unwrap_err();
    assert!(matches!(err, ConnectorError::Publish(_)));
    assert_eq!(broker.backlog("orders"), 0);
}

#[tokio::test]
async fn test_close_completes_teardown() {
    let broker = MemoryBroker::local();
    let writer = writer(&broker, "127.0.0.1:4150");

    writer.close().await.unwrap();

    writer.connect().await.unwrap();
    writer.write("orders", b"before").await.unwrap();
    writer.close().await.unwrap();

    assert!(!writer.is_connected().await);
    assert!(matches!(
        writer.write("orders", b"after").await,
        Err(ConnectorError::NotConnected)
    ));
    assert_eq!(broker.backlog("orders"), 1);

    // a closed writer can connect again
    writer.connect().await.unwrap();
    writer.write("orders", b"again").await.unwrap();
    assert_eq!(broker.backlog("orders"), 2);
}

#[test]
fn test_address_is_required() {
    let err = NsqWriter::new(
        NsqWriterConfig {
            address: String::new(),
            ..Default::default()
        },
        MemoryBroker::local(),
        &MemFs::new(),
    )
    .err()
    .unwrap();

    assert_eq!(err.to_string(), "validation error: nsq address is required");
}

#[tokio::test]
async fn test_tls_with_encrypted_client_key() {
    let writer = NsqWriter::new(
        NsqWriterConfig {
            tls: TlsConfig {
                enabled: true,
                root_cas_file: Some(fixture_path("ca.pem")),
                client_certs: vec![ClientCertConfig {
                    cert_file: Some(fixture_path("client-rsa.pem")),
                    key_file: Some(fixture_path("client-rsa-des3.key")),
                    password: Some(FIXTURE_PASSWORD.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
        MemoryBroker::local(),
        &ifs::os(),
    )
    .unwrap();

    assert_eq!(writer.tls().unwrap().client_cert_count(), 1);
    writer.connect().await.unwrap();
    writer.close().await.unwrap();

    let err = NsqWriter::new(
        NsqWriterConfig {
            tls: TlsConfig {
                enabled: true,
                client_certs: vec![ClientCertConfig {
                    cert_file: Some(fixture_path("client-rsa.pem")),
                    key_file: Some(fixture_path("client-rsa-des3.key")),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
        MemoryBroker::local(),
        &ifs::os(),
    )
    .err()
    .unwrap();

    assert_eq!(
        err.to_string(),
        "configuration error: missing password for PKCS#1 encrypted private key"
    );
}
