use crate::client::{Client, ClientOptions, Producer};
use crate::config::NsqWriterConfig;
use crate::metrics::WriterMetrics;
use async_trait::async_trait;
use ifs::Fs;
use messaging::{AsyncSink, ConnectorError, Service};
use std::sync::Arc;
use tls_config::TlsContext;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Publishes payloads to NSQ topics through a single nsqd.
pub struct NsqWriter<C: Client> {
    config: NsqWriterConfig,
    client: C,
    tls: Option<TlsContext>,
    producer: RwLock<Option<Arc<C::Producer>>>,
    metrics: WriterMetrics,
}

impl<C: Client> NsqWriter<C> {
    pub fn new(config: NsqWriterConfig, client: C, fs: &dyn Fs) -> Result<Self, ConnectorError> {
        config.check()?;
        let tls = config.tls.get(fs).map_err(ConnectorError::config_from)?;

        Ok(Self {
            config,
            client,
            tls,
            producer: RwLock::new(None),
            metrics: WriterMetrics,
        })
    }

    pub fn config(&self) -> &NsqWriterConfig {
        &self.config
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    pub async fn is_connected(&self) -> bool {
        self.producer.read().await.is_some()
    }

    fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions {
            max_in_flight: self.config.max_in_flight,
            tls: self.tls.clone(),
            ..Default::default()
        };
        if !self.config.user_agent.is_empty() {
            options.user_agent = self.config.user_agent.clone();
        }
        options
    }
}

#[async_trait]
impl<C: Client> Service for NsqWriter<C> {
    #[instrument(skip(self), fields(address = %self.config.address))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut slot = self.producer.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let producer = self
            .client
            .new_producer(&self.config.address, &self.client_options())
            .map_err(ConnectorError::connection_from)?;

        if let Err(e) = producer.ping().await {
            producer.stop().await;
            return Err(ConnectorError::connection_from(e));
        }

        *slot = Some(Arc::new(producer));
        info!(tls = self.tls.is_some(), "nsq writer connected");
        Ok(())
    }

    /// Stops the producer and waits for it to finish.
    #[instrument(skip(self), fields(address = %self.config.address))]
    async fn close(&self) -> Result<(), ConnectorError> {
        let mut slot = self.producer.write().await;
        if let Some(producer) = slot.take() {
            producer.stop().await;
            debug!("producer stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Client> AsyncSink for NsqWriter<C> {
    async fn write(&self, topic: &str, payload: &[u8]) -> Result<(), ConnectorError> {
        let producer = self.producer.read().await.clone();
        let Some(producer) = producer else {
            return Err(ConnectorError::NotConnected);
        };

        if topic.is_empty() {
            return Err(ConnectorError::validation("topic is required"));
        }
        if payload.is_empty() {
            return Ok(());
        }

        match producer.publish(topic, payload).await {
            Ok(()) => {
                self.metrics.message_published(topic);
                Ok(())
            }
            Err(e) => {
                self.metrics.publish_failed(topic);
                Err(ConnectorError::publish(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, MessageHandler, MockProducer};
    use crate::memory::MemoryConsumer;
    use ifs::MemFs;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out one prepared mock producer.
    struct MockClient {
        producer: Mutex<Option<MockProducer>>,
        created: AtomicUsize,
    }

    impl MockClient {
        fn with(producer: MockProducer) -> Self {
            Self {
                producer: Mutex::new(Some(producer)),
                created: AtomicUsize::new(0),
            }
        }
    }

    impl Client for MockClient {
        type Consumer = MemoryConsumer;
        type Producer = MockProducer;

        fn new_consumer(
            &self,
            _topic: &str,
            _channel: &str,
            _options: &ClientOptions,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<MemoryConsumer, ClientError> {
            Err(ClientError::Connection("consumers are not mocked".to_string()))
        }

        fn new_producer(
            &self,
            _address: &str,
            _options: &ClientOptions,
        ) -> Result<MockProducer, ClientError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.producer
                .lock()
                .take()
                .ok_or_else(|| ClientError::Connection("no producer left".to_string()))
        }
    }

    fn writer(producer: MockProducer) -> NsqWriter<MockClient> {
        NsqWriter::new(
            NsqWriterConfig::default(),
            MockClient::with(producer),
            &MemFs::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_publishes_payload() {
        let mut producer = MockProducer::new();
        producer.expect_ping().times(1).returning(|| Ok(()));
        producer
            .expect_publish()
            .withf(|topic, body| topic == "events" && body == b"payload")
            .times(1)
            .returning(|_, _| Ok(()));

        let writer = writer(producer);
        writer.connect().await.unwrap();
        writer.write("events", b"payload").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_is_not_published() {
        let mut producer = MockProducer::new();
        producer.expect_ping().returning(|| Ok(()));
        producer.expect_publish().never();

        let writer = writer(producer);
        writer.connect().await.unwrap();
        writer.write("events", b"").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let mut producer = MockProducer::new();
        producer.expect_ping().returning(|| Ok(()));
        producer.expect_publish().never();

        let writer = writer(producer);
        writer.connect().await.unwrap();

        let err = writer.write("", b"payload").await.unwrap_err();
        assert_eq!(err.to_string(), "validation error: topic is required");
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let mut producer = MockProducer::new();
        producer.expect_ping().returning(|| Ok(()));
        producer
            .expect_publish()
            .returning(|_, _| Err(ClientError::Publish("E_BAD_MESSAGE".to_string())));

        let writer = writer(producer);
        writer.connect().await.unwrap();

        let err = writer.write("events", b"payload").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Publish(ref m) if m == "E_BAD_MESSAGE"));
        assert!(err.category().is_retryable());
    }

    #[tokio::test]
    async fn test_ping_failure_stops_producer() {
        let mut producer = MockProducer::new();
        producer
            .expect_ping()
            .returning(|| {
                Err(ClientError::Connection("dial tcp 127.0.0.1:4150: refused".to_string()))
            });
        producer.expect_stop().times(1).returning(|| ());

        let writer = writer(producer);
        let err = writer.connect().await.unwrap_err();

        assert!(matches!(err, ConnectorError::Connection { .. }));
        assert!(!writer.is_connected().await);
        assert!(matches!(
            writer.write("events", b"payload").await,
            Err(ConnectorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut producer = MockProducer::new();
        producer.expect_ping().times(1).returning(|| Ok(()));

        let writer = writer(producer);
        writer.connect().await.unwrap();
        writer.connect().await.unwrap();

        assert_eq!(writer.client.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_stops_producer_before_returning() {
        let mut producer = MockProducer::new();
        producer.expect_ping().returning(|| Ok(()));
        producer.expect_stop().times(1).returning(|| ());

        let writer = writer(producer);
        writer.connect().await.unwrap();
        writer.close().await.unwrap();

        assert!(!writer.is_connected().await);
        assert!(matches!(
            writer.write("events", b"payload").await,
            Err(ConnectorError::NotConnected)
        ));

        // second close has nothing to stop
        writer.close().await.unwrap();
    }
}
