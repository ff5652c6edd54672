use crate::client::{Client, ClientOptions, Consumer, Message, MessageHandler, RequeueDelay};
use crate::config::NsqReaderConfig;
use crate::metrics::ReaderMetrics;
use crate::rendezvous::Rendezvous;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use ifs::Fs;
use messaging::{AckFn, Async, BoxError, ConnectorError, Service};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tls_config::TlsContext;
use tracing::{debug, info, instrument, trace, warn};

/// The handler registered with the consumer.
///
/// Delivery blocks in `handle_message` until a reader takes the message or
/// shutdown starts, which is what turns the client's push into a pull.
struct Inbox {
    rendezvous: Rendezvous<Arc<Message>>,
    shutdown: Shutdown,
    metrics: ReaderMetrics,
}

impl Inbox {
    /// Requeue `message` unless something already answered it.
    fn give_back(&self, message: &Message, reason: &'static str) -> bool {
        let requeued = message.requeue(RequeueDelay::Default);
        message.finish();
        if requeued {
            self.metrics.message_requeued(reason);
        }
        requeued
    }
}

#[async_trait]
impl MessageHandler for Inbox {
    async fn handle_message(&self, message: Arc<Message>) -> Result<(), BoxError> {
        message.disable_auto_response();
        self.metrics.message_received();

        let taken = self
            .rendezvous
            .send_until(message.clone(), self.shutdown.wait())
            .await;

        // a message that reached a reader is that reader's to answer
        if !taken {
            self.give_back(&message, "shutdown");
        }
        Ok(())
    }

    fn log_failed_message(&self, message: &Message) {
        warn!(
            id = %message.id,
            attempts = message.attempts,
            "message exceeded max attempts, discarding"
        );
        self.metrics.failed_attempts();
    }
}

/// Reads messages from an NSQ topic/channel subscription.
///
/// Each message returned by [`read_batch`](Async::read_batch) stays
/// unacknowledged until its [`AckFn`] runs. On shutdown every
/// unacknowledged message is requeued.
pub struct NsqReader<C: Client> {
    config: NsqReaderConfig,
    client: C,
    tls: Option<TlsContext>,
    consumer: tokio::sync::Mutex<Option<C::Consumer>>,
    unacked: Arc<Mutex<Vec<Arc<Message>>>>,
    inbox: Arc<Inbox>,
    metrics: ReaderMetrics,
}

impl<C: Client> NsqReader<C> {
    /// Validate `config` and build its TLS context. Files named by the TLS
    /// settings are read through `fs`.
    pub fn new(config: NsqReaderConfig, client: C, fs: &dyn Fs) -> Result<Self, ConnectorError> {
        config.check()?;
        let tls = config.tls.get(fs).map_err(ConnectorError::config_from)?;

        let metrics = ReaderMetrics::new(&config.topic, &config.channel);
        let inbox = Arc::new(Inbox {
            rendezvous: Rendezvous::new(),
            shutdown: Shutdown::new(),
            metrics: metrics.clone(),
        });

        Ok(Self {
            config,
            client,
            tls,
            consumer: tokio::sync::Mutex::new(None),
            unacked: Arc::new(Mutex::new(Vec::new())),
            inbox,
            metrics,
        })
    }

    pub fn config(&self) -> &NsqReaderConfig {
        &self.config
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    /// Messages handed out and not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().len()
    }

    pub async fn is_connected(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions {
            max_in_flight: self.config.max_in_flight,
            max_attempts: self.config.max_attempts,
            tls: self.tls.clone(),
            ..Default::default()
        };
        if !self.config.user_agent.is_empty() {
            options.user_agent = self.config.user_agent.clone();
        }
        options
    }

    async fn read(&self, timeout: Option<Duration>) -> Result<Arc<Message>, ConnectorError> {
        let deadline = async {
            match timeout {
                Some(t) if t.is_zero() => {}
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.inbox.shutdown.wait() => {
                self.drain().await;
                Err(ConnectorError::Closed)
            }
            message = self.inbox.rendezvous.recv() => message.ok_or(ConnectorError::Closed),
            _ = deadline => {
                trace!(?timeout, "read timed out");
                Err(ConnectorError::Timeout)
            }
        }
    }

    /// Requeue everything handed out, then drop the consumer.
    ///
    /// Parked offers are only dropped; their handlers give them back.
    async fn drain(&self) {
        let pending = std::mem::take(&mut *self.unacked.lock());
        let parked = self.inbox.rendezvous.drain().await.len();

        let requeued = pending
            .iter()
            .filter(|message| self.inbox.give_back(message, "shutdown"))
            .count();
        if requeued > 0 || parked > 0 {
            info!(requeued, parked, "released pending messages on shutdown");
        }

        self.disconnect().await;
    }

    async fn disconnect(&self) {
        let mut consumer = self.consumer.lock().await;
        if let Some(consumer) = consumer.take() {
            consumer.stop().await;
            debug!(topic = %self.config.topic, channel = %self.config.channel, "consumer stopped");
        }
    }
}

#[async_trait]
impl<C: Client> Service for NsqReader<C> {
    #[instrument(skip(self), fields(topic = %self.config.topic, channel = %self.config.channel))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut slot = self.consumer.lock().await;

        if self.inbox.shutdown.is_triggered() {
            return Err(ConnectorError::Closed);
        }
        if slot.is_some() {
            return Ok(());
        }

        let handler: Arc<dyn MessageHandler> = self.inbox.clone();
        let consumer = self
            .client
            .new_consumer(
                &self.config.topic,
                &self.config.channel,
                &self.client_options(),
                handler,
            )
            .map_err(ConnectorError::connection_from)?;

        if let Err(e) = consumer.connect_to_nsqds(&self.config.addresses).await {
            consumer.stop().await;
            return Err(ConnectorError::connection_from(e));
        }

        if let Err(e) = consumer
            .connect_to_lookupds(&self.config.lookup_addresses)
            .await
        {
            consumer.stop().await;
            return Err(ConnectorError::connection_from(e));
        }

        *slot = Some(consumer);
        info!(
            nsqds = ?self.config.addresses,
            lookupds = ?self.config.lookup_addresses,
            tls = self.tls.is_some(),
            "nsq reader connected"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(topic = %self.config.topic, channel = %self.config.channel))]
    async fn close(&self) -> Result<(), ConnectorError> {
        if self.inbox.shutdown.trigger() {
            info!("nsq reader shutting down");
        }
        self.disconnect().await;
        Ok(())
    }
}

#[async_trait]
impl<C: Client> Async for NsqReader<C> {
    type Message = Arc<Message>;

    async fn read_batch(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Self::Message, AckFn), ConnectorError> {
        let message = self.read(timeout).await?;
        self.unacked.lock().push(message.clone());

        let unacked = self.unacked.clone();
        let metrics = self.metrics.clone();
        let handed_out = message.clone();

        let ack: AckFn = Box::new(move |result: Result<(), BoxError>| {
            match result {
                Ok(()) => {
                    if handed_out.finish() {
                        metrics.message_acked();
                    }
                }
                Err(e) => {
                    debug!(id = %handed_out.id, error = %e, "message nacked, requeueing");
                    if handed_out.requeue(RequeueDelay::Default) {
                        metrics.message_requeued("nack");
                    }
                    handed_out.finish();
                }
            }
            unacked.lock().retain(|m| !Arc::ptr_eq(m, &handed_out));
            Ok(())
        });

        Ok((message, ack))
    }
}
