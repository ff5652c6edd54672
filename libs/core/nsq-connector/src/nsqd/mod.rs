//! Wire implementation of the client seam, built on `tokio-nsq`.
//!
//! Each nsqd address gets its own `tokio-nsq` consumer so its TLS server
//! name matches the host being dialed; a set of nsqlookupd addresses shares
//! one. A dispatch task per consumer feeds deliveries to the
//! [`MessageHandler`] one at a time. The library reconnects on its own
//! after a connection drops.
//!
//! Producers dial lazily on `ping` or `publish`, wait for nsqd to answer
//! every publish, and redial after a failure.

mod tls;

use crate::client::{
    deliver, is_valid_channel_name, is_valid_topic_name, Client, ClientError, ClientOptions,
    Consumer, Message, MessageHandler, MessageId, Producer, RequeueDelay, Responder,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tls::WireTls;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_nsq::{
    NSQChannel, NSQConfigShared, NSQConsumerConfig, NSQConsumerConfigSources,
    NSQConsumerLookupConfig, NSQEvent, NSQMessage, NSQProducer, NSQProducerConfig,
    NSQRequeueDelay, NSQTopic,
};
use tracing::{debug, info, warn};

/// Host part of an nsqd `host:port` address.
fn host_of(address: &str) -> &str {
    let address = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address);

    if let Some(bracketed) = address.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    address.rsplit_once(':').map_or(address, |(host, _)| host)
}

/// nsqlookupd HTTP endpoint for a `host:port` address.
fn lookup_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn dial_failed(address: &str, timeout: Duration) -> ClientError {
    ClientError::Connection(format!(
        "dial tcp {address}: no healthy connection within {timeout:?}"
    ))
}

fn invalid(kind: &'static str, name: &str) -> ClientError {
    ClientError::InvalidName {
        kind,
        name: name.to_string(),
    }
}

fn shared_config(
    options: &ClientOptions,
    tls: Option<&WireTls>,
    host: &str,
) -> Result<NSQConfigShared, ClientError> {
    let shared = NSQConfigShared::new().set_user_agent(options.user_agent.clone());
    match tls {
        Some(tls) => Ok(shared.set_tls(tls.for_host(host)?)),
        None => Ok(shared),
    }
}

fn requeue_strategy(delay: RequeueDelay, max_delay: Duration) -> NSQRequeueDelay {
    match delay {
        RequeueDelay::Default => NSQRequeueDelay::DefaultDelay,
        RequeueDelay::After(d) if d.is_zero() => NSQRequeueDelay::NoDelay,
        RequeueDelay::After(d) => NSQRequeueDelay::CustomDelay(d.min(max_delay)),
    }
}

/// Client that talks to real nsqd and nsqlookupd processes.
#[derive(Debug, Clone, Default)]
pub struct NsqdClient;

impl NsqdClient {
    pub fn new() -> Self {
        Self
    }
}

impl Client for NsqdClient {
    type Consumer = NsqdConsumer;
    type Producer = NsqdProducer;

    fn new_consumer(
        &self,
        topic: &str,
        channel: &str,
        options: &ClientOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<NsqdConsumer, ClientError> {
        let topic = NSQTopic::new(topic)
            .filter(|_| is_valid_topic_name(topic))
            .ok_or_else(|| invalid("topic", topic))?;
        let channel = NSQChannel::new(channel)
            .filter(|_| is_valid_channel_name(channel))
            .ok_or_else(|| invalid("channel", channel))?;
        let tls = options.tls.as_ref().map(WireTls::new).transpose()?;

        Ok(NsqdConsumer {
            topic,
            channel,
            options: options.clone(),
            tls,
            handler,
            state: Mutex::new(ConsumerState::default()),
        })
    }

    fn new_producer(
        &self,
        address: &str,
        options: &ClientOptions,
    ) -> Result<NsqdProducer, ClientError> {
        let tls = options.tls.as_ref().map(WireTls::new).transpose()?;
        let shared = shared_config(options, tls.as_ref(), host_of(address))?;

        Ok(NsqdProducer {
            address: address.to_string(),
            shared,
            dial_timeout: options.dial_timeout,
            ack_timeout: options.ack_timeout,
            connection: tokio::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Answers one delivery through the connection it arrived on.
///
/// The library's answers consume the message and are async, so each one
/// runs as a task; whichever takes the message first wins.
struct WireResponder {
    message: Arc<tokio::sync::Mutex<Option<NSQMessage>>>,
    runtime: Handle,
    max_delay: Duration,
}

impl WireResponder {
    fn answer<F, Fut>(&self, respond: F)
    where
        F: FnOnce(NSQMessage) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = self.message.clone();
        self.runtime.spawn(async move {
            let message = slot.lock().await.take();
            if let Some(message) = message {
                respond(message).await;
            }
        });
    }
}

impl Responder for WireResponder {
    fn finish(&self, _id: &MessageId) {
        self.answer(NSQMessage::finish);
    }

    fn requeue(&self, _id: &MessageId, delay: RequeueDelay) {
        let strategy = requeue_strategy(delay, self.max_delay);
        self.answer(move |message| message.requeue(strategy));
    }

    fn touch(&self, _id: &MessageId) {
        let slot = self.message.clone();
        self.runtime.spawn(async move {
            if let Some(message) = slot.lock().await.as_ref() {
                message.touch().await;
            }
        });
    }
}

/// Drains one `tokio-nsq` consumer into the handler.
struct Dispatch {
    handler: Arc<dyn MessageHandler>,
    max_attempts: u16,
    max_requeue_delay: Duration,
    /// What the consumer dials, for logs
    source: String,
    /// Set when the source is a single nsqd
    nsqd_address: String,
    healthy: mpsc::UnboundedSender<()>,
}

impl Dispatch {
    async fn run(self, config: NSQConsumerConfig) {
        let mut consumer = config.build();
        let runtime = Handle::current();
        let mut connected = false;

        while let Some(event) = consumer.consume().await {
            match event {
                NSQEvent::Message(message) => {
                    let message = self.wrap(message, &runtime);
                    deliver(self.handler.as_ref(), message, self.max_attempts).await;
                }
                NSQEvent::Healthy() => {
                    if connected {
                        info!(source = %self.source, "nsq connection re-established");
                    } else {
                        debug!(source = %self.source, "nsq connection healthy");
                    }
                    connected = true;
                    let _ = self.healthy.send(());
                }
                NSQEvent::Unhealthy() => {
                    warn!(source = %self.source, "nsq connection lost, reconnecting");
                }
                NSQEvent::Ok() => {}
            }
        }
    }

    fn wrap(&self, mut message: NSQMessage, runtime: &Handle) -> Arc<Message> {
        let id = MessageId(message.id);
        let body = std::mem::take(&mut message.body);
        let attempts = message.attempt;
        let timestamp = i64::try_from(message.timestamp).unwrap_or(i64::MAX);

        let responder = Arc::new(WireResponder {
            message: Arc::new(tokio::sync::Mutex::new(Some(message))),
            runtime: runtime.clone(),
            max_delay: self.max_requeue_delay,
        });

        Arc::new(
            Message::new(id, body, responder)
                .with_attempts(attempts)
                .with_timestamp(timestamp)
                .with_nsqd_address(self.nsqd_address.clone()),
        )
    }
}

#[derive(Default)]
struct ConsumerState {
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

/// Consumer returned by [`NsqdClient::new_consumer`].
pub struct NsqdConsumer {
    topic: Arc<NSQTopic>,
    channel: Arc<NSQChannel>,
    options: ClientOptions,
    tls: Option<WireTls>,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<ConsumerState>,
}

impl NsqdConsumer {
    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.state.lock().stopped {
            return Err(ClientError::Stopped);
        }
        Ok(())
    }

    /// Start a dispatch task. The receiver sees one value per handshake.
    fn spawn(
        &self,
        sources: NSQConsumerConfigSources,
        max_in_flight: u32,
        host: &str,
        source: String,
        nsqd_address: String,
    ) -> Result<mpsc::UnboundedReceiver<()>, ClientError> {
        let config = NSQConsumerConfig::new(self.topic.clone(), self.channel.clone())
            .set_sources(sources)
            .set_max_in_flight(max_in_flight.max(1))
            .set_base_requeue_interval(self.options.default_requeue_delay)
            .set_max_requeue_interval(self.options.max_requeue_delay)
            .set_shared(shared_config(&self.options, self.tls.as_ref(), host)?);

        let (healthy, healthy_rx) = mpsc::unbounded_channel();
        let dispatch = Dispatch {
            handler: self.handler.clone(),
            max_attempts: self.options.max_attempts,
            max_requeue_delay: self.options.max_requeue_delay,
            source,
            nsqd_address,
            healthy,
        };

        let mut state = self.state.lock();
        if state.stopped {
            return Err(ClientError::Stopped);
        }
        state.tasks.push(tokio::spawn(dispatch.run(config)));
        Ok(healthy_rx)
    }
}

#[async_trait]
impl Consumer for NsqdConsumer {
    /// Returns once every nsqd finished its handshake and subscription, or
    /// fails after `dial_timeout`.
    async fn connect_to_nsqds(&self, addresses: &[String]) -> Result<(), ClientError> {
        self.ensure_running()?;
        if addresses.is_empty() {
            return Ok(());
        }

        // max_in_flight budgets the whole consumer, not each connection
        let per_connection = self.options.max_in_flight / addresses.len() as u32;

        let mut pending = Vec::with_capacity(addresses.len());
        for address in addresses {
            let healthy = self.spawn(
                NSQConsumerConfigSources::Daemons(vec![address.clone()]),
                per_connection,
                host_of(address),
                address.clone(),
                address.clone(),
            )?;
            pending.push((address, healthy));
        }

        let deadline = Instant::now() + self.options.dial_timeout;
        for (address, mut healthy) in pending {
            match tokio::time::timeout_at(deadline, healthy.recv()).await {
                Ok(Some(())) => {}
                _ => return Err(dial_failed(address, self.options.dial_timeout)),
            }
        }
        Ok(())
    }

    /// Starts polling; nsqds are discovered and dialed in the background.
    async fn connect_to_lookupds(&self, addresses: &[String]) -> Result<(), ClientError> {
        self.ensure_running()?;
        let Some(first) = addresses.first() else {
            return Ok(());
        };

        let urls: HashSet<String> = addresses.iter().map(|a| lookup_url(a)).collect();
        let lookup = NSQConsumerLookupConfig::new().set_addresses(urls);

        self.spawn(
            NSQConsumerConfigSources::Lookup(lookup),
            self.options.max_in_flight,
            host_of(first),
            addresses.join(","),
            String::new(),
        )?;
        Ok(())
    }

    /// Unanswered deliveries are requeued by nsqd once the connections
    /// close.
    async fn stop(&self) {
        let tasks = {
            let mut state = self.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.tasks)
        };

        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Producer returned by [`NsqdClient::new_producer`].
pub struct NsqdProducer {
    address: String,
    shared: NSQConfigShared,
    dial_timeout: Duration,
    ack_timeout: Duration,
    connection: tokio::sync::Mutex<Option<NSQProducer>>,
    stopped: AtomicBool,
}

/// Read events until one matches. `false` once the connection is gone.
async fn wait_for(producer: &mut NSQProducer, wanted: fn(&NSQEvent) -> bool) -> bool {
    while let Some(event) = producer.consume().await {
        if wanted(&event) {
            return true;
        }
    }
    false
}

impl NsqdProducer {
    async fn dial(&self) -> Result<NSQProducer, ClientError> {
        let mut producer = NSQProducerConfig::new(self.address.clone())
            .set_shared(self.shared.clone())
            .build();

        let healthy = wait_for(&mut producer, |e| matches!(e, NSQEvent::Healthy()));
        match tokio::time::timeout(self.dial_timeout, healthy).await {
            Ok(true) => {
                debug!(nsqd = %self.address, "producer connected");
                Ok(producer)
            }
            _ => Err(dial_failed(&self.address, self.dial_timeout)),
        }
    }

    async fn connected<'a>(
        &self,
        slot: &'a mut Option<NSQProducer>,
    ) -> Result<&'a mut NSQProducer, ClientError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        if slot.is_none() {
            *slot = Some(self.dial().await?);
        }
        slot.as_mut().ok_or(ClientError::Stopped)
    }
}

#[async_trait]
impl Producer for NsqdProducer {
    async fn ping(&self) -> Result<(), ClientError> {
        let mut slot = self.connection.lock().await;
        self.connected(&mut slot).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), ClientError> {
        let topic = NSQTopic::new(topic)
            .filter(|_| is_valid_topic_name(topic))
            .ok_or_else(|| invalid("topic", topic))?;

        let mut slot = self.connection.lock().await;
        let producer = self.connected(&mut slot).await?;

        if let Err(e) = producer.publish(&topic, body.to_vec()).await {
            *slot = None;
            return Err(ClientError::Publish(format!(
                "publish to {}: {}",
                self.address, e
            )));
        }

        // an error frame from nsqd drops the connection, so no OK arrives
        let acked = wait_for(producer, |e| matches!(e, NSQEvent::Ok()));
        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(true) => Ok(()),
            _ => {
                *slot = None;
                Err(ClientError::Publish(format!(
                    "publish to {}: not acknowledged within {:?}",
                    self.address, self.ack_timeout
                )))
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if self.connection.lock().await.take().is_some() {
            debug!(nsqd = %self.address, "producer disconnected");
        }
    }
}
