//! In-process implementation of the client seam.
//!
//! `MemoryBroker` behaves like a small nsqd/nsqlookupd cluster: topics fan
//! out to channels, each delivery bumps the attempt counter, in-flight
//! messages are bounded per consumer, and requeues back off the way the
//! real client computes it. It is meant for tests and local runs.

use crate::client::{
    deliver, is_valid_channel_name, is_valid_topic_name, Client, ClientError, ClientOptions,
    Consumer, Message, MessageHandler, MessageId, Producer, RequeueDelay, Responder,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Point-in-time counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Ready plus deferred messages
    pub depth: usize,
    pub in_flight: usize,
    pub finished: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone)]
struct Envelope {
    id: MessageId,
    body: Vec<u8>,
    timestamp: i64,
    attempts: u16,
}

struct InFlight {
    consumer: u64,
    envelope: Envelope,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct ChannelQueue {
    ready: VecDeque<Envelope>,
    deferred: Vec<(Instant, Envelope)>,
    in_flight: HashMap<MessageId, InFlight>,
    finished: u64,
    requeued: u64,
}

impl ChannelQueue {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].0 <= now {
                let (_, envelope) = self.deferred.swap_remove(i);
                self.ready.push_back(envelope);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.deferred.iter().map(|(at, _)| *at).min()
    }
}

#[derive(Default)]
struct Channel {
    queue: Mutex<ChannelQueue>,
    notify: Notify,
}

impl Channel {
    fn push(&self, envelope: Envelope) {
        self.queue.lock().ready.push_back(envelope);
        self.notify.notify_waiters();
    }

    /// Wait for the next deliverable message and mark it in flight.
    async fn next(&self, consumer: u64, permit: OwnedSemaphorePermit) -> Envelope {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut queue = self.queue.lock();
                queue.promote_due(Instant::now());

                if let Some(mut envelope) = queue.ready.pop_front() {
                    envelope.attempts = envelope.attempts.saturating_add(1);
                    queue.in_flight.insert(
                        envelope.id,
                        InFlight {
                            consumer,
                            envelope: envelope.clone(),
                            _permit: permit,
                        },
                    );
                    return envelope;
                }
                queue.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn take_in_flight(&self, consumer: u64, id: &MessageId) -> Option<InFlight> {
        let mut queue = self.queue.lock();
        match queue.in_flight.get(id) {
            Some(entry) if entry.consumer == consumer => queue.in_flight.remove(id),
            _ => None,
        }
    }

    fn finish(&self, consumer: u64, id: &MessageId) {
        if self.take_in_flight(consumer, id).is_some() {
            self.queue.lock().finished += 1;
        }
    }

    fn requeue(&self, consumer: u64, id: &MessageId, delay: impl FnOnce(u16) -> Duration) {
        let Some(entry) = self.take_in_flight(consumer, id) else {
            return;
        };
        let delay = delay(entry.envelope.attempts);

        {
            let mut queue = self.queue.lock();
            queue.requeued += 1;
            if delay.is_zero() {
                queue.ready.push_back(entry.envelope);
            } else {
                queue
                    .deferred
                    .push((Instant::now() + delay, entry.envelope));
            }
        }
        self.notify.notify_waiters();
    }

    /// Put every message held by `consumer` back at the head of the queue.
    fn release(&self, consumer: u64) -> usize {
        let released = {
            let mut queue = self.queue.lock();
            let ids: Vec<MessageId> = queue
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.consumer == consumer)
                .map(|(id, _)| *id)
                .collect();

            for id in &ids {
                if let Some(entry) = queue.in_flight.remove(id) {
                    queue.ready.push_front(entry.envelope);
                }
            }
            ids.len()
        };

        if released > 0 {
            self.notify.notify_waiters();
        }
        released
    }

    fn stats(&self) -> ChannelStats {
        let queue = self.queue.lock();
        ChannelStats {
            depth: queue.ready.len() + queue.deferred.len(),
            in_flight: queue.in_flight.len(),
            finished: queue.finished,
            requeued: queue.requeued,
        }
    }
}

#[derive(Default)]
struct Topic {
    backlog: VecDeque<Envelope>,
    channels: HashMap<String, Arc<Channel>>,
}

#[derive(Default)]
struct BrokerState {
    nsqds: BTreeSet<String>,
    lookupds: BTreeSet<String>,
    topics: HashMap<String, Topic>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    sequence: AtomicU64,
    consumers: AtomicU64,
}

impl BrokerInner {
    fn has_nsqd(&self, address: &str) -> bool {
        self.state.lock().nsqds.contains(address)
    }

    fn has_lookupd(&self, address: &str) -> bool {
        self.state.lock().lookupds.contains(address)
    }

    fn first_nsqd(&self) -> Option<String> {
        self.state.lock().nsqds.iter().next().cloned()
    }

    /// Create the channel if needed. The first channel of a topic takes
    /// over everything published before it existed.
    fn subscribe(&self, topic: &str, channel: &str) -> Arc<Channel> {
        let mut state = self.state.lock();
        let topic = state.topics.entry(topic.to_string()).or_default();

        if let Some(existing) = topic.channels.get(channel) {
            return existing.clone();
        }

        let created = Arc::new(Channel::default());
        if topic.channels.is_empty() {
            created.queue.lock().ready.extend(topic.backlog.drain(..));
        }
        topic.channels.insert(channel.to_string(), created.clone());
        created
    }

    fn publish(&self, topic: &str, body: &[u8]) -> MessageId {
        let id = MessageId::from_sequence(self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        let envelope = Envelope {
            id,
            body: body.to_vec(),
            timestamp: now_nanos(),
            attempts: 0,
        };

        let channels: Vec<Arc<Channel>> = {
            let mut state = self.state.lock();
            let topic = state.topics.entry(topic.to_string()).or_default();
            if topic.channels.is_empty() {
                topic.backlog.push_back(envelope);
                return id;
            }
            topic.channels.values().cloned().collect()
        };

        for channel in channels {
            channel.push(envelope.clone());
        }
        id
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

fn refused(address: &str) -> ClientError {
    ClientError::Connection(format!("dial tcp {address}: connection refused"))
}

/// An in-process NSQ cluster.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker with one nsqd and one nsqlookupd registered at the usual
    /// local addresses.
    pub fn local() -> Self {
        Self::new()
            .with_nsqd("127.0.0.1:4150")
            .with_lookupd("127.0.0.1:4161")
    }

    pub fn with_nsqd(self, address: impl Into<String>) -> Self {
        self.add_nsqd(address);
        self
    }

    pub fn with_lookupd(self, address: impl Into<String>) -> Self {
        self.add_lookupd(address);
        self
    }

    pub fn add_nsqd(&self, address: impl Into<String>) {
        self.inner.state.lock().nsqds.insert(address.into());
    }

    pub fn add_lookupd(&self, address: impl Into<String>) {
        self.inner.state.lock().lookupds.insert(address.into());
    }

    /// Take an nsqd offline. Existing consumers keep their queues.
    pub fn remove_nsqd(&self, address: &str) -> bool {
        self.inner.state.lock().nsqds.remove(address)
    }

    /// Publish without going through a producer.
    pub fn publish(&self, topic: &str, body: impl AsRef<[u8]>) -> MessageId {
        self.inner.publish(topic, body.as_ref())
    }

    pub fn channel_stats(&self, topic: &str, channel: &str) -> Option<ChannelStats> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.channels.get(channel))
            .map(|c| c.stats())
    }

    /// Messages waiting for a topic's first channel.
    pub fn backlog(&self, topic: &str) -> usize {
        let state = self.inner.state.lock();
        state.topics.get(topic).map_or(0, |t| t.backlog.len())
    }
}

impl Client for MemoryBroker {
    type Consumer = MemoryConsumer;
    type Producer = MemoryProducer;

    fn new_consumer(
        &self,
        topic: &str,
        channel: &str,
        options: &ClientOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<MemoryConsumer, ClientError> {
        if !is_valid_topic_name(topic) {
            return Err(ClientError::InvalidName {
                kind: "topic",
                name: topic.to_string(),
            });
        }
        if !is_valid_channel_name(channel) {
            return Err(ClientError::InvalidName {
                kind: "channel",
                name: channel.to_string(),
            });
        }

        Ok(MemoryConsumer {
            id: self.inner.consumers.fetch_add(1, Ordering::Relaxed) + 1,
            broker: self.inner.clone(),
            topic: topic.to_string(),
            channel: channel.to_string(),
            options: options.clone(),
            handler,
            state: Mutex::new(ConsumerState::default()),
        })
    }

    fn new_producer(
        &self,
        address: &str,
        _options: &ClientOptions,
    ) -> Result<MemoryProducer, ClientError> {
        Ok(MemoryProducer {
            broker: self.inner.clone(),
            address: address.to_string(),
            stopped: AtomicBool::new(false),
        })
    }
}

struct ChannelResponder {
    consumer: u64,
    channel: Arc<Channel>,
    default_delay: Duration,
    max_delay: Duration,
}

impl Responder for ChannelResponder {
    fn finish(&self, id: &MessageId) {
        self.channel.finish(self.consumer, id);
    }

    fn requeue(&self, id: &MessageId, delay: RequeueDelay) {
        let (default_delay, max_delay) = (self.default_delay, self.max_delay);

        self.channel.requeue(self.consumer, id, |attempts| match delay {
            RequeueDelay::Default => default_delay
                .saturating_mul(u32::from(attempts))
                .min(max_delay),
            RequeueDelay::After(d) => d.min(max_delay),
        });
    }

    fn touch(&self, id: &MessageId) {
        trace!(%id, "touch");
    }
}

#[derive(Default)]
struct ConsumerState {
    task: Option<JoinHandle<()>>,
    channel: Option<Arc<Channel>>,
    stopped: bool,
}

/// Consumer returned by [`MemoryBroker::new_consumer`].
pub struct MemoryConsumer {
    id: u64,
    broker: Arc<BrokerInner>,
    topic: String,
    channel: String,
    options: ClientOptions,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<ConsumerState>,
}

impl MemoryConsumer {
    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.state.lock().stopped {
            return Err(ClientError::Stopped);
        }
        Ok(())
    }

    /// Subscribe and start delivering, once.
    fn start(&self, nsqd_address: String) {
        let mut state = self.state.lock();
        if state.stopped || state.task.is_some() {
            return;
        }

        let channel = self.broker.subscribe(&self.topic, &self.channel);
        let responder: Arc<dyn Responder> = Arc::new(ChannelResponder {
            consumer: self.id,
            channel: channel.clone(),
            default_delay: self.options.default_requeue_delay,
            max_delay: self.options.max_requeue_delay,
        });

        let delivery = Delivery {
            consumer: self.id,
            channel: channel.clone(),
            responder,
            handler: self.handler.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.max_in_flight.max(1) as usize)),
            max_attempts: self.options.max_attempts,
            nsqd_address,
        };

        debug!(
            consumer = self.id,
            topic = %self.topic,
            channel = %self.channel,
            "memory consumer subscribed"
        );

        state.channel = Some(channel);
        state.task = Some(tokio::spawn(delivery.run()));
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn connect_to_nsqds(&self, addresses: &[String]) -> Result<(), ClientError> {
        self.ensure_running()?;

        for address in addresses {
            if !self.broker.has_nsqd(address) {
                return Err(refused(address));
            }
        }

        if let Some(first) = addresses.first() {
            self.start(first.clone());
        }
        Ok(())
    }

    async fn connect_to_lookupds(&self, addresses: &[String]) -> Result<(), ClientError> {
        self.ensure_running()?;

        for address in addresses {
            if !self.broker.has_lookupd(address) {
                return Err(refused(address));
            }
        }

        if !addresses.is_empty() {
            if let Some(nsqd) = self.broker.first_nsqd() {
                self.start(nsqd);
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        let (task, channel) = {
            let mut state = self.state.lock();
            state.stopped = true;
            (state.task.take(), state.channel.take())
        };

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        if let Some(channel) = channel {
            let released = channel.release(self.id);
            debug!(consumer = self.id, released, "memory consumer stopped");
        }
    }
}

struct Delivery {
    consumer: u64,
    channel: Arc<Channel>,
    responder: Arc<dyn Responder>,
    handler: Arc<dyn MessageHandler>,
    semaphore: Arc<Semaphore>,
    max_attempts: u16,
    nsqd_address: String,
}

impl Delivery {
    async fn run(self) {
        loop {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                return;
            };
            let envelope = self.channel.next(self.consumer, permit).await;

            let message = Arc::new(
                Message::new(envelope.id, envelope.body, self.responder.clone())
                    .with_attempts(envelope.attempts)
                    .with_timestamp(envelope.timestamp)
                    .with_nsqd_address(self.nsqd_address.clone()),
            );

            deliver(self.handler.as_ref(), message, self.max_attempts).await;
        }
    }
}

/// Producer returned by [`MemoryBroker::new_producer`].
pub struct MemoryProducer {
    broker: Arc<BrokerInner>,
    address: String,
    stopped: AtomicBool,
}

impl MemoryProducer {
    fn check(&self) -> Result<(), ClientError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        if !self.broker.has_nsqd(&self.address) {
            return Err(refused(&self.address));
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn ping(&self) -> Result<(), ClientError> {
        self.check()
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), ClientError> {
        if !is_valid_topic_name(topic) {
            return Err(ClientError::InvalidName {
                kind: "topic",
                name: topic.to_string(),
            });
        }
        self.check()?;

        let id = self.broker.publish(topic, body);
        trace!(%id, topic, "published");
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::BoxError;
    use tokio::sync::mpsc;

    /// Forwards every message and answers according to `fail`.
    struct Forward {
        tx: mpsc::UnboundedSender<Arc<Message>>,
        fail: bool,
        failed: Mutex<Vec<MessageId>>,
    }

    impl Forward {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Message>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let handler = Arc::new(Self {
                tx,
                fail,
                failed: Mutex::new(Vec::new()),
            });
            (handler, rx)
        }
    }

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle_message(&self, message: Arc<Message>) -> Result<(), BoxError> {
            let _ = self.tx.send(message);
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }

        fn log_failed_message(&self, message: &Message) {
            self.failed.lock().push(message.id);
        }
    }

    fn options(max_attempts: u16) -> ClientOptions {
        ClientOptions {
            max_in_flight: 4,
            max_attempts,
            default_requeue_delay: Duration::from_secs(1),
            max_requeue_delay: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn addresses(address: &str) -> Vec<String> {
        vec![address.to_string()]
    }

    #[tokio::test]
    async fn test_backlog_goes_to_first_channel() {
        let broker = MemoryBroker::local();
        broker.publish("events", "one");
        broker.publish("events", "two");
        assert_eq!(broker.backlog("events"), 2);

        let (handler, mut rx) = Forward::new(false);
        let consumer = broker
            .new_consumer("events", "archive", &options(5), handler)
            .unwrap();
        consumer
            .connect_to_nsqds(&addresses("127.0.0.1:4150"))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().body, b"one");
        assert_eq!(rx.recv().await.unwrap().body, b"two");
        assert_eq!(broker.backlog("events"), 0);

        consumer.stop().await;
        let stats = broker.channel_stats("events", "archive").unwrap();
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.depth, 0);
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_every_channel() {
        let broker = MemoryBroker::local();
        let (first, mut first_rx) = Forward::new(false);
        let (second, mut second_rx) = Forward::new(false);

        let a = broker
            .new_consumer("events", "a", &options(5), first)
            .unwrap();
        let b = broker
            .new_consumer("events", "b", &options(5), second)
            .unwrap();
        a.connect_to_nsqds(&addresses("127.0.0.1:4150")).await.unwrap();
        b.connect_to_lookupds(&addresses("127.0.0.1:4161")).await.unwrap();

        broker.publish("events", "hello");

        let seen_a = first_rx.recv().await.unwrap();
        let seen_b = second_rx.recv().await.unwrap();
        assert_eq!(seen_a.id, seen_b.id);
        assert_eq!(seen_b.nsqd_address, "127.0.0.1:4150");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handler_backs_off_and_redelivers() {
        let broker = MemoryBroker::local();
        let (handler, mut rx) = Forward::new(true);
        let consumer = broker
            .new_consumer("events", "retry", &options(2), handler.clone())
            .unwrap();
        consumer
            .connect_to_nsqds(&addresses("127.0.0.1:4150"))
            .await
            .unwrap();

        let id = broker.publish("events", "flaky");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.attempts, 1);

        let started = Instant::now();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.id, id);
        assert!(started.elapsed() >= Duration::from_secs(1));

        // third delivery exceeds max_attempts and is finished unseen
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*handler.failed.lock(), vec![id]);

        let stats = broker.channel_stats("events", "retry").unwrap();
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.depth, 0);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_in_flight_messages() {
        struct Hold;

        #[async_trait]
        impl MessageHandler for Hold {
            async fn handle_message(&self, message: Arc<Message>) -> Result<(), BoxError> {
                message.disable_auto_response();
                Ok(())
            }
        }

        let broker = MemoryBroker::local();
        let consumer = broker
            .new_consumer("events", "held", &options(5), Arc::new(Hold))
            .unwrap();
        consumer
            .connect_to_nsqds(&addresses("127.0.0.1:4150"))
            .await
            .unwrap();

        for i in 0..6 {
            broker.publish("events", format!("m{i}"));
        }

        // max_in_flight caps unanswered deliveries
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = broker.channel_stats("events", "held").unwrap();
        assert_eq!(stats.in_flight, 4);
        assert_eq!(stats.depth, 2);

        consumer.stop().await;
        let stats = broker.channel_stats("events", "held").unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.depth, 6);

        assert!(matches!(
            consumer.connect_to_nsqds(&addresses("127.0.0.1:4150")).await,
            Err(ClientError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_unknown_addresses_are_refused() {
        let broker = MemoryBroker::new().with_nsqd("nsqd:4150");
        let (handler, _rx) = Forward::new(false);
        let consumer = broker
            .new_consumer("events", "c", &options(5), handler)
            .unwrap();

        let err = consumer
            .connect_to_nsqds(&addresses("nsqd:9999"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dial tcp nsqd:9999: connection refused");

        assert!(consumer
            .connect_to_lookupds(&addresses("lookupd:4161"))
            .await
            .is_err());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let broker = MemoryBroker::local();
        let (handler, _rx) = Forward::new(false);

        let err = broker
            .new_consumer("bad topic", "c", &options(5), handler)
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::InvalidName { kind: "topic", .. }));
    }

    #[tokio::test]
    async fn test_producer_lifecycle() {
        let broker = MemoryBroker::local();
        let producer = broker
            .new_producer("127.0.0.1:4150", &ClientOptions::default())
            .unwrap();

        producer.ping().await.unwrap();
        producer.publish("events", b"x").await.unwrap();
        assert_eq!(broker.backlog("events"), 1);

        assert!(matches!(
            producer.publish("", b"x").await,
            Err(ClientError::InvalidName { .. })
        ));

        broker.remove_nsqd("127.0.0.1:4150");
        assert!(matches!(
            producer.ping().await,
            Err(ClientError::Connection(_))
        ));

        producer.stop().await;
        assert!(matches!(producer.ping().await, Err(ClientError::Stopped)));
    }
}
