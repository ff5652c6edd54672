//! The seam between connectors and an NSQ client library.
//!
//! Connectors only talk to these traits. [`NsqdClient`](crate::NsqdClient)
//! implements them over TCP; the in-process `MemoryBroker` (feature
//! `memory`) implements them for tests.

use async_trait::async_trait;
use messaging::BoxError;
use regex::Regex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tls_config::TlsContext;

static VALID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\.a-zA-Z0-9_-]+(#ephemeral)?$").expect("Invalid regex pattern")
});

const MAX_NAME_LENGTH: usize = 64;

/// Whether `name` is a legal NSQ topic name.
pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

/// Whether `name` is a legal NSQ channel name.
pub fn is_valid_channel_name(name: &str) -> bool {
    is_valid_name(name)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH && VALID_NAME.is_match(name)
}

/// Errors reported by a client implementation.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Publish(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("client stopped")]
    Stopped,
}

/// Options handed to the client when a consumer or producer is created.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub max_in_flight: u32,
    /// Deliveries beyond this count are discarded; 0 disables the limit
    pub max_attempts: u16,
    pub tls: Option<TlsContext>,
    /// Base backoff for [`RequeueDelay::Default`], multiplied by attempts
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    /// How long a new connection may take to become usable
    pub dial_timeout: Duration,
    /// How long a publish waits for nsqd to acknowledge it
    pub ack_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("nsq-connector/{}", env!("CARGO_PKG_VERSION")),
            max_in_flight: 1,
            max_attempts: 5,
            tls: None,
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            dial_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// NSQ message id: 16 ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Id rendered from a sequence number, the way nsqd renders its GUIDs.
    pub fn from_sequence(sequence: u64) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(format!("{:016x}", sequence).as_bytes());
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// How long the broker should wait before redelivering a requeued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDelay {
    /// Client-computed backoff: default delay times attempts, capped
    Default,
    After(Duration),
}

/// Where a message's responses go.
pub trait Responder: Send + Sync {
    fn finish(&self, id: &MessageId);
    fn requeue(&self, id: &MessageId, delay: RequeueDelay);
    fn touch(&self, id: &MessageId);
}

/// A message delivered to a [`MessageHandler`].
///
/// A message is answered at most once: the first `finish` or `requeue`
/// wins and later calls do nothing.
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
    pub attempts: u16,
    /// Nanoseconds since the Unix epoch at publish time
    pub timestamp: i64,
    pub nsqd_address: String,
    auto_response: AtomicBool,
    responded: AtomicBool,
    responder: Arc<dyn Responder>,
}

impl Message {
    pub fn new(id: MessageId, body: Vec<u8>, responder: Arc<dyn Responder>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();

        Self {
            id,
            body,
            attempts: 1,
            timestamp,
            nsqd_address: String::new(),
            auto_response: AtomicBool::new(true),
            responded: AtomicBool::new(false),
            responder,
        }
    }

    pub fn with_attempts(mut self, attempts: u16) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_nsqd_address(mut self, address: impl Into<String>) -> Self {
        self.nsqd_address = address.into();
        self
    }

    /// Take over responding; the client will not finish or requeue the
    /// message when the handler returns.
    pub fn disable_auto_response(&self) {
        self.auto_response.store(false, Ordering::Release);
    }

    pub fn is_auto_response_disabled(&self) -> bool {
        !self.auto_response.load(Ordering::Acquire)
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Returns `true` if this call answered the message.
    pub fn finish(&self) -> bool {
        let first = !self.responded.swap(true, Ordering::AcqRel);
        if first {
            self.responder.finish(&self.id);
        }
        first
    }

    /// Returns `true` if this call answered the message.
    pub fn requeue(&self, delay: RequeueDelay) -> bool {
        let first = !self.responded.swap(true, Ordering::AcqRel);
        if first {
            self.responder.requeue(&self.id, delay);
        }
        first
    }

    /// Reset the server-side timeout of an unanswered message.
    pub fn touch(&self) {
        if !self.has_responded() {
            self.responder.touch(&self.id);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("attempts", &self.attempts)
            .field("nsqd_address", &self.nsqd_address)
            .field("responded", &self.has_responded())
            .finish()
    }
}

/// Receives messages from a consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. With auto response enabled, `Ok` finishes and
    /// `Err` requeues it once this returns.
    async fn handle_message(&self, message: Arc<Message>) -> Result<(), BoxError>;

    /// Called instead of `handle_message` for a message past `max_attempts`.
    /// The client finishes the message afterwards.
    fn log_failed_message(&self, message: &Message) {
        tracing::warn!(
            id = %message.id,
            attempts = message.attempts,
            "message exceeded max attempts, discarding"
        );
    }
}

/// Run one delivery through `handler`, answering it unless the handler took
/// over. Messages past `max_attempts` are logged and finished instead.
pub(crate) async fn deliver(
    handler: &dyn MessageHandler,
    message: Arc<Message>,
    max_attempts: u16,
) {
    if max_attempts > 0 && message.attempts > max_attempts {
        handler.log_failed_message(&message);
        message.finish();
        return;
    }

    let result = handler.handle_message(message.clone()).await;

    if !message.is_auto_response_disabled() {
        match result {
            Ok(()) => {
                message.finish();
            }
            Err(e) => {
                tracing::debug!(id = %message.id, error = %e, "handler failed, requeueing");
                message.requeue(RequeueDelay::Default);
            }
        }
    }
}

#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn connect_to_nsqds(&self, addresses: &[String]) -> Result<(), ClientError>;

    async fn connect_to_lookupds(&self, addresses: &[String]) -> Result<(), ClientError>;

    /// Stop receiving. Returns once delivery has ceased.
    async fn stop(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), ClientError>;

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), ClientError>;

    async fn stop(&self);
}

/// Creates consumers and producers.
pub trait Client: Send + Sync + 'static {
    type Consumer: Consumer;
    type Producer: Producer;

    fn new_consumer(
        &self,
        topic: &str,
        channel: &str,
        options: &ClientOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self::Consumer, ClientError>;

    fn new_producer(
        &self,
        address: &str,
        options: &ClientOptions,
    ) -> Result<Self::Producer, ClientError>;
}
