//! Contracts the pipeline host drives connectors through.

use crate::error::{BoxError, ConnectorError};
use async_trait::async_trait;
use std::time::Duration;

/// Acknowledges one message handed out by [`Async::read_batch`].
///
/// Pass `Ok(())` when the message was delivered downstream and `Err(_)` when
/// it should be redelivered. Being `FnOnce`, an acknowledgment can only be
/// sent once.
pub type AckFn = Box<dyn FnOnce(Result<(), BoxError>) -> Result<(), ConnectorError> + Send>;

/// An [`AckFn`] that does nothing.
pub fn noop_ack_fn() -> AckFn {
    Box::new(|_| Ok(()))
}

/// Connection lifecycle shared by sources and sinks.
#[async_trait]
pub trait Service: Send + Sync {
    /// Establish a connection. Errors are returned as-is; retrying is the
    /// caller's decision.
    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Shut the component down and wait for teardown to finish. Safe to call
    /// without a successful `connect` and safe to call more than once.
    async fn close(&self) -> Result<(), ConnectorError>;
}

/// A source whose messages are acknowledged individually and asynchronously.
#[async_trait]
pub trait Async: Service {
    type Message: Send;

    /// Wait for the next message.
    ///
    /// Returns [`ConnectorError::Timeout`] when `timeout` elapses first (call
    /// again) and [`ConnectorError::Closed`] once the source is shutting down
    /// (stop calling). `None` waits indefinitely. It is safe to process the
    /// returned message and read the next one concurrently.
    async fn read_batch(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Self::Message, AckFn), ConnectorError>;
}

/// A sink that publishes payloads to named topics.
#[async_trait]
pub trait AsyncSink: Service {
    /// Block until the payload is accepted by the transport or an error occurs.
    async fn write(&self, topic: &str, payload: &[u8]) -> Result<(), ConnectorError>;
}
