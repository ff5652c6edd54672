//! Contracts between a pipeline host and its messaging connectors.
//!
//! The host only sees these traits; connector crates (`nsq-connector`)
//! implement them on top of their client libraries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect / read_batch / close  ┌──────────────────┐
//! │ Pipeline     │───────────────────────────────▶│ Async (source)   │
//! │ host         │                                 └──────────────────┘
//! │              │  connect / write / close        ┌──────────────────┐
//! │              │───────────────────────────────▶│ AsyncSink (sink) │
//! └──────────────┘                                 └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use messaging::{Async, ConnectorError};
//!
//! source.connect().await?;
//! loop {
//!     match source.read_batch(Some(Duration::from_secs(1))).await {
//!         Ok((message, ack)) => {
//!             let outcome = forward(&message).await;
//!             ack(outcome)?;
//!         }
//!         Err(ConnectorError::Timeout) => continue,
//!         Err(ConnectorError::Closed) => break,
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```

mod error;
mod service;

pub use error::{BoxError, ConnectorError, ErrorCategory};
pub use service::{noop_ack_fn, AckFn, Async, AsyncSink, Service};
