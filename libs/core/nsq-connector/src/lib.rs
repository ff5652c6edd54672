//! NSQ source and sink connectors.
//!
//! [`NsqReader`] consumes a topic/channel subscription and hands messages
//! out one at a time through [`messaging::Async`]; each message is
//! acknowledged (or requeued) independently. [`NsqWriter`] publishes
//! payloads through [`messaging::AsyncSink`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  deliver   ┌──────────────┐  rendezvous  ┌──────────────┐
//! │ nsqd/lookupd │───────────▶│   Consumer   │─────────────▶│  NsqReader   │──▶ read_batch
//! └──────────────┘            │ (client lib) │◀── requeue ──│ unacked set  │◀── AckFn
//!        ▲                    └──────────────┘              └──────────────┘
//!        │ publish            ┌──────────────┐              ┌──────────────┐
//!        └────────────────────│   Producer   │◀─────────────│  NsqWriter   │◀── write
//!                             └──────────────┘              └──────────────┘
//! ```
//!
//! The wire client sits behind the [`client`] traits. [`NsqdClient`]
//! implements them on top of `tokio-nsq`; with the `memory` feature,
//! `MemoryBroker` implements them in-process for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use core_config::FromEnv;
//! use messaging::{Async, Service};
//! use nsq_connector::{NsqReader, NsqReaderConfig, NsqdClient};
//!
//! let reader = NsqReader::new(NsqReaderConfig::from_env()?, NsqdClient::new(), &ifs::os())?;
//! reader.connect().await?;
//!
//! loop {
//!     match reader.read_batch(Some(Duration::from_secs(1))).await {
//!         Ok((message, ack)) => ack(process(&message.body).await)?,
//!         Err(e) if e.is_timeout() => continue,
//!         Err(e) if e.is_closed() => break,
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! ```

pub mod client;
mod config;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod metrics;
mod nsqd;
mod reader;
mod rendezvous;
mod shutdown;
mod writer;

pub use client::{Client, ClientError, ClientOptions, Message, MessageId, RequeueDelay};
pub use config::{NsqReaderConfig, NsqWriterConfig};
#[cfg(any(test, feature = "memory"))]
pub use memory::{ChannelStats, MemoryBroker};
pub use nsqd::{NsqdClient, NsqdConsumer, NsqdProducer};
pub use reader::NsqReader;
pub use rendezvous::Rendezvous;
pub use shutdown::Shutdown;
pub use writer::NsqWriter;
