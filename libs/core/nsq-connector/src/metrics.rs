//! Connector counters.
//!
//! Only the `metrics` facade is used here; installing a recorder (and an
//! exporter) is up to the host process.

use metrics::counter;

/// Counters for one topic/channel subscription.
#[derive(Debug, Clone)]
pub struct ReaderMetrics {
    topic: String,
    channel: String,
}

impl ReaderMetrics {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
        }
    }

    /// A message arrived from the client
    pub fn message_received(&self) {
        counter!(
            "nsq_reader_messages_received_total",
            "topic" => self.topic.clone(),
            "channel" => self.channel.clone()
        )
        .increment(1);
    }

    pub fn message_acked(&self) {
        counter!(
            "nsq_reader_messages_acked_total",
            "topic" => self.topic.clone(),
            "channel" => self.channel.clone()
        )
        .increment(1);
    }

    /// Requeued either by a failed ack or by shutdown
    pub fn message_requeued(&self, reason: &'static str) {
        counter!(
            "nsq_reader_messages_requeued_total",
            "topic" => self.topic.clone(),
            "channel" => self.channel.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn failed_attempts(&self) {
        counter!(
            "nsq_reader_failed_attempts_total",
            "topic" => self.topic.clone(),
            "channel" => self.channel.clone()
        )
        .increment(1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriterMetrics;

impl WriterMetrics {
    pub fn message_published(&self, topic: &str) {
        counter!(
            "nsq_writer_messages_published_total",
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    pub fn publish_failed(&self, topic: &str) {
        counter!(
            "nsq_writer_publish_failures_total",
            "topic" => topic.to_string()
        )
        .increment(1);
    }
}
