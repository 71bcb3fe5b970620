//! The publish/subscribe substrate streams and consumers live on.
//!
//! [`Transport`] is plain core messaging, [`JetStream`] adds the stream and
//! consumer primitives on top of it. Everything above this module talks to an
//! `Arc<dyn JetStream>` and never to a concrete client.
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use nats_jetstream_protocol::{
    AccountInfo, ConsumerAction, ConsumerDescriptor, ConsumerInfo, PublishAck, StreamDescriptor,
    StreamInfo,
};

use crate::{error::ErrorCode, JetStreamResult};

mod error;
mod memory;
mod nats;

pub use error::TransportError;
pub use memory::MemoryTransport;
pub use nats::NatsTransport;

pub type TransportResult<T> = Result<T, TransportError>;

/// Fails fast with [`ErrorCode::ConnectionClosed`] while disconnected.
pub(crate) fn ensure_connected<T: Transport + ?Sized>(transport: &T) -> JetStreamResult<()> {
    if transport.is_connected() {
        Ok(())
    } else {
        Err(ErrorCode::ConnectionClosed.into())
    }
}

/// Messages of a core subscription, in arrival order.
pub type MessageStream = BoxStream<'static, Message>;

/// Resolves once the stream acknowledged a message that was already sent.
pub type PendingPublishAck = BoxFuture<'static, TransportResult<PublishAck>>;

/// Traffic counters of a connection since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub in_messages: u64,
    pub out_messages: u64,
    /// Successful connects, reconnects included.
    pub connects: u64,
}

impl From<&async_nats::Statistics> for ConnectionStats {
    fn from(statistics: &async_nats::Statistics) -> Self {
        ConnectionStats {
            in_bytes: statistics.in_bytes.load(Ordering::Relaxed),
            out_bytes: statistics.out_bytes.load(Ordering::Relaxed),
            in_messages: statistics.in_messages.load(Ordering::Relaxed),
            out_messages: statistics.out_messages.load(Ordering::Relaxed),
            connects: statistics.connects.load(Ordering::Relaxed),
        }
    }
}

/// A message as seen on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Option<async_nats::HeaderMap>,
    /// Status code of server generated messages, such as pull timeouts.
    pub status: Option<u16>,
    pub description: Option<String>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            headers: None,
            status: None,
            description: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

impl From<async_nats::Message> for Message {
    fn from(message: async_nats::Message) -> Self {
        Message {
            subject: message.subject.to_string(),
            reply: message.reply.map(|reply| reply.to_string()),
            payload: message.payload,
            headers: message.headers,
            status: message.status.map(|status| status.as_u16()),
            description: message.description,
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn new_inbox(&self) -> String;

    fn statistics(&self) -> ConnectionStats;

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Message>;

    /// Subscribes to `subject`, optionally as a member of a queue group.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> TransportResult<MessageStream>;

    async fn flush(&self) -> TransportResult<()>;

    async fn drain(&self) -> TransportResult<()>;
}

#[async_trait::async_trait]
pub trait JetStream: Transport {
    async fn create_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo>;

    async fn update_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo>;

    async fn delete_stream(&self, stream: &str) -> TransportResult<()>;

    async fn stream_info(&self, stream: &str) -> TransportResult<StreamInfo>;

    /// Names of all streams, or of the streams capturing `subject`.
    async fn stream_names(&self, subject: Option<&str>) -> TransportResult<Vec<String>>;

    /// Returns how many messages were removed.
    async fn purge_stream(&self, stream: &str) -> TransportResult<u64>;

    async fn delete_message(&self, stream: &str, sequence: u64) -> TransportResult<()>;

    async fn account_info(&self) -> TransportResult<AccountInfo>;

    async fn publish_to_stream(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PublishAck>;

    /// Sends the message and hands back the acknowledgment still to come.
    async fn publish_to_stream_async(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PendingPublishAck>;

    async fn create_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo>;

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()>;

    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo>;

    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>>;

    /// Pulls up to `batch` messages from a pull consumer, waiting at most
    /// `expires`. Fails with [`TransportError::Timeout`] when nothing arrived.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> TransportResult<Vec<Message>>;
}
