use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nats_jetstream_protocol::{AckKind, MessageInfo};
use tracing::trace;

use crate::{
    error::{Error, ErrorCode},
    transport::{JetStream, Message},
    JetStreamResult,
};

/// A message handed to the caller, with its JetStream metadata when it came
/// from a consumer.
///
/// Nothing is acknowledged on the caller's behalf.
pub struct Delivery {
    message: Message,
    info: Option<MessageInfo>,
    transport: Arc<dyn JetStream>,
}

impl Delivery {
    pub(crate) fn new(message: Message, transport: Arc<dyn JetStream>) -> Self {
        let info = message.reply.as_deref().and_then(MessageInfo::parse);
        Delivery {
            message,
            info,
            transport,
        }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn headers(&self) -> Option<&async_nats::HeaderMap> {
        self.message.headers.as_ref()
    }

    pub fn reply(&self) -> Option<&str> {
        self.message.reply.as_deref()
    }

    /// Stream, consumer, sequences and delivery count, parsed from the ack subject.
    pub fn info(&self) -> Option<&MessageInfo> {
        self.info.as_ref()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub async fn ack(&self) -> JetStreamResult<()> {
        self.acknowledge(AckKind::Ack).await
    }

    /// Asks for redelivery according to the consumer's schedule.
    pub async fn nak(&self) -> JetStreamResult<()> {
        self.acknowledge(AckKind::Nak(None)).await
    }

    pub async fn nak_with_delay(&self, delay: Duration) -> JetStreamResult<()> {
        self.acknowledge(AckKind::Nak(Some(delay))).await
    }

    /// Resets the ack wait timer of the message.
    pub async fn in_progress(&self) -> JetStreamResult<()> {
        self.acknowledge(AckKind::Progress).await
    }

    /// Stops redelivery of the message for good.
    pub async fn term(&self) -> JetStreamResult<()> {
        self.acknowledge(AckKind::Term).await
    }

    async fn acknowledge(&self, kind: AckKind) -> JetStreamResult<()> {
        let reply = self
            .message
            .reply
            .as_deref()
            .ok_or_else(|| Error::new(ErrorCode::AckFailed, "message has no reply subject"))?;

        trace!(%reply, ?kind, "acknowledging");
        self.transport
            .publish(reply, Bytes::from(kind))
            .await
            .map_err(|err| Error::from_transport(ErrorCode::AckFailed, err))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
