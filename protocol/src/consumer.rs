use async_nats::jetstream::consumer;
use chrono::{DateTime, Utc};

use crate::timestamp::to_chrono;

/// Resolved consumer configuration as submitted to the server.
pub type ConsumerDescriptor = consumer::Config;

/// Addressing helpers on top of [`ConsumerDescriptor`].
pub trait ConsumerDescriptorExt {
    /// Name the server addresses this consumer by, if it has one yet.
    fn consumer_name(&self) -> Option<&str>;

    /// Push consumers carry a deliver subject, pull consumers do not.
    fn is_push(&self) -> bool;
}

impl ConsumerDescriptorExt for ConsumerDescriptor {
    fn consumer_name(&self) -> Option<&str> {
        self.durable_name.as_deref().or(self.name.as_deref())
    }

    fn is_push(&self) -> bool {
        self.deliver_subject.is_some()
    }
}

/// How the server treats a create request for a consumer that may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerAction {
    #[default]
    CreateOrUpdate,
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Snapshot of a consumer: its configuration and delivery progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerDescriptor,
    pub delivered: SequenceInfo,
    pub ack_floor: SequenceInfo,
    pub num_ack_pending: u64,
    pub num_redelivered: u64,
    pub num_waiting: u64,
    pub num_pending: u64,
}

impl From<consumer::SequenceInfo> for SequenceInfo {
    fn from(info: consumer::SequenceInfo) -> Self {
        SequenceInfo {
            consumer_seq: info.consumer_sequence,
            stream_seq: info.stream_sequence,
        }
    }
}

impl From<consumer::Info> for ConsumerInfo {
    fn from(info: consumer::Info) -> Self {
        ConsumerInfo {
            stream_name: info.stream_name,
            name: info.name,
            created: to_chrono(info.created),
            config: info.config,
            delivered: info.delivered.into(),
            ack_floor: info.ack_floor.into(),
            num_ack_pending: info.num_ack_pending as u64,
            num_redelivered: info.num_redelivered as u64,
            num_waiting: info.num_waiting as u64,
            num_pending: info.num_pending,
        }
    }
}
