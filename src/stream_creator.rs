use std::time::Duration;

use nats_jetstream_protocol::StreamInfo;

use crate::{
    byte_capacity::ByteCapacity,
    policy::{DiscardPolicy, FromSymbol, RetentionPolicy, StorageType},
    stream::{StreamConfig, StreamManager},
    JetStreamResult,
};

/// Builder for creating a JetStream stream
pub struct StreamCreator {
    pub(crate) streams: StreamManager,
    pub config: StreamConfig,
}

impl StreamCreator {
    pub fn new(streams: StreamManager) -> Self {
        Self {
            streams,
            config: StreamConfig::default(),
        }
    }

    /// Create a stream with name and options
    pub async fn create(mut self, stream: &str) -> JetStreamResult<StreamInfo> {
        self.config.name = stream.to_owned();
        self.streams.create_stream(&self.config).await
    }

    pub fn subjects(mut self, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention.symbol().to_owned();
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.config.storage = storage.symbol().to_owned();
        self
    }

    pub fn discard(mut self, discard: DiscardPolicy) -> Self {
        self.config.discard = discard.symbol().to_owned();
        self
    }

    pub fn max_bytes(mut self, byte_capacity: ByteCapacity) -> Self {
        self.config.max_bytes = byte_capacity.as_limit();
        self
    }

    pub fn max_messages(mut self, max_messages: i64) -> Self {
        self.config.max_msgs = max_messages;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age_seconds = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        self
    }

    pub fn replicas(mut self, replicas: usize) -> Self {
        self.config.replicas = replicas;
        self
    }
}
