use async_nats::jetstream::stream;
use chrono::{DateTime, Utc};

use crate::timestamp::to_chrono;

/// Resolved stream configuration as submitted to the server.
///
/// This is the complete `async-nats` model, so fields this crate never sets
/// itself (per-subject limits, republish, sources, metadata...) are carried
/// through updates untouched.
pub type StreamDescriptor = stream::Config;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
}

/// Snapshot of a stream: its configuration, creation time and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamDescriptor,
    pub created: DateTime<Utc>,
    pub state: StreamState,
}

impl From<stream::State> for StreamState {
    fn from(state: stream::State) -> Self {
        StreamState {
            messages: state.messages,
            bytes: state.bytes,
            first_seq: state.first_sequence,
            last_seq: state.last_sequence,
            consumer_count: state.consumer_count,
        }
    }
}

impl From<stream::Info> for StreamInfo {
    fn from(info: stream::Info) -> Self {
        StreamInfo {
            config: info.config,
            created: to_chrono(info.created),
            state: info.state.into(),
        }
    }
}
