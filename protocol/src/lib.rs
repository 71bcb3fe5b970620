//! Data shared by the JetStream client and its in-memory broker.
//!
//! Stream and consumer descriptors are the `async-nats` configuration types,
//! so every field the server knows about survives a read-modify-write cycle.
//! On top of them this crate keeps info snapshots that a broker can build
//! without a server, the server error model, subject matching and ack-subject
//! metadata. No I/O happens in this crate.
pub mod ack;
pub mod consumer;
pub mod error;
pub mod stream;
pub mod subject;
pub mod timestamp;

pub use ack::{parse_ack, MessageInfo};
pub use async_nats::jetstream::{
    account::Account as AccountInfo,
    consumer::{AckPolicy, DeliverPolicy, ReplayPolicy},
    publish::PublishAck,
    stream::{DiscardPolicy, RetentionPolicy, StorageType},
    AckKind,
};
pub use consumer::{
    ConsumerAction, ConsumerDescriptor, ConsumerDescriptorExt, ConsumerInfo, SequenceInfo,
};
pub use error::{ApiError, ApiErrorCode};
pub use stream::{StreamDescriptor, StreamInfo, StreamState};
