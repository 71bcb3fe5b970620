//! Stream, consumer and subscription management for NATS JetStream.
//!
//! Everything starts from an [`Environment`], either connected to a NATS
//! server or running on an in-process [`transport::MemoryTransport`].
mod byte_capacity;
mod connection;
mod consumer;
mod delivery;
mod dispatcher;
mod environment;
pub mod error;
mod handler;
pub mod policy;
mod stream;
mod stream_creator;
mod subscription;
mod task;
pub mod transport;

pub type JetStreamResult<T> = Result<T, error::Error>;

pub use crate::connection::{ConnectionOptions, TlsOptions, DEFAULT_URL};
pub use crate::consumer::{ConsumerConfig, ConsumerManager, ConsumerPatch, Redelivery};
pub use crate::delivery::Delivery;
pub use crate::dispatcher::DispatchStats;
pub use crate::environment::{Environment, EnvironmentBuilder, PublishAckFuture};
pub use crate::error::{Error, ErrorCode, ErrorKind};
pub use crate::handler::MessageHandler;
pub use crate::stream::{StreamConfig, StreamManager, StreamPatch};
pub use crate::stream_creator::StreamCreator;
pub use crate::subscription::{
    PullSubscription, PushSubscription, Subscription, SubscriptionState,
};
pub mod types {

    pub use crate::byte_capacity::ByteCapacity;
    pub use crate::transport::{ConnectionStats, Message};
    pub use nats_jetstream_protocol::{
        AccountInfo, AckKind, ConsumerDescriptor, ConsumerDescriptorExt, ConsumerInfo,
        MessageInfo, PublishAck, SequenceInfo, StreamDescriptor, StreamInfo, StreamState,
    };
}
