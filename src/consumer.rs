use std::sync::Arc;
use std::time::Duration;

use nats_jetstream_protocol::{ConsumerAction, ConsumerDescriptor, ConsumerInfo};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::{
    error::{Error, ErrorCode},
    policy::{AckPolicy, DeliverPolicy, FromSymbol, ReplayPolicy},
    transport::{ensure_connected, JetStream},
    JetStreamResult,
};

/// Caller side consumer configuration. Durations are whole seconds and
/// policies are symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ConsumerConfig {
    /// Optional; when set it must name the stream the consumer is created on.
    pub stream: String,
    pub durable: String,
    pub deliver_policy: String,
    pub opt_start_seq: u64,
    /// Unix seconds, `0` for unset.
    pub opt_start_time: i64,
    pub ack_policy: String,
    #[cfg_attr(feature = "serde", serde(alias = "ackWait"))]
    pub ack_wait_seconds: i64,
    pub max_deliver: i64,
    pub back_off: Vec<i64>,
    pub filter_subject: String,
    pub replay_policy: String,
    pub sample_freq: String,
}

impl ConsumerConfig {
    pub fn durable(name: impl Into<String>) -> Self {
        ConsumerConfig {
            durable: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self, stream: &str) -> JetStreamResult<()> {
        if stream.is_empty() {
            return Err(ErrorCode::EmptyStreamName.into());
        }
        if self.durable.is_empty() {
            return Err(ErrorCode::EmptyConsumerName.into());
        }
        if !self.stream.is_empty() && self.stream != stream {
            return Err(Error::new(
                ErrorCode::InvalidConfig,
                format!("consumer config names stream {}, not {stream}", self.stream),
            ));
        }
        if self.ack_wait_seconds < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "ackWait must be non-negative"));
        }
        if self.max_deliver < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxDeliver must be non-negative"));
        }
        if self.opt_start_time < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "optStartTime must be non-negative"));
        }
        if self.back_off.iter().any(|delay| *delay < 0) {
            return Err(Error::new(
                ErrorCode::InvalidConfig,
                "backOff entries must be non-negative",
            ));
        }
        Ok(())
    }

    /// Resolves symbols and converts seconds into the wire descriptor.
    ///
    /// The start sequence and start time only travel with the delivery
    /// policy that reads them. An unset start time is sent as the Unix epoch.
    pub fn descriptor(&self) -> ConsumerDescriptor {
        let deliver_policy = match DeliverPolicy::from_symbol(&self.deliver_policy) {
            DeliverPolicy::ByStartSequence { .. } => DeliverPolicy::ByStartSequence {
                start_sequence: self.opt_start_seq,
            },
            DeliverPolicy::ByStartTime { .. } => DeliverPolicy::ByStartTime {
                start_time: OffsetDateTime::from_unix_timestamp(self.opt_start_time.max(0))
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            },
            policy => policy,
        };

        ConsumerDescriptor {
            durable_name: Some(self.durable.clone()),
            deliver_policy,
            ack_policy: AckPolicy::from_symbol(&self.ack_policy),
            ack_wait: seconds(self.ack_wait_seconds),
            max_deliver: self.max_deliver,
            backoff: self.back_off.iter().copied().map(seconds).collect(),
            filter_subject: self.filter_subject.clone(),
            replay_policy: ReplayPolicy::from_symbol(&self.replay_policy),
            sample_frequency: sample_frequency(&self.sample_freq),
            ..Default::default()
        }
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

/// `"50%"` and `"50"` both mean half of the acknowledgements are sampled.
fn sample_frequency(symbol: &str) -> u8 {
    symbol
        .trim()
        .trim_end_matches('%')
        .parse::<u8>()
        .map_or(0, |percent| percent.min(100))
}

/// Changes to an existing consumer. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerPatch {
    pub durable: String,
    pub filter_subject: Option<String>,
    pub ack_wait: Option<Duration>,
    pub max_deliver: Option<i64>,
}

impl ConsumerPatch {
    pub fn new(durable: impl Into<String>) -> Self {
        ConsumerPatch {
            durable: durable.into(),
            ..Default::default()
        }
    }

    pub fn filter_subject(mut self, filter_subject: impl Into<String>) -> Self {
        self.filter_subject = Some(filter_subject.into());
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = Some(ack_wait);
        self
    }

    pub fn max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    fn validate(&self, stream: &str) -> JetStreamResult<()> {
        if stream.is_empty() {
            return Err(ErrorCode::EmptyStreamName.into());
        }
        if self.durable.is_empty() {
            return Err(ErrorCode::EmptyConsumerName.into());
        }
        if self.max_deliver.is_some_and(|max_deliver| max_deliver < 0) {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxDeliver must be non-negative"));
        }
        Ok(())
    }

    /// Returns `current` with every present field replaced. Fields the patch
    /// cannot express are copied over as they are.
    pub fn apply(&self, current: &ConsumerDescriptor) -> ConsumerDescriptor {
        let mut merged = current.clone();
        if let Some(filter_subject) = &self.filter_subject {
            merged.filter_subject = filter_subject.clone();
        }
        if let Some(ack_wait) = self.ack_wait {
            merged.ack_wait = ack_wait;
        }
        if let Some(max_deliver) = self.max_deliver {
            merged.max_deliver = max_deliver;
        }
        merged
    }
}

impl From<ConsumerConfig> for ConsumerPatch {
    fn from(config: ConsumerConfig) -> Self {
        ConsumerPatch {
            filter_subject: (!config.filter_subject.is_empty()).then_some(config.filter_subject),
            ack_wait: (config.ack_wait_seconds > 0).then(|| seconds(config.ack_wait_seconds)),
            max_deliver: (config.max_deliver > 0).then_some(config.max_deliver),
            durable: config.durable,
        }
    }
}

/// When, and how often, a consumer redelivers unacknowledged messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redelivery {
    ack_wait: Duration,
    backoff: Vec<Duration>,
    max_deliver: i64,
}

impl Redelivery {
    pub fn new(ack_wait: Duration, backoff: Vec<Duration>, max_deliver: i64) -> Self {
        Redelivery {
            ack_wait,
            backoff,
            max_deliver,
        }
    }

    pub fn from_descriptor(descriptor: &ConsumerDescriptor) -> Self {
        Redelivery::new(
            descriptor.ack_wait,
            descriptor.backoff.clone(),
            descriptor.max_deliver,
        )
    }

    /// Delay before redelivering a message that has been delivered
    /// `attempt` times. The last backoff entry repeats.
    pub fn delay_for(&self, attempt: u64) -> Duration {
        if self.backoff.is_empty() {
            return self.ack_wait;
        }
        let index = (attempt.max(1) - 1).min(self.backoff.len() as u64 - 1);
        self.backoff[index as usize]
    }

    pub fn allows_redelivery(&self, delivered: u64) -> bool {
        self.max_deliver <= 0 || delivered < self.max_deliver as u64
    }

    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    pub fn max_deliver(&self) -> i64 {
        self.max_deliver
    }
}

/// Creates, updates, deletes and queries consumers of existing streams.
#[derive(Clone)]
pub struct ConsumerManager {
    transport: Arc<dyn JetStream>,
}

impl ConsumerManager {
    pub(crate) fn new(transport: Arc<dyn JetStream>) -> Self {
        ConsumerManager { transport }
    }

    pub async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> JetStreamResult<ConsumerInfo> {
        config.validate(stream)?;
        ensure_connected(&*self.transport)?;

        let descriptor = config.descriptor();
        debug!(%stream, consumer = %config.durable, "creating consumer");
        self.transport
            .create_consumer(stream, &descriptor, ConsumerAction::Create)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerCreateFailed, err))
    }

    pub async fn update_consumer(
        &self,
        stream: &str,
        patch: impl Into<ConsumerPatch>,
    ) -> JetStreamResult<ConsumerInfo> {
        let patch = patch.into();
        patch.validate(stream)?;
        ensure_connected(&*self.transport)?;

        let current = self
            .transport
            .consumer_info(stream, &patch.durable)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerLookupFailed, err))?;

        let merged = patch.apply(&current.config);
        trace!(%stream, consumer = %patch.durable, ?merged, "updating consumer");
        self.transport
            .create_consumer(stream, &merged, ConsumerAction::Update)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerUpdateFailed, err))
    }

    pub async fn delete_consumer(&self, stream: &str, durable: &str) -> JetStreamResult<()> {
        validate_names(stream, durable)?;
        ensure_connected(&*self.transport)?;

        debug!(%stream, consumer = %durable, "deleting consumer");
        self.transport
            .delete_consumer(stream, durable)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerDeleteFailed, err))
    }

    pub async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> JetStreamResult<ConsumerInfo> {
        validate_names(stream, durable)?;
        ensure_connected(&*self.transport)?;

        self.transport
            .consumer_info(stream, durable)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerInfoFailed, err))
    }

    pub async fn consumer_names(&self, stream: &str) -> JetStreamResult<Vec<String>> {
        if stream.is_empty() {
            return Err(ErrorCode::EmptyStreamName.into());
        }
        ensure_connected(&*self.transport)?;

        self.transport
            .consumer_names(stream)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ListFailed, err))
    }
}

fn validate_names(stream: &str, durable: &str) -> JetStreamResult<()> {
    if stream.is_empty() {
        return Err(ErrorCode::EmptyStreamName.into());
    }
    if durable.is_empty() {
        return Err(ErrorCode::EmptyConsumerName.into());
    }
    Ok(())
}
