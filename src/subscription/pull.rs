use std::sync::Arc;
use std::time::Duration;

use nats_jetstream_protocol::{
    AckPolicy, ConsumerAction, ConsumerDescriptor, ConsumerDescriptorExt, ConsumerInfo,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{resolve_stream, transition, SubscriptionState};
use crate::{
    delivery::Delivery,
    error::{Error, ErrorCode},
    transport::{ensure_connected, JetStream},
    JetStreamResult,
};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller driven batches from a durable pull consumer.
///
/// Fetched messages are not acknowledged; every [`Delivery`] has to be acked
/// by the caller.
pub struct PullSubscription {
    stream: String,
    consumer: String,
    subject: String,
    transport: Arc<dyn JetStream>,
    state: watch::Sender<SubscriptionState>,
}

impl std::fmt::Debug for PullSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSubscription")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl PullSubscription {
    /// Binds to the durable consumer, creating it when it does not exist yet.
    pub(crate) async fn bind(
        transport: Arc<dyn JetStream>,
        stream: &str,
        subject: &str,
        durable: &str,
    ) -> JetStreamResult<PullSubscription> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        if durable.is_empty() {
            return Err(ErrorCode::EmptyConsumerName.into());
        }
        ensure_connected(&*transport)?;

        let stream =
            resolve_stream(&*transport, stream, subject, ErrorCode::PullSubscribeFailed).await?;

        match transport.consumer_info(&stream, durable).await {
            Ok(info) if info.config.is_push() => {
                return Err(Error::new(
                    ErrorCode::PullSubscribeFailed,
                    format!("consumer {durable} on {stream} is push based"),
                ));
            }
            Ok(_) => debug!(%stream, consumer = %durable, "bound to existing pull consumer"),
            Err(err) if err.is_consumer_not_found() => {
                let descriptor = ConsumerDescriptor {
                    durable_name: Some(durable.to_owned()),
                    filter_subject: subject.to_owned(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                };
                transport
                    .create_consumer(&stream, &descriptor, ConsumerAction::Create)
                    .await
                    .map_err(|err| Error::from_transport(ErrorCode::PullSubscribeFailed, err))?;
                debug!(%stream, consumer = %durable, "created pull consumer");
            }
            Err(err) => return Err(Error::from_transport(ErrorCode::PullSubscribeFailed, err)),
        }

        let (state, _) = watch::channel(SubscriptionState::Created);
        transition(&state, SubscriptionState::Active);

        Ok(PullSubscription {
            stream,
            consumer: durable.to_owned(),
            subject: subject.to_owned(),
            transport,
            state,
        })
    }

    /// Collects up to `batch` messages, waiting at most `timeout`.
    ///
    /// A zero `batch` fetches one message and a zero `timeout` waits 30
    /// seconds. Running out of time with nothing collected yields an empty
    /// batch, not an error.
    pub async fn fetch(&self, batch: usize, timeout: Duration) -> JetStreamResult<Vec<Delivery>> {
        if !self.state().is_active() {
            return Err(ErrorCode::SubscriptionInactive.into());
        }
        let batch = batch.max(1);
        let timeout = if timeout.is_zero() {
            DEFAULT_FETCH_TIMEOUT
        } else {
            timeout
        };

        match self
            .transport
            .fetch(&self.stream, &self.consumer, batch, timeout)
            .await
        {
            Ok(messages) => Ok(messages
                .into_iter()
                .map(|message| Delivery::new(message, self.transport.clone()))
                .collect()),
            Err(err) if err.is_timeout() => Ok(Vec::new()),
            Err(err) => {
                if err.is_connection_failure() {
                    warn!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        error = %err,
                        "pull subscription failed"
                    );
                    transition(&self.state, SubscriptionState::Errored);
                }
                Err(Error::with_source(
                    ErrorCode::FetchFailed,
                    ErrorCode::FetchFailed.description(),
                    err,
                ))
            }
        }
    }

    pub async fn info(&self) -> JetStreamResult<ConsumerInfo> {
        self.transport
            .consumer_info(&self.stream, &self.consumer)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ConsumerInfoFailed, err))
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Further fetches fail. The durable consumer stays on the server.
    pub fn close(&self) {
        transition(&self.state, SubscriptionState::Closed);
    }
}
