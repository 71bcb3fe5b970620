use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::connection::State;
use async_nats::jetstream::{
    self,
    consumer::{
        pull::{self, MessagesError, MessagesErrorKind},
        Consumer,
    },
    context::{
        AccountErrorKind, ConsumerInfoErrorKind, CreateStreamErrorKind, GetStreamByNameErrorKind,
        GetStreamErrorKind, PublishError, PublishErrorKind,
        RequestErrorKind as ApiRequestErrorKind,
    },
    stream::{
        ConsumerCreateStrictErrorKind, ConsumerErrorKind, ConsumerUpdateErrorKind,
        DeleteMessageErrorKind, PurgeErrorKind,
    },
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use nats_jetstream_protocol::{
    AccountInfo, ApiError, ApiErrorCode, ConsumerAction, ConsumerDescriptor, ConsumerInfo,
    PublishAck, StreamDescriptor, StreamInfo,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    ConnectionStats, JetStream, Message, MessageStream, PendingPublishAck, Transport,
    TransportError, TransportResult,
};

const API_PREFIX: &str = "$JS.API";

type PullConsumer = Consumer<pull::Config>;

/// [`JetStream`] over a live `async_nats` connection and its JetStream context.
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    context: jetstream::Context,
    pull_consumers: Arc<DashMap<(String, String), PullConsumer>>,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client, api_timeout: Duration) -> Self {
        let mut context = jetstream::new(client.clone());
        context.set_timeout(api_timeout);
        NatsTransport {
            client,
            context,
            pull_consumers: Arc::new(DashMap::new()),
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    async fn pull_consumer(&self, stream: &str, consumer: &str) -> TransportResult<PullConsumer> {
        let key = (stream.to_owned(), consumer.to_owned());
        if let Some(cached) = self.pull_consumers.get(&key) {
            return Ok(cached.clone());
        }

        let found: PullConsumer = self
            .context
            .get_consumer_from_stream(consumer, stream)
            .await
            .map_err(|error| match error.kind() {
                ConsumerErrorKind::InvalidConsumerType => TransportError::Status {
                    code: 409,
                    description: format!("consumer {consumer} is push based"),
                },
                _ => classify(error),
            })?;
        self.pull_consumers.insert(key, found.clone());
        Ok(found)
    }

    fn forget_consumer(&self, stream: &str, consumer: &str) {
        self.pull_consumers
            .remove(&(stream.to_owned(), consumer.to_owned()));
    }
}

/// The failure shapes of the `async_nats` JetStream calls this transport
/// distinguishes. Anything else is reported as a client error.
trait JetStreamKind {
    fn api_error(&self) -> Option<ApiError> {
        None
    }

    fn timed_out(&self) -> bool {
        false
    }

    fn no_responders(&self) -> bool {
        false
    }
}

fn classify<K>(error: async_nats::error::Error<K>) -> TransportError
where
    K: JetStreamKind + Clone + Debug + Display + PartialEq + Send + Sync + 'static,
{
    let kind = error.kind();
    if let Some(api) = kind.api_error().or_else(|| api_error_in_sources(&error)) {
        return TransportError::Api(api);
    }
    if kind.timed_out() {
        return TransportError::Timeout;
    }
    if kind.no_responders() {
        return TransportError::NoResponders(API_PREFIX.to_owned());
    }
    TransportError::nats(error)
}

/// Server errors can be wrapped several layers down, behind a request error.
fn api_error_in_sources(error: &(dyn std::error::Error + 'static)) -> Option<ApiError> {
    let mut source = error.source();
    while let Some(current) = source {
        if let Some(api) = current.downcast_ref::<jetstream::Error>() {
            return Some(api.into());
        }
        source = current.source();
    }
    None
}

/// A missing stream on publish means nothing listens on the subject.
fn publish_error(subject: &str, error: PublishError) -> TransportError {
    match error.kind() {
        PublishErrorKind::StreamNotFound => TransportError::NoResponders(subject.to_owned()),
        _ => classify(error),
    }
}

fn consumer_does_not_exist() -> ApiError {
    ApiError::new(
        404,
        ApiErrorCode::ConsumerDoesNotExist,
        "consumer does not exist",
    )
}

impl JetStreamKind for CreateStreamErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            CreateStreamErrorKind::JetStream(error) => Some(error.into()),
            CreateStreamErrorKind::NotFound => Some(ApiError::stream_not_found()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, CreateStreamErrorKind::TimedOut)
    }

    fn no_responders(&self) -> bool {
        matches!(self, CreateStreamErrorKind::JetStreamUnavailable)
    }
}

impl JetStreamKind for GetStreamErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            GetStreamErrorKind::JetStream(error) => Some(error.into()),
            _ => None,
        }
    }
}

impl JetStreamKind for GetStreamByNameErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            GetStreamByNameErrorKind::JetStream(error) => Some(error.into()),
            GetStreamByNameErrorKind::NotFound => Some(ApiError::stream_not_found()),
            _ => None,
        }
    }
}

impl JetStreamKind for ApiRequestErrorKind {
    fn timed_out(&self) -> bool {
        matches!(self, ApiRequestErrorKind::TimedOut)
    }

    fn no_responders(&self) -> bool {
        matches!(self, ApiRequestErrorKind::NoResponders)
    }
}

impl JetStreamKind for PurgeErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            PurgeErrorKind::JetStream(error) => Some(error.into()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, PurgeErrorKind::TimedOut)
    }
}

impl JetStreamKind for DeleteMessageErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            DeleteMessageErrorKind::JetStream(error) => Some(error.into()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, DeleteMessageErrorKind::TimedOut)
    }
}

impl JetStreamKind for AccountErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            AccountErrorKind::JetStream(error) => Some(error.into()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, AccountErrorKind::TimedOut)
    }

    fn no_responders(&self) -> bool {
        matches!(self, AccountErrorKind::JetStreamUnavailable)
    }
}

impl JetStreamKind for PublishErrorKind {
    fn timed_out(&self) -> bool {
        matches!(self, PublishErrorKind::TimedOut)
    }
}

impl JetStreamKind for ConsumerErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            ConsumerErrorKind::JetStream(error) => Some(error.into()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, ConsumerErrorKind::TimedOut)
    }
}

impl JetStreamKind for ConsumerCreateStrictErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            ConsumerCreateStrictErrorKind::JetStream(error) => Some(error.into()),
            ConsumerCreateStrictErrorKind::AlreadyExists => Some(ApiError::new(
                400,
                ApiErrorCode::ConsumerAlreadyExists,
                "consumer already exists",
            )),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, ConsumerCreateStrictErrorKind::TimedOut)
    }
}

impl JetStreamKind for ConsumerUpdateErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            ConsumerUpdateErrorKind::JetStream(error) => Some(error.into()),
            ConsumerUpdateErrorKind::DoesNotExist => Some(consumer_does_not_exist()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, ConsumerUpdateErrorKind::TimedOut)
    }
}

impl JetStreamKind for ConsumerInfoErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            ConsumerInfoErrorKind::JetStream(error) => Some(error.into()),
            ConsumerInfoErrorKind::NotFound => Some(ApiError::consumer_not_found()),
            ConsumerInfoErrorKind::StreamNotFound => Some(ApiError::stream_not_found()),
            _ => None,
        }
    }

    fn timed_out(&self) -> bool {
        matches!(self, ConsumerInfoErrorKind::TimedOut)
    }

    fn no_responders(&self) -> bool {
        matches!(self, ConsumerInfoErrorKind::NoResponders)
    }
}

impl JetStreamKind for pull::BatchErrorKind {}

impl JetStreamKind for MessagesErrorKind {
    fn api_error(&self) -> Option<ApiError> {
        match self {
            MessagesErrorKind::ConsumerDeleted => Some(ApiError::consumer_not_found()),
            _ => None,
        }
    }

    fn no_responders(&self) -> bool {
        matches!(self, MessagesErrorKind::NoResponders)
    }
}

/// Collects one pull batch until the server ends it or `deadline` passes.
async fn collect_batch(
    batch: impl Stream<Item = Result<jetstream::Message, MessagesError>>,
    deadline: Instant,
) -> TransportResult<Vec<Message>> {
    tokio::pin!(batch);
    let mut messages = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, batch.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(Ok(message))) => {
                messages.push(Message::from(async_nats::Message::from(message)))
            }
            Ok(Some(Err(error))) if messages.is_empty() => return Err(classify(error)),
            Ok(Some(Err(error))) => {
                debug!(%error, "pull request ended early");
                break;
            }
        }
    }
    Ok(messages)
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn statistics(&self) -> ConnectionStats {
        ConnectionStats::from(&*self.client.statistics())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(TransportError::nats)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Message> {
        let request = async_nats::Request::new()
            .payload(payload)
            .timeout(Some(timeout));

        match self.client.send_request(subject.to_owned(), request).await {
            Ok(message) => Ok(message.into()),
            Err(error) => Err(match error.kind() {
                RequestErrorKind::TimedOut => TransportError::Timeout,
                RequestErrorKind::NoResponders => TransportError::NoResponders(subject.to_owned()),
                _ => TransportError::nats(error),
            }),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> TransportResult<MessageStream> {
        let subscriber = match queue {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_owned(), queue.to_owned())
                    .await
            }
            None => self.client.subscribe(subject.to_owned()).await,
        }
        .map_err(TransportError::nats)?;

        Ok(subscriber.map(Message::from).boxed())
    }

    async fn flush(&self) -> TransportResult<()> {
        self.client.flush().await.map_err(TransportError::nats)
    }

    async fn drain(&self) -> TransportResult<()> {
        self.client.drain().await.map_err(TransportError::nats)
    }
}

#[async_trait::async_trait]
impl JetStream for NatsTransport {
    async fn create_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo> {
        let stream = self
            .context
            .create_stream(descriptor)
            .await
            .map_err(classify)?;
        Ok(stream.cached_info().clone().into())
    }

    async fn update_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo> {
        let info = self
            .context
            .update_stream(descriptor)
            .await
            .map_err(classify)?;
        Ok(info.into())
    }

    async fn delete_stream(&self, stream: &str) -> TransportResult<()> {
        let status = self
            .context
            .delete_stream(stream)
            .await
            .map_err(classify)?;
        self.pull_consumers.retain(|(owner, _), _| owner != stream);
        if status.success {
            Ok(())
        } else {
            Err(TransportError::NotAcknowledged(format!("delete of stream {stream}")))
        }
    }

    async fn stream_info(&self, stream: &str) -> TransportResult<StreamInfo> {
        let stream = self.context.get_stream(stream).await.map_err(classify)?;
        Ok(stream.cached_info().clone().into())
    }

    async fn stream_names(&self, subject: Option<&str>) -> TransportResult<Vec<String>> {
        match subject {
            Some(subject) => match self.context.stream_by_subject(subject).await {
                Ok(name) => Ok(vec![name]),
                Err(error) => match classify(error) {
                    TransportError::Api(api) if api.is_stream_not_found() => Ok(Vec::new()),
                    error => Err(error),
                },
            },
            None => self
                .context
                .stream_names()
                .map_err(classify)
                .try_collect()
                .await,
        }
    }

    async fn purge_stream(&self, stream: &str) -> TransportResult<u64> {
        let handle = self
            .context
            .get_stream_no_info(stream)
            .await
            .map_err(classify)?;
        let response = handle.purge().await.map_err(classify)?;
        if response.success {
            Ok(response.purged)
        } else {
            Err(TransportError::NotAcknowledged(format!("purge of stream {stream}")))
        }
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> TransportResult<()> {
        let handle = self
            .context
            .get_stream_no_info(stream)
            .await
            .map_err(classify)?;
        if handle.delete_message(sequence).await.map_err(classify)? {
            Ok(())
        } else {
            Err(TransportError::NotAcknowledged(format!(
                "delete of message {sequence} in stream {stream}"
            )))
        }
    }

    async fn account_info(&self) -> TransportResult<AccountInfo> {
        self.context.query_account().await.map_err(classify)
    }

    async fn publish_to_stream(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PublishAck> {
        let pending = self.publish_to_stream_async(subject, payload).await?;
        pending.await
    }

    async fn publish_to_stream_async(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PendingPublishAck> {
        let ack = self
            .context
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|error| publish_error(subject, error))?;

        let subject = subject.to_owned();
        Ok(async move { ack.await.map_err(|error| publish_error(&subject, error)) }.boxed())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo> {
        trace!(%stream, ?action, "creating consumer");
        let config = descriptor.clone();
        let consumer: Consumer<ConsumerDescriptor> = match action {
            ConsumerAction::Create => self
                .context
                .create_consumer_strict_on_stream(config, stream)
                .await
                .map_err(classify)?,
            ConsumerAction::Update => self
                .context
                .update_consumer_on_stream(config, stream)
                .await
                .map_err(classify)?,
            ConsumerAction::CreateOrUpdate => self
                .context
                .create_consumer_on_stream(config, stream)
                .await
                .map_err(classify)?,
        };

        let info = ConsumerInfo::from(consumer.cached_info().clone());
        self.forget_consumer(stream, &info.name);
        Ok(info)
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()> {
        let status = self
            .context
            .delete_consumer_from_stream(consumer, stream)
            .await
            .map_err(classify)?;
        self.forget_consumer(stream, consumer);
        if status.success {
            Ok(())
        } else {
            Err(TransportError::NotAcknowledged(format!(
                "delete of consumer {consumer} on stream {stream}"
            )))
        }
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo> {
        let handle = self
            .context
            .get_stream_no_info(stream)
            .await
            .map_err(classify)?;
        let info = handle.consumer_info(consumer).await.map_err(classify)?;
        Ok(info.into())
    }

    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>> {
        let handle = self
            .context
            .get_stream_no_info(stream)
            .await
            .map_err(classify)?;
        handle
            .consumer_names()
            .map_err(classify)
            .try_collect()
            .await
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> TransportResult<Vec<Message>> {
        let deadline = Instant::now() + expires;
        let pull = self.pull_consumer(stream, consumer).await?;

        // Take whatever is already available before parking a request on the server.
        let immediate = pull
            .fetch()
            .max_messages(batch)
            .messages()
            .await
            .map_err(classify)?;
        let messages = collect_batch(immediate, deadline).await?;
        if !messages.is_empty() {
            return Ok(messages);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout);
        }
        let waiting = pull
            .batch()
            .max_messages(batch)
            .expires(remaining)
            .messages()
            .await
            .map_err(classify)?;
        let messages = collect_batch(waiting, deadline).await?;
        if messages.is_empty() {
            Err(TransportError::Timeout)
        } else {
            Ok(messages)
        }
    }
}
