use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use nats_jetstream_protocol::PublishAck;
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionOptions, TlsOptions},
    consumer::ConsumerManager,
    error::{Error, ErrorCode},
    handler::MessageHandler,
    stream::StreamManager,
    stream_creator::StreamCreator,
    subscription::{PullSubscription, PushSubscription, Subscription},
    transport::{ensure_connected, ConnectionStats, JetStream, Message, PendingPublishAck},
    JetStreamResult,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Main access point to a NATS deployment with JetStream enabled
#[derive(Clone)]
pub struct Environment {
    transport: Arc<dyn JetStream>,
    streams: StreamManager,
    consumers: ConsumerManager,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder(ConnectionOptions::default())
    }

    pub async fn from_connection_options(options: ConnectionOptions) -> JetStreamResult<Self> {
        let transport = options.connect().await?;
        Ok(Environment::from_transport(transport))
    }

    /// Runs on top of an already established transport.
    pub fn from_transport(transport: impl JetStream) -> Self {
        let transport: Arc<dyn JetStream> = Arc::new(transport);
        Environment {
            streams: StreamManager::new(transport.clone()),
            consumers: ConsumerManager::new(transport.clone()),
            transport,
        }
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn consumers(&self) -> &ConsumerManager {
        &self.consumers
    }

    pub fn transport(&self) -> &Arc<dyn JetStream> {
        &self.transport
    }

    /// Returns a builder for creating a stream with a specific configuration
    pub fn stream_creator(&self) -> StreamCreator {
        StreamCreator::new(self.streams.clone())
    }

    /// Delete a stream
    pub async fn delete_stream(&self, stream: &str) -> JetStreamResult<()> {
        self.streams.delete_stream(stream).await
    }

    /// Binds to the durable pull consumer `durable`, creating it on first use.
    /// An empty `stream` is looked up from `subject`.
    pub async fn create_pull_subscription(
        &self,
        stream: &str,
        subject: &str,
        durable: &str,
    ) -> JetStreamResult<PullSubscription> {
        PullSubscription::bind(self.transport.clone(), stream, subject, durable).await
    }

    /// Feeds the deliveries of a push consumer to `handler`. An empty
    /// `durable` creates an ephemeral consumer that is removed on close.
    pub async fn create_push_subscription(
        &self,
        stream: &str,
        subject: &str,
        durable: &str,
        handler: impl MessageHandler,
    ) -> JetStreamResult<PushSubscription> {
        PushSubscription::bind(self.transport.clone(), stream, subject, durable, handler).await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> JetStreamResult<()> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        self.transport
            .publish(subject, payload.into())
            .await
            .map_err(|err| Error::from_transport(ErrorCode::PublishFailed, err))
    }

    /// Publishes into a stream and waits for the stream's acknowledgment.
    pub async fn publish_to_stream(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> JetStreamResult<PublishAck> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        self.transport
            .publish_to_stream(subject, payload.into())
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamPublishFailed, err))
    }

    /// Publishes into a stream without waiting for the acknowledgment.
    ///
    /// The returned future settles with the stream's acknowledgment; failures
    /// on either side are reported as [`ErrorCode::StreamPublishAsyncFailed`].
    pub async fn publish_to_stream_async(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> JetStreamResult<PublishAckFuture> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        let pending = self
            .transport
            .publish_to_stream_async(subject, payload.into())
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamPublishAsyncFailed, err))?;
        trace!(%subject, "published, ack pending");
        Ok(PublishAckFuture(pending))
    }

    /// Sends a request and waits for its reply. A zero `timeout` waits 30 seconds.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> JetStreamResult<Message> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        let timeout = if timeout.is_zero() {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            timeout
        };
        self.transport
            .request(subject, payload.into(), timeout)
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    Error::with_source(
                        ErrorCode::Timeout,
                        format!("request on {subject} timed out"),
                        err,
                    )
                } else {
                    Error::from_transport(ErrorCode::RequestFailed, err)
                }
            })
    }

    /// Hands every message on `subject` to `handler`, optionally sharing the
    /// subject with the other members of `queue`.
    pub async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: impl MessageHandler,
    ) -> JetStreamResult<Subscription> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        let messages = self
            .transport
            .subscribe(subject, queue.filter(|queue| !queue.is_empty()))
            .await
            .map_err(|err| Error::from_transport(ErrorCode::SubscribeFailed, err))?;
        debug!(%subject, ?queue, "subscribed");

        Ok(Subscription::start(subject, messages, handler, self.transport.clone()))
    }

    pub async fn flush(&self) -> JetStreamResult<()> {
        ensure_connected(&*self.transport)?;

        self.transport
            .flush()
            .await
            .map_err(|err| Error::from_transport(ErrorCode::FlushFailed, err))
    }

    /// Like [`Environment::flush`], giving up once `timeout` has passed.
    pub async fn flush_timeout(&self, timeout: Duration) -> JetStreamResult<()> {
        ensure_connected(&*self.transport)?;

        match tokio::time::timeout(timeout, self.transport.flush()).await {
            Ok(flushed) => {
                flushed.map_err(|err| Error::from_transport(ErrorCode::FlushFailed, err))
            }
            Err(_) => Err(Error::new(
                ErrorCode::FlushFailed,
                format!("flush did not complete within {timeout:?}"),
            )),
        }
    }

    /// Traffic counters of the underlying connection.
    pub fn statistics(&self) -> ConnectionStats {
        self.transport.statistics()
    }

    /// Drains every subscription and closes the connection.
    pub async fn drain(&self) -> JetStreamResult<()> {
        ensure_connected(&*self.transport)?;

        self.transport
            .drain()
            .await
            .map_err(|err| Error::from_transport(ErrorCode::DrainFailed, err))
    }
}

/// Pending acknowledgment of [`Environment::publish_to_stream_async`].
#[must_use = "the acknowledgment is only observed when awaited"]
pub struct PublishAckFuture(PendingPublishAck);

impl Future for PublishAckFuture {
    type Output = JetStreamResult<PublishAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0
            .as_mut()
            .poll(cx)
            .map_err(|err| Error::from_transport(ErrorCode::StreamPublishAsyncFailed, err))
    }
}

/// Builder for [`Environment`]
pub struct EnvironmentBuilder(ConnectionOptions);

impl EnvironmentBuilder {
    pub async fn build(self) -> JetStreamResult<Environment> {
        Environment::from_connection_options(self.0).await
    }

    pub fn urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> EnvironmentBuilder {
        self.0.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn user_and_password(mut self, user: &str, password: &str) -> EnvironmentBuilder {
        self.0.user = user.to_owned();
        self.0.password = password.to_owned();
        self
    }

    pub fn token(mut self, token: &str) -> EnvironmentBuilder {
        self.0.token = token.to_owned();
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> EnvironmentBuilder {
        self.0.tls = Some(tls);
        self
    }

    pub fn allow_reconnect(mut self, allow_reconnect: bool) -> EnvironmentBuilder {
        self.0.allow_reconnect = allow_reconnect;
        self
    }

    pub fn max_reconnects(mut self, max_reconnects: usize) -> EnvironmentBuilder {
        self.0.max_reconnects = i64::try_from(max_reconnects).unwrap_or(i64::MAX);
        self
    }

    pub fn reconnect_wait(mut self, reconnect_wait: Duration) -> EnvironmentBuilder {
        self.0.reconnect_wait = whole_seconds(reconnect_wait);
        self
    }

    pub fn ping_interval(mut self, ping_interval: Duration) -> EnvironmentBuilder {
        self.0.ping_interval = whole_seconds(ping_interval);
        self
    }

    /// Timeout of stream and consumer administration requests.
    pub fn api_timeout(mut self, api_timeout: Duration) -> EnvironmentBuilder {
        self.0.api_timeout = whole_seconds(api_timeout);
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.0
    }
}

fn whole_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
