use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nats_jetstream_protocol::{AckPolicy, ConsumerAction, ConsumerDescriptor};
use tracing::{debug, warn};

use super::{resolve_stream, Subscription, SubscriptionState};
use crate::{
    dispatcher::DispatchStats,
    error::{Error, ErrorCode},
    handler::MessageHandler,
    transport::{ensure_connected, JetStream},
    JetStreamResult,
};

/// A push consumer whose deliveries are handed to a [`MessageHandler`].
pub struct PushSubscription {
    inner: Subscription,
    stream: String,
    consumer: String,
    ephemeral: bool,
    released: AtomicBool,
    transport: Arc<dyn JetStream>,
}

impl std::fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSubscription")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

impl PushSubscription {
    /// Binds to a durable push consumer, or creates one targeting a fresh
    /// inbox. An empty `durable` creates an ephemeral consumer.
    pub(crate) async fn bind<H: MessageHandler>(
        transport: Arc<dyn JetStream>,
        stream: &str,
        subject: &str,
        durable: &str,
        handler: H,
    ) -> JetStreamResult<PushSubscription> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*transport)?;

        let stream =
            resolve_stream(&*transport, stream, subject, ErrorCode::PushSubscribeFailed).await?;

        if !durable.is_empty() {
            match transport.consumer_info(&stream, durable).await {
                Ok(info) => {
                    let Some(deliver_subject) = info.config.deliver_subject else {
                        return Err(Error::new(
                            ErrorCode::PushSubscribeFailed,
                            format!("consumer {durable} on {stream} is pull based"),
                        ));
                    };
                    let messages = transport
                        .subscribe(&deliver_subject, None)
                        .await
                        .map_err(|err| {
                            Error::from_transport(ErrorCode::PushSubscribeFailed, err)
                        })?;
                    debug!(%stream, consumer = %durable, "bound to existing push consumer");
                    let inner = Subscription::start(
                        &deliver_subject,
                        messages,
                        handler,
                        transport.clone(),
                    );
                    return Ok(PushSubscription::new(
                        inner,
                        stream,
                        durable.to_owned(),
                        false,
                        transport,
                    ));
                }
                Err(err) if err.is_consumer_not_found() => {}
                Err(err) => return Err(Error::from_transport(ErrorCode::PushSubscribeFailed, err)),
            }
        }

        let inbox = transport.new_inbox();
        let messages = transport
            .subscribe(&inbox, None)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::PushSubscribeFailed, err))?;

        let ephemeral = durable.is_empty();
        let descriptor = ConsumerDescriptor {
            name: ephemeral.then(|| uuid::Uuid::new_v4().simple().to_string()),
            durable_name: (!ephemeral).then(|| durable.to_owned()),
            deliver_subject: Some(inbox.clone()),
            filter_subject: subject.to_owned(),
            ack_policy: AckPolicy::Explicit,
            ..Default::default()
        };
        let info = transport
            .create_consumer(&stream, &descriptor, ConsumerAction::Create)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::PushSubscribeFailed, err))?;
        debug!(%stream, consumer = %info.name, ephemeral, "created push consumer");

        let inner = Subscription::start(&inbox, messages, handler, transport.clone());
        Ok(PushSubscription::new(inner, stream, info.name, ephemeral, transport))
    }

    fn new(
        inner: Subscription,
        stream: String,
        consumer: String,
        ephemeral: bool,
        transport: Arc<dyn JetStream>,
    ) -> Self {
        PushSubscription {
            inner,
            stream,
            consumer,
            ephemeral,
            released: AtomicBool::new(false),
            transport,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.stats()
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Inbox the consumer delivers to.
    pub fn deliver_subject(&self) -> &str {
        self.inner.subject()
    }

    /// Stops dispatch at once and drops queued messages. Unacknowledged
    /// messages are redelivered by the server.
    pub async fn close(&self) {
        self.inner.close().await;
        self.release().await;
    }

    /// Dispatches the queued messages before closing.
    pub async fn drain(&self) {
        self.inner.drain().await;
        self.release().await;
    }

    async fn release(&self) {
        if !self.ephemeral || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .transport
            .delete_consumer(&self.stream, &self.consumer)
            .await
        {
            warn!(
                stream = %self.stream,
                consumer = %self.consumer,
                error = %err,
                "failed to delete ephemeral consumer"
            );
        }
    }
}
