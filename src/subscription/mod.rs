//! Runtime handles over consumers and core subjects.
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::{
    dispatcher::{Counters, DispatchStats, Dispatcher},
    error::{Error, ErrorCode},
    handler::MessageHandler,
    transport::{JetStream, MessageStream},
    JetStreamResult,
};

mod pull;
mod push;

pub use pull::PullSubscription;
pub use push::PushSubscription;

/// `Created → Active → {Closed | Errored}`. The last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Created,
    Active,
    Closed,
    Errored,
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Errored)
    }
}

/// Moves an active or created subscription to `next`; terminal states stick.
pub(crate) fn transition(
    state: &watch::Sender<SubscriptionState>,
    next: SubscriptionState,
) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// `stream`, or the stream capturing `subject` when it is empty.
pub(crate) async fn resolve_stream(
    transport: &dyn JetStream,
    stream: &str,
    subject: &str,
    code: ErrorCode,
) -> JetStreamResult<String> {
    if !stream.is_empty() {
        return Ok(stream.to_owned());
    }
    let names = transport
        .stream_names(Some(subject))
        .await
        .map_err(|err| Error::from_transport(code, err))?;
    names.into_iter().next().ok_or_else(|| {
        Error::new(
            ErrorCode::StreamNotFound,
            format!("no stream matches subject {subject}"),
        )
    })
}

/// A handler driven subscription on a core subject.
pub struct Subscription {
    subject: String,
    state: Arc<watch::Sender<SubscriptionState>>,
    counters: Arc<Counters>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Subscription {
    pub(crate) fn start<H: MessageHandler>(
        subject: &str,
        messages: MessageStream,
        handler: H,
        transport: Arc<dyn JetStream>,
    ) -> Subscription {
        let (state, _) = watch::channel(SubscriptionState::Created);
        let state = Arc::new(state);
        let counters = Arc::new(Counters::default());

        transition(&state, SubscriptionState::Active);
        let dispatcher = Dispatcher::start(
            messages,
            handler,
            transport,
            state.clone(),
            counters.clone(),
        );

        Subscription {
            subject: subject.to_owned(),
            state,
            counters,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Stops dispatching at once. Calling it again does nothing.
    pub async fn close(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            debug!(subject = %self.subject, "closing subscription");
            dispatcher.close().await;
        }
        transition(&self.state, SubscriptionState::Closed);
    }

    /// Dispatches what is already queued, then closes.
    pub async fn drain(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            debug!(subject = %self.subject, "draining subscription");
            dispatcher.drain().await;
        }
        transition(&self.state, SubscriptionState::Closed);
    }
}
