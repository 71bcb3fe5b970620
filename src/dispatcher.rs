use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::StreamExt;
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    delivery::Delivery,
    handler::MessageHandler,
    subscription::SubscriptionState,
    task::TaskHandle,
    transport::{JetStream, Message, MessageStream},
};

const QUEUE_CAPACITY: usize = 10000;

/// Counters of a handler driven subscription, as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages taken off the subscription.
    pub received: u64,
    /// Messages handed to the handler.
    pub dispatched: u64,
    /// Queued messages discarded by `close`.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Moves messages from a subscription into a bounded queue and feeds them
/// to a handler from a dedicated task.
pub(crate) struct Dispatcher {
    shutdown: CancellationToken,
    intake: CancellationToken,
    reader: TaskHandle,
    worker: TaskHandle,
}

impl Dispatcher {
    pub(crate) fn start<H>(
        messages: MessageStream,
        handler: H,
        transport: Arc<dyn JetStream>,
        state: Arc<watch::Sender<SubscriptionState>>,
        counters: Arc<Counters>,
    ) -> Dispatcher
    where
        H: MessageHandler,
    {
        let shutdown = CancellationToken::new();
        let intake = shutdown.child_token();
        let (tx, rx) = channel(QUEUE_CAPACITY);

        let reader = tokio::spawn(read_messages(
            messages,
            tx,
            intake.clone(),
            state,
            counters.clone(),
        ));
        let worker = tokio::spawn(dispatch_messages(
            rx,
            handler,
            transport,
            shutdown.clone(),
            counters,
        ));

        Dispatcher {
            shutdown,
            intake,
            reader: reader.into(),
            worker: worker.into(),
        }
    }

    /// Stops at once; whatever is still queued is dropped.
    pub(crate) async fn close(self) {
        self.shutdown.cancel();
        self.reader.wait().await;
        self.worker.wait().await;
    }

    /// Stops taking messages, hands everything queued to the handler, then stops.
    pub(crate) async fn drain(self) {
        self.intake.cancel();
        self.reader.wait().await;
        self.worker.wait().await;
        self.shutdown.cancel();
    }
}

async fn read_messages(
    mut messages: MessageStream,
    queue: Sender<Message>,
    intake: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
    counters: Arc<Counters>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = intake.cancelled() => break,
            message = messages.next() => message,
        };

        let Some(message) = message else {
            warn!("subscription ended unexpectedly");
            state.send_if_modified(|state| {
                if state.is_active() {
                    *state = SubscriptionState::Errored;
                    true
                } else {
                    false
                }
            });
            break;
        };

        counters.received.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            biased;
            _ = intake.cancelled() => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }
            sent = queue.send(message) => {
                if sent.is_err() {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
    }
}

async fn dispatch_messages<H: MessageHandler>(
    mut queue: Receiver<Message>,
    handler: H,
    transport: Arc<dyn JetStream>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        trace!(subject = %message.subject, "dispatching message");
        let delivery = Delivery::new(message, transport.clone());
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }
            result = handler.handle_message(delivery) => {
                counters.dispatched.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = result {
                    warn!(error = %err, "message handler failed");
                }
            }
        }
    }

    queue.close();
    while queue.try_recv().is_ok() {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
