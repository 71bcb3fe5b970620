use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::{self, FutureExt};
use futures::StreamExt;
use nats_jetstream_protocol::{
    ack::ACK_PREFIX, parse_ack, subject, timestamp::to_chrono, AccountInfo, AckKind, AckPolicy,
    ApiError, ApiErrorCode, ConsumerAction, ConsumerDescriptor, ConsumerDescriptorExt,
    ConsumerInfo, DeliverPolicy, DiscardPolicy, MessageInfo, PublishAck, RetentionPolicy,
    SequenceInfo, StorageType, StreamDescriptor, StreamInfo, StreamState,
};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    ConnectionStats, JetStream, Message, MessageStream, PendingPublishAck, Transport,
    TransportError, TransportResult,
};
use crate::consumer::Redelivery;

const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);
const PUSH_TICK: Duration = Duration::from_millis(100);

/// In-process broker implementing [`JetStream`].
///
/// Streams, consumers, acknowledgments and redelivery live in memory and
/// follow the server's observable behavior closely enough to exercise the
/// client without a running server. Every administrative call is counted,
/// see [`MemoryTransport::admin_calls`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    connected: AtomicBool,
    admin_calls: AtomicUsize,
    traffic: Traffic,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
    subscriptions: DashMap<u64, CoreSubscription>,
    broker: Mutex<Broker>,
    activity: Notify,
}

#[derive(Default)]
struct Traffic {
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    in_messages: AtomicU64,
    out_messages: AtomicU64,
    connects: AtomicU64,
}

impl Traffic {
    fn sent(&self, payload: &Bytes) {
        self.out_messages.fetch_add(1, Ordering::Relaxed);
        self.out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
    }

    fn received(&self, payload: &Bytes) {
        self.in_messages.fetch_add(1, Ordering::Relaxed);
        self.in_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
    }
}

struct CoreSubscription {
    subject: String,
    queue: Option<String>,
    sender: UnboundedSender<Message>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        MemoryTransport::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(true),
                admin_calls: AtomicUsize::new(0),
                traffic: Traffic {
                    connects: AtomicU64::new(1),
                    ..Default::default()
                },
                next_id: AtomicU64::new(0),
                round_robin: AtomicUsize::new(0),
                subscriptions: DashMap::new(),
                broker: Mutex::new(Broker::default()),
                activity: Notify::new(),
            }),
        }
    }

    /// Number of stream and consumer administration calls received so far.
    pub fn admin_calls(&self) -> usize {
        self.inner.admin_calls.load(Ordering::SeqCst)
    }

    /// Simulates a lost connection: every further call fails with
    /// [`TransportError::Closed`] until [`MemoryTransport::reconnect`].
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.activity.notify_waiters();
    }

    pub fn reconnect(&self) {
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            self.inner.traffic.connects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn admin(&self) -> TransportResult<()> {
        self.inner.admin_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()
    }

    fn has_interest(&self, subject: &str) -> bool {
        self.inner.subscriptions.iter().any(|entry| {
            !entry.sender.is_closed() && subject::matches(&entry.subject, subject)
        })
    }

    /// Hands `message` to every plain subscriber of `subject` and to one
    /// member of each queue group. Returns how many subscribers got it.
    fn route(&self, subject: &str, message: Message) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();

        for entry in self.inner.subscriptions.iter() {
            if !subject::matches(&entry.subject, subject) {
                continue;
            }
            match &entry.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(*entry.key()),
                None => {
                    if entry.sender.unbounded_send(message.clone()).is_ok() {
                        self.inner.traffic.received(&message.payload);
                        delivered += 1;
                    } else {
                        closed.push(*entry.key());
                    }
                }
            }
        }

        for (_, mut members) in groups {
            members.sort_unstable();
            let start = self.inner.round_robin.fetch_add(1, Ordering::Relaxed);
            for offset in 0..members.len() {
                let id = members[(start + offset) % members.len()];
                let sent = self
                    .inner
                    .subscriptions
                    .get(&id)
                    .map(|member| member.sender.unbounded_send(message.clone()).is_ok())
                    .unwrap_or(false);
                if sent {
                    self.inner.traffic.received(&message.payload);
                    delivered += 1;
                    break;
                }
                closed.push(id);
            }
        }

        for id in closed {
            self.inner.subscriptions.remove(&id);
        }
        delivered
    }

    /// Stores `payload` in the stream capturing `subject`, if there is one.
    async fn store(&self, subject: &str, payload: &Bytes) -> TransportResult<Option<PublishAck>> {
        let mut broker = self.inner.broker.lock().await;
        let Some(name) = broker.stream_for(subject) else {
            return Ok(None);
        };
        let Some(stream) = broker.streams.get_mut(&name) else {
            return Ok(None);
        };

        let sequence = stream.append(subject, payload.clone())?;
        trace!(stream = %name, sequence, "stored message");
        self.push_pending(&name, stream);
        drop(broker);

        self.inner.activity.notify_waiters();
        Ok(Some(PublishAck {
            stream: name,
            sequence,
            ..Default::default()
        }))
    }

    async fn acknowledge(&self, reply: &str, payload: &[u8]) {
        let (Some(info), Some(kind)) = (MessageInfo::parse(reply), parse_ack(payload)) else {
            warn!(reply, "ignoring malformed acknowledgment");
            return;
        };

        let mut broker = self.inner.broker.lock().await;
        let Some(stream) = broker.streams.get_mut(&info.stream) else {
            return;
        };
        let Some(consumer) = stream.consumers.get_mut(&info.consumer) else {
            return;
        };

        let acked = consumer.acknowledge(info.stream_sequence, kind, Instant::now());
        if stream.config.retention == RetentionPolicy::WorkQueue {
            for sequence in acked {
                stream.messages.remove(&sequence);
            }
        }
        self.push_pending(&info.stream, stream);
        drop(broker);

        self.inner.activity.notify_waiters();
    }

    /// Delivers what push consumers of `stream` have due, to their deliver
    /// subjects. Consumers nobody listens to keep their position.
    fn push_pending(&self, name: &str, stream: &mut StoredStream) {
        let StoredStream {
            messages,
            consumers,
            ..
        } = stream;

        for consumer in consumers.values_mut() {
            let Some(deliver_subject) = consumer.config.deliver_subject.clone() else {
                continue;
            };
            if !self.has_interest(&deliver_subject) {
                continue;
            }
            let (deliveries, _) = consumer.next_batch(name, messages, usize::MAX, Instant::now());
            for message in deliveries {
                self.route(&deliver_subject, message);
            }
        }
    }

    /// Returns false once the consumer is gone.
    async fn pump(&self, stream: &str, consumer: &str) -> bool {
        let mut broker = self.inner.broker.lock().await;
        let Some(stored) = broker.streams.get_mut(stream) else {
            return false;
        };
        if !stored.consumers.contains_key(consumer) {
            return false;
        }
        if self.is_connected() {
            self.push_pending(stream, stored);
        }
        true
    }

    /// Redelivery of push consumers is time driven, so each one gets a
    /// ticker that lives as long as the consumer and the broker do.
    fn watch_push_consumer(&self, stream: String, consumer: String) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUSH_TICK);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !(MemoryTransport { inner }).pump(&stream, &consumer).await {
                    debug!(%stream, %consumer, "push consumer gone, stopping redelivery");
                    break;
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn new_inbox(&self) -> String {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.{}.{id}", uuid::Uuid::new_v4().simple())
    }

    fn statistics(&self) -> ConnectionStats {
        let traffic = &self.inner.traffic;
        ConnectionStats {
            in_bytes: traffic.in_bytes.load(Ordering::Relaxed),
            out_bytes: traffic.out_bytes.load(Ordering::Relaxed),
            in_messages: traffic.in_messages.load(Ordering::Relaxed),
            out_messages: traffic.out_messages.load(Ordering::Relaxed),
            connects: traffic.connects.load(Ordering::Relaxed),
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.ensure_connected()?;
        self.inner.traffic.sent(&payload);

        if subject.starts_with(ACK_PREFIX) {
            self.acknowledge(subject, &payload).await;
            return Ok(());
        }

        if let Err(error) = self.store(subject, &payload).await {
            debug!(subject, %error, "core publish not stored");
        }
        self.route(subject, Message::new(subject, payload));
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Message> {
        self.ensure_connected()?;
        self.inner.traffic.sent(&payload);

        let stored = self.store(subject, &payload).await?;
        let inbox = self.new_inbox();
        let mut responses = self.subscribe(&inbox, None).await?;

        let routed = self.route(
            subject,
            Message::new(subject, payload).with_reply(inbox.clone()),
        );
        if routed == 0 {
            return match stored {
                Some(ack) => {
                    let body = serde_json::json!({ "stream": ack.stream, "seq": ack.sequence });
                    Ok(Message::new(inbox, serde_json::to_vec(&body)?))
                }
                None => Err(TransportError::NoResponders(subject.to_owned())),
            };
        }

        match tokio::time::timeout(timeout, responses.next()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> TransportResult<MessageStream> {
        self.ensure_connected()?;

        let (sender, receiver) = unbounded();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.insert(
            id,
            CoreSubscription {
                subject: subject.to_owned(),
                queue: queue.map(str::to_owned),
                sender,
            },
        );
        Ok(receiver.boxed())
    }

    async fn flush(&self) -> TransportResult<()> {
        self.ensure_connected()
    }

    async fn drain(&self) -> TransportResult<()> {
        self.ensure_connected()?;
        // Dropping the senders ends each subscription once its buffer is read.
        self.inner.subscriptions.clear();
        self.disconnect();
        Ok(())
    }
}

#[async_trait::async_trait]
impl JetStream for MemoryTransport {
    async fn create_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo> {
        self.admin()?;
        let config = normalize_stream(descriptor.clone());

        let mut broker = self.inner.broker.lock().await;
        if let Some(existing) = broker.streams.get(&config.name) {
            return if existing.config == config {
                Ok(existing.info())
            } else {
                Err(ApiError::new(
                    400,
                    ApiErrorCode::StreamNameInUse,
                    "stream name already in use with a different configuration",
                )
                .into())
            };
        }
        if broker.overlaps(&config.name, &config.subjects) {
            return Err(ApiError::new(
                400,
                ApiErrorCode::Other(10065),
                "subjects overlap with an existing stream",
            )
            .into());
        }

        let stream = StoredStream::new(config);
        let info = stream.info();
        broker.streams.insert(info.config.name.clone(), stream);
        Ok(info)
    }

    async fn update_stream(&self, descriptor: &StreamDescriptor) -> TransportResult<StreamInfo> {
        self.admin()?;
        let config = normalize_stream(descriptor.clone());

        let mut broker = self.inner.broker.lock().await;
        if broker.overlaps(&config.name, &config.subjects) {
            return Err(ApiError::new(
                400,
                ApiErrorCode::Other(10065),
                "subjects overlap with an existing stream",
            )
            .into());
        }
        let stream = broker
            .streams
            .get_mut(&config.name)
            .ok_or_else(ApiError::stream_not_found)?;

        if stream.config.retention != config.retention || stream.config.storage != config.storage
        {
            return Err(ApiError::new(
                500,
                ApiErrorCode::Other(10052),
                "stream configuration update can not change retention or storage",
            )
            .into());
        }

        stream.config = config;
        stream.enforce_limits();
        Ok(stream.info())
    }

    async fn delete_stream(&self, stream: &str) -> TransportResult<()> {
        self.admin()?;
        let mut broker = self.inner.broker.lock().await;
        broker
            .streams
            .remove(stream)
            .map(|_| ())
            .ok_or_else(|| ApiError::stream_not_found().into())
    }

    async fn stream_info(&self, stream: &str) -> TransportResult<StreamInfo> {
        self.admin()?;
        let broker = self.inner.broker.lock().await;
        Ok(broker.stream(stream)?.info())
    }

    async fn stream_names(&self, subject: Option<&str>) -> TransportResult<Vec<String>> {
        self.admin()?;
        let broker = self.inner.broker.lock().await;
        Ok(broker
            .streams
            .iter()
            .filter(|(_, stream)| subject.map_or(true, |subject| stream.captures(subject)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn purge_stream(&self, stream: &str) -> TransportResult<u64> {
        self.admin()?;
        let mut broker = self.inner.broker.lock().await;
        let stored = broker.stream_mut(stream)?;
        let purged = stored.messages.len() as u64;
        stored.messages.clear();
        let next = stored.last_seq + 1;
        for consumer in stored.consumers.values_mut() {
            consumer.pending.clear();
            consumer.next_seq = consumer.next_seq.max(next);
        }
        Ok(purged)
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> TransportResult<()> {
        self.admin()?;
        let mut broker = self.inner.broker.lock().await;
        let stored = broker.stream_mut(stream)?;
        match stored.messages.remove(&sequence) {
            Some(_) => Ok(()),
            None => {
                Err(ApiError::new(400, ApiErrorCode::NoMessageFound, "no message found").into())
            }
        }
    }

    async fn account_info(&self) -> TransportResult<AccountInfo> {
        self.admin()?;
        let broker = self.inner.broker.lock().await;
        let mut info = AccountInfo::default();
        for stream in broker.streams.values() {
            let bytes = stream.bytes();
            match stream.config.storage {
                StorageType::Memory => info.memory += bytes,
                StorageType::File => info.storage += bytes,
            }
            info.streams += 1;
            info.consumers += stream.consumers.len();
        }
        Ok(info)
    }

    async fn publish_to_stream(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PublishAck> {
        self.ensure_connected()?;
        self.inner.traffic.sent(&payload);
        let ack = self
            .store(subject, &payload)
            .await?
            .ok_or_else(|| TransportError::NoResponders(subject.to_owned()))?;
        self.route(subject, Message::new(subject, payload));
        Ok(ack)
    }

    /// Storing is synchronous here, so the acknowledgment is already settled.
    async fn publish_to_stream_async(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> TransportResult<PendingPublishAck> {
        self.ensure_connected()?;
        let acked = self.publish_to_stream(subject, payload).await;
        Ok(future::ready(acked).boxed())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo> {
        self.admin()?;
        if descriptor.deliver_policy == (DeliverPolicy::ByStartSequence { start_sequence: 0 }) {
            return Err(ApiError::new(
                400,
                ApiErrorCode::Other(10094),
                "consumer delivery policy is deliver by start sequence, but optional start \
                 sequence is not set",
            )
            .into());
        }
        let mut config = normalize_consumer(descriptor.clone());
        let name = match config.consumer_name() {
            Some(name) => name.to_owned(),
            None => {
                let name = uuid::Uuid::new_v4().simple().to_string();
                config.name = Some(name.clone());
                name
            }
        };

        let mut broker = self.inner.broker.lock().await;
        let stored = broker.stream_mut(stream)?;
        let created = match stored.consumers.get_mut(&name) {
            Some(existing) => {
                if action == ConsumerAction::Create && existing.config != config {
                    return Err(ApiError::new(
                        400,
                        ApiErrorCode::ConsumerAlreadyExists,
                        "consumer already exists",
                    )
                    .into());
                }
                existing.reconfigure(config);
                false
            }
            None => {
                if action == ConsumerAction::Update {
                    return Err(ApiError::new(
                        404,
                        ApiErrorCode::ConsumerDoesNotExist,
                        "consumer does not exist",
                    )
                    .into());
                }
                let consumer = StoredConsumer::new(config, stored);
                stored.consumers.insert(name.clone(), consumer);
                true
            }
        };

        let Some(consumer) = stored.consumers.get(&name) else {
            return Err(ApiError::consumer_not_found().into());
        };
        let info = consumer.info(stream, &name, &stored.messages);
        let is_push = consumer.config.is_push();
        if is_push {
            self.push_pending(stream, stored);
        }
        drop(broker);

        if created && is_push {
            self.watch_push_consumer(stream.to_owned(), name);
        }
        Ok(info)
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()> {
        self.admin()?;
        let mut broker = self.inner.broker.lock().await;
        broker
            .stream_mut(stream)?
            .consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| ApiError::consumer_not_found().into())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo> {
        self.admin()?;
        let broker = self.inner.broker.lock().await;
        let stored = broker.stream(stream)?;
        let info = stored
            .consumers
            .get(consumer)
            .ok_or_else(ApiError::consumer_not_found)?
            .info(stream, consumer, &stored.messages);
        Ok(info)
    }

    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>> {
        self.admin()?;
        let broker = self.inner.broker.lock().await;
        Ok(broker.stream(stream)?.consumers.keys().cloned().collect())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> TransportResult<Vec<Message>> {
        self.ensure_connected()?;
        let deadline = Instant::now() + expires;

        loop {
            // Registered before looking, so a store in between still wakes us.
            let activity = self.inner.activity.notified();
            tokio::pin!(activity);
            activity.as_mut().enable();

            let (messages, wake_at) = {
                let mut broker = self.inner.broker.lock().await;
                let StoredStream {
                    messages,
                    consumers,
                    ..
                } = broker.stream_mut(stream)?;
                let stored = consumers
                    .get_mut(consumer)
                    .ok_or_else(ApiError::consumer_not_found)?;
                if stored.config.is_push() {
                    return Err(TransportError::Status {
                        code: 409,
                        description: "consumer is push based".to_owned(),
                    });
                }
                stored.next_batch(stream, messages, batch, Instant::now())
            };

            if !messages.is_empty() {
                return Ok(messages);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }

            let wake_at = wake_at.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, activity).await;
            self.ensure_connected()?;
        }
    }
}

/// Zero limits are stored as `-1`, the server's spelling of unlimited.
fn normalize_stream(mut config: StreamDescriptor) -> StreamDescriptor {
    if config.subjects.is_empty() {
        config.subjects = vec![config.name.clone()];
    }
    for limit in [
        &mut config.max_messages,
        &mut config.max_bytes,
        &mut config.max_messages_per_subject,
    ] {
        if *limit == 0 {
            *limit = -1;
        }
    }
    if config.max_consumers == 0 {
        config.max_consumers = -1;
    }
    if config.max_message_size == 0 {
        config.max_message_size = -1;
    }
    if config.num_replicas == 0 {
        config.num_replicas = 1;
    }
    if config.duplicate_window.is_zero() {
        config.duplicate_window = DEFAULT_DUPLICATE_WINDOW;
    }
    config
}

fn normalize_consumer(mut config: ConsumerDescriptor) -> ConsumerDescriptor {
    if config.max_deliver == 0 {
        config.max_deliver = -1;
    }
    if config.ack_wait.is_zero() {
        config.ack_wait = DEFAULT_ACK_WAIT;
    }
    config
}

#[derive(Default)]
struct Broker {
    streams: BTreeMap<String, StoredStream>,
}

impl Broker {
    fn stream(&self, name: &str) -> Result<&StoredStream, ApiError> {
        self.streams.get(name).ok_or_else(ApiError::stream_not_found)
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut StoredStream, ApiError> {
        self.streams
            .get_mut(name)
            .ok_or_else(ApiError::stream_not_found)
    }

    fn stream_for(&self, subject: &str) -> Option<String> {
        self.streams
            .iter()
            .find(|(_, stream)| stream.captures(subject))
            .map(|(name, _)| name.clone())
    }

    fn overlaps(&self, name: &str, subjects: &[String]) -> bool {
        self.streams
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .flat_map(|(_, stream)| stream.config.subjects.iter())
            .any(|existing| {
                subjects.iter().any(|subject| {
                    subject::matches(existing, subject) || subject::matches(subject, existing)
                })
            })
    }
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    published: DateTime<Utc>,
}

struct StoredStream {
    config: StreamDescriptor,
    created: DateTime<Utc>,
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    consumers: BTreeMap<String, StoredConsumer>,
}

impl StoredStream {
    fn new(config: StreamDescriptor) -> Self {
        StoredStream {
            config,
            created: Utc::now(),
            messages: BTreeMap::new(),
            last_seq: 0,
            consumers: BTreeMap::new(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject))
    }

    fn bytes(&self) -> u64 {
        self.messages
            .values()
            .map(|message| message.payload.len() as u64)
            .sum()
    }

    fn over_limits(&self, extra_messages: usize, extra_bytes: u64) -> bool {
        let max_msgs = self.config.max_messages;
        let max_bytes = self.config.max_bytes;
        (max_msgs > 0 && (self.messages.len() + extra_messages) as i64 > max_msgs)
            || (max_bytes > 0 && (self.bytes() + extra_bytes) as i64 > max_bytes)
    }

    fn append(&mut self, subject: &str, payload: Bytes) -> Result<u64, ApiError> {
        let size = payload.len() as u64;
        if self.config.discard == DiscardPolicy::New && self.over_limits(1, size) {
            return Err(ApiError::new(
                503,
                ApiErrorCode::Other(10077),
                "maximum messages or bytes exceeded",
            ));
        }

        self.last_seq += 1;
        self.messages.insert(
            self.last_seq,
            StoredMessage {
                subject: subject.to_owned(),
                payload,
                published: Utc::now(),
            },
        );
        self.enforce_subject_limit(subject);
        self.enforce_limits();
        Ok(self.last_seq)
    }

    /// Drops the oldest messages until the stream fits its limits again.
    fn enforce_limits(&mut self) {
        while self.messages.len() > 1 && self.over_limits(0, 0) {
            self.messages.pop_first();
        }
    }

    fn enforce_subject_limit(&mut self, subject: &str) {
        let Ok(limit) = usize::try_from(self.config.max_messages_per_subject) else {
            return;
        };
        let same_subject: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, message)| message.subject == subject)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in same_subject.iter().take(same_subject.len().saturating_sub(limit)) {
            self.messages.remove(sequence);
        }
    }

    fn info(&self) -> StreamInfo {
        let first_seq = match self.messages.keys().next() {
            Some(first) => *first,
            None if self.last_seq == 0 => 0,
            None => self.last_seq + 1,
        };
        StreamInfo {
            config: self.config.clone(),
            created: self.created,
            state: StreamState {
                messages: self.messages.len() as u64,
                bytes: self.bytes(),
                first_seq,
                last_seq: self.last_seq,
                consumer_count: self.consumers.len(),
            },
        }
    }
}

struct Pending {
    deliveries: u64,
    redeliver_at: Instant,
}

struct StoredConsumer {
    config: ConsumerDescriptor,
    created: DateTime<Utc>,
    schedule: Redelivery,
    next_seq: u64,
    /// Stream tail when the consumer was created, for `last_per_subject`.
    start_last_seq: u64,
    consumer_seq: u64,
    delivered_stream_seq: u64,
    ack_floor: SequenceInfo,
    pending: BTreeMap<u64, Pending>,
    redelivered: u64,
}

impl StoredConsumer {
    fn new(config: ConsumerDescriptor, stream: &StoredStream) -> Self {
        let first = stream.messages.keys().next().copied().unwrap_or(stream.last_seq + 1);
        let next_seq = match config.deliver_policy {
            DeliverPolicy::All | DeliverPolicy::LastPerSubject => first,
            DeliverPolicy::Last => stream
                .messages
                .keys()
                .next_back()
                .copied()
                .unwrap_or(stream.last_seq + 1),
            DeliverPolicy::New => stream.last_seq + 1,
            DeliverPolicy::ByStartSequence { start_sequence } => start_sequence.max(1),
            DeliverPolicy::ByStartTime { start_time } => {
                let start = to_chrono(start_time);
                stream
                    .messages
                    .iter()
                    .find(|(_, message)| message.published >= start)
                    .map(|(sequence, _)| *sequence)
                    .unwrap_or(stream.last_seq + 1)
            }
        };

        StoredConsumer {
            schedule: Redelivery::from_descriptor(&config),
            config,
            created: Utc::now(),
            next_seq,
            start_last_seq: stream.last_seq,
            consumer_seq: 0,
            delivered_stream_seq: 0,
            ack_floor: SequenceInfo::default(),
            pending: BTreeMap::new(),
            redelivered: 0,
        }
    }

    fn reconfigure(&mut self, config: ConsumerDescriptor) {
        self.schedule = Redelivery::from_descriptor(&config);
        self.config = config;
    }

    fn accepts(
        &self,
        sequence: u64,
        message: &StoredMessage,
        messages: &BTreeMap<u64, StoredMessage>,
    ) -> bool {
        let filter = &self.config.filter_subject;
        let filters = &self.config.filter_subjects;
        let filtered = (filter.is_empty() || subject::matches(filter, &message.subject))
            && (filters.is_empty()
                || filters
                    .iter()
                    .any(|filter| subject::matches(filter, &message.subject)));
        if !filtered {
            return false;
        }
        if self.config.deliver_policy == DeliverPolicy::LastPerSubject
            && sequence < self.start_last_seq
        {
            let superseded = messages
                .range(sequence + 1..=self.start_last_seq)
                .any(|(_, later)| later.subject == message.subject);
            return !superseded;
        }
        true
    }

    fn num_pending(&self, messages: &BTreeMap<u64, StoredMessage>) -> u64 {
        messages
            .range(self.next_seq..)
            .filter(|(sequence, message)| self.accepts(**sequence, message, messages))
            .count() as u64
    }

    fn deliver(
        &mut self,
        stream: &str,
        sequence: u64,
        deliveries: u64,
        messages: &BTreeMap<u64, StoredMessage>,
        now: Instant,
    ) -> Option<Message> {
        let message = messages.get(&sequence)?;
        self.consumer_seq += 1;
        self.delivered_stream_seq = self.delivered_stream_seq.max(sequence);

        if self.config.ack_policy == AckPolicy::None {
            self.ack_floor = SequenceInfo {
                consumer_seq: self.consumer_seq,
                stream_seq: sequence,
            };
        } else {
            self.pending.insert(
                sequence,
                Pending {
                    deliveries,
                    redeliver_at: now + self.schedule.delay_for(deliveries),
                },
            );
        }

        let info = MessageInfo {
            domain: None,
            stream: stream.to_owned(),
            consumer: self.config.consumer_name().unwrap_or_default().to_owned(),
            delivered: deliveries,
            stream_sequence: sequence,
            consumer_sequence: self.consumer_seq,
            published: message.published,
            pending: self.num_pending(messages),
        };
        Some(
            Message::new(message.subject.clone(), message.payload.clone())
                .with_reply(info.reply_subject()),
        )
    }

    /// Collects up to `batch` deliveries: due redeliveries first, then new
    /// messages. Also returns when the next redelivery falls due.
    fn next_batch(
        &mut self,
        stream: &str,
        messages: &BTreeMap<u64, StoredMessage>,
        batch: usize,
        now: Instant,
    ) -> (Vec<Message>, Option<Instant>) {
        let mut out = Vec::new();

        let due: Vec<(u64, u64)> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.redeliver_at <= now)
            .map(|(sequence, pending)| (*sequence, pending.deliveries))
            .collect();
        for (sequence, deliveries) in due {
            if out.len() >= batch {
                break;
            }
            if !messages.contains_key(&sequence) || !self.schedule.allows_redelivery(deliveries) {
                self.pending.remove(&sequence);
                continue;
            }
            if let Some(message) = self.deliver(stream, sequence, deliveries + 1, messages, now) {
                self.redelivered += 1;
                out.push(message);
            }
        }

        while out.len() < batch && !self.ack_pending_full() {
            let next = messages
                .range(self.next_seq..)
                .find(|(sequence, message)| self.accepts(**sequence, message, messages))
                .map(|(sequence, _)| *sequence);
            let Some(sequence) = next else {
                break;
            };
            self.next_seq = sequence + 1;
            if let Some(message) = self.deliver(stream, sequence, 1, messages, now) {
                out.push(message);
            }
        }

        let wake_at = self.pending.values().map(|pending| pending.redeliver_at).min();
        (out, wake_at)
    }

    /// New deliveries stop while `max_ack_pending` messages await their ack.
    fn ack_pending_full(&self) -> bool {
        let limit = self.config.max_ack_pending;
        limit > 0 && self.pending.len() as i64 >= limit
    }

    /// Applies an acknowledgment and returns the sequences it settled.
    fn acknowledge(&mut self, sequence: u64, kind: AckKind, now: Instant) -> Vec<u64> {
        match kind {
            AckKind::Ack | AckKind::Next => {
                let settled: Vec<u64> = match self.config.ack_policy {
                    AckPolicy::All => self
                        .pending
                        .range(..=sequence)
                        .map(|(seq, _)| *seq)
                        .collect(),
                    _ => self
                        .pending
                        .contains_key(&sequence)
                        .then_some(sequence)
                        .into_iter()
                        .collect(),
                };
                for seq in &settled {
                    self.pending.remove(seq);
                }
                self.update_ack_floor();
                settled
            }
            AckKind::Nak(delay) => {
                if let Some(pending) = self.pending.get_mut(&sequence) {
                    pending.redeliver_at = now + delay.unwrap_or_default();
                }
                Vec::new()
            }
            AckKind::Progress => {
                if let Some(pending) = self.pending.get_mut(&sequence) {
                    pending.redeliver_at = now + self.config.ack_wait;
                }
                Vec::new()
            }
            AckKind::Term => {
                self.pending.remove(&sequence);
                self.update_ack_floor();
                Vec::new()
            }
        }
    }

    fn update_ack_floor(&mut self) {
        self.ack_floor = match self.pending.keys().next() {
            Some(first) => SequenceInfo {
                consumer_seq: self.ack_floor.consumer_seq,
                stream_seq: first.saturating_sub(1),
            },
            None => SequenceInfo {
                consumer_seq: self.consumer_seq,
                stream_seq: self.delivered_stream_seq,
            },
        };
    }

    fn info(
        &self,
        stream: &str,
        name: &str,
        messages: &BTreeMap<u64, StoredMessage>,
    ) -> ConsumerInfo {
        ConsumerInfo {
            stream_name: stream.to_owned(),
            name: name.to_owned(),
            created: self.created,
            config: self.config.clone(),
            delivered: SequenceInfo {
                consumer_seq: self.consumer_seq,
                stream_seq: self.delivered_stream_seq,
            },
            ack_floor: self.ack_floor,
            num_ack_pending: self.pending.len() as u64,
            num_redelivered: self.redelivered,
            num_waiting: 0,
            num_pending: self.num_pending(messages),
        }
    }
}
