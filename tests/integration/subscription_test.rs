use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use nats_jetstream_client::{
    error::ErrorKind, types::ConsumerDescriptorExt, ConsumerConfig, Delivery, Error, ErrorCode,
    JetStreamResult, MessageHandler, SubscriptionState,
};
use tokio::sync::Semaphore;

use super::common::{eventually, ignore, TestEnvironment};

#[tokio::test(flavor = "multi_thread")]
async fn pull_subscription_creates_its_consumer() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();

    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &durable)
        .await
        .unwrap();
    let info = subscription.info().await.unwrap();

    assert_eq!(SubscriptionState::Active, subscription.state());
    assert_eq!(test.subject("created"), info.config.filter_subject);
    assert!(!info.config.is_push());
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_subscription_validates_before_connecting() {
    let test = TestEnvironment::create().await;
    let calls = test.transport.admin_calls();

    let empty_subject = test
        .env
        .create_pull_subscription(&test.stream, "", "C1")
        .await
        .unwrap_err();
    let empty_durable = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), "")
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::EmptySubject, empty_subject.code());
    assert_eq!(ErrorCode::EmptyConsumerName, empty_durable.code());
    assert_eq!(calls, test.transport.admin_calls());
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_subscription_requires_a_connection() {
    let test = TestEnvironment::create().await;
    test.transport.disconnect();

    let error = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), "C1")
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::ConnectionClosed, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_subscription_resolves_stream_from_subject() {
    let test = TestEnvironment::create().await;

    let subscription = test
        .env
        .create_pull_subscription("", &test.subject("created"), &test.durable())
        .await
        .unwrap();

    assert_eq!(test.stream, subscription.stream());
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_returns_partial_batches_in_order() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();
    test.publish("created", 3).await;

    let batch = subscription
        .fetch(10, Duration::from_millis(200))
        .await
        .unwrap();

    let payloads: Vec<&[u8]> = batch.iter().map(|delivery| delivery.payload().as_ref()).collect();
    assert_eq!(
        vec![&b"message 0"[..], &b"message 1"[..], &b"message 2"[..]],
        payloads
    );
    let info = batch[2].info().unwrap();
    assert_eq!(test.stream, info.stream);
    assert_eq!(subscription.consumer(), info.consumer);
    assert_eq!(3, info.stream_sequence);
    assert_eq!(1, info.delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_with_zero_batch_takes_one_message() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();
    test.publish("created", 2).await;

    let batch = subscription.fetch(0, Duration::from_millis(100)).await.unwrap();

    assert_eq!(1, batch.len());
}

#[tokio::test(start_paused = true)]
async fn fetch_timeout_is_an_empty_batch() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();

    let batch = subscription.fetch(5, Duration::from_secs(2)).await.unwrap();

    assert!(batch.is_empty());
    assert_eq!(SubscriptionState::Active, subscription.state());
}

#[tokio::test(start_paused = true)]
async fn fetch_with_zero_timeout_waits_thirty_seconds() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();
    let started = tokio::time::Instant::now();

    let batch = subscription.fetch(1, Duration::ZERO).await.unwrap();

    assert!(batch.is_empty());
    assert_eq!(Duration::from_secs(30), started.elapsed());
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_waits_for_late_messages() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();

    let env = test.env.clone();
    let subject = test.subject("created");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        env.publish_to_stream(&subject, "late").await.unwrap();
    });
    let batch = subscription.fetch(1, Duration::from_secs(5)).await.unwrap();

    assert_eq!(b"late".as_ref(), batch[0].payload().as_ref());
}

#[tokio::test(flavor = "multi_thread")]
async fn nak_redelivers_with_increased_count() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();
    test.publish("created", 1).await;

    let first = subscription.fetch(1, Duration::from_millis(200)).await.unwrap();
    first[0].nak().await.unwrap();
    let second = subscription.fetch(1, Duration::from_millis(200)).await.unwrap();
    second[0].ack().await.unwrap();
    let third = subscription.fetch(1, Duration::from_millis(100)).await.unwrap();

    assert_eq!(1, first[0].info().unwrap().delivered);
    assert_eq!(2, second[0].info().unwrap().delivered);
    assert_eq!(first[0].payload(), second[0].payload());
    assert!(third.is_empty());
    let info = subscription.info().await.unwrap();
    assert_eq!(0, info.num_ack_pending);
    assert_eq!(1, info.num_redelivered);
}

#[tokio::test(start_paused = true)]
async fn redelivery_follows_backoff_schedule() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let config = ConsumerConfig {
        filter_subject: test.subject("created"),
        ack_wait_seconds: 30,
        back_off: vec![1, 5],
        ..ConsumerConfig::durable(durable.clone())
    };
    test.env
        .consumers()
        .create_consumer(&test.stream, &config)
        .await
        .unwrap();
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &durable)
        .await
        .unwrap();
    test.publish("created", 1).await;

    let first = subscription.fetch(1, Duration::from_secs(1)).await.unwrap();
    let started = tokio::time::Instant::now();
    let second = subscription.fetch(1, Duration::from_secs(3)).await.unwrap();
    let redelivered_after = started.elapsed();
    let too_early = subscription.fetch(1, Duration::from_secs(2)).await.unwrap();
    let third = subscription.fetch(1, Duration::from_secs(5)).await.unwrap();

    assert_eq!(1, first.len());
    assert_eq!(Duration::from_secs(1), redelivered_after);
    assert_eq!(2, second[0].info().unwrap().delivered);
    assert!(too_early.is_empty());
    assert_eq!(3, third[0].info().unwrap().delivered);
}

#[tokio::test(start_paused = true)]
async fn max_deliver_stops_redelivery() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let config = ConsumerConfig {
        filter_subject: test.subject("created"),
        max_deliver: 2,
        back_off: vec![1],
        ..ConsumerConfig::durable(durable.clone())
    };
    test.env
        .consumers()
        .create_consumer(&test.stream, &config)
        .await
        .unwrap();
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &durable)
        .await
        .unwrap();
    test.publish("created", 1).await;

    let first = subscription.fetch(1, Duration::from_secs(1)).await.unwrap();
    let second = subscription.fetch(1, Duration::from_secs(2)).await.unwrap();
    let third = subscription.fetch(1, Duration::from_secs(5)).await.unwrap();

    assert_eq!(1, first.len());
    assert_eq!(1, second.len());
    assert!(third.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_pull_subscription_rejects_fetch() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();

    subscription.close();
    let error = subscription.fetch(1, Duration::from_millis(10)).await.unwrap_err();

    assert_eq!(SubscriptionState::Closed, subscription.state());
    assert_eq!(ErrorCode::SubscriptionInactive, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_connection_errors_the_pull_subscription() {
    let test = TestEnvironment::create().await;
    let subscription = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &test.durable())
        .await
        .unwrap();

    test.transport.disconnect();
    let error = subscription.fetch(1, Duration::from_millis(50)).await.unwrap_err();
    test.transport.reconnect();
    let after = subscription.fetch(1, Duration::from_millis(50)).await.unwrap_err();

    assert_eq!(ErrorCode::FetchFailed, error.code());
    assert_eq!(ErrorKind::Fetch, error.kind());
    assert_eq!(SubscriptionState::Errored, subscription.state());
    assert_eq!(ErrorCode::SubscriptionInactive, after.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_on_push_consumer_fails() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let push = test
        .env
        .create_push_subscription(&test.stream, &test.subject("created"), &durable, ignore)
        .await
        .unwrap();

    let error = test
        .env
        .create_pull_subscription(&test.stream, &test.subject("created"), &durable)
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::PullSubscribeFailed, error.code());
    push.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn push_subscription_dispatches_in_order() {
    let test = TestEnvironment::create().await;
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    let subscription = test
        .env
        .create_push_subscription(
            &test.stream,
            &test.subject("created"),
            &test.durable(),
            move |delivery: Delivery| {
                let sink = sink.clone();
                async move {
                    delivery.ack().await?;
                    let payload = String::from_utf8_lossy(delivery.payload()).into_owned();
                    sink.lock().unwrap().push(payload);
                    Ok::<(), Error>(())
                }
            },
        )
        .await
        .unwrap();
    test.publish("created", 5).await;

    eventually(|| received.lock().unwrap().len() == 5).await;

    let expected: Vec<String> = (0..5).map(|i| format!("message {i}")).collect();
    assert_eq!(expected, *received.lock().unwrap());
    assert_eq!(SubscriptionState::Active, subscription.state());
    eventually(|| subscription.stats().dispatched == 5).await;
    let info = test
        .env
        .consumers()
        .consumer_info(&test.stream, subscription.consumer())
        .await
        .unwrap();
    assert_eq!(0, info.num_ack_pending);

    subscription.close().await;
    assert_eq!(SubscriptionState::Closed, subscription.state());
}

#[tokio::test(flavor = "multi_thread")]
async fn ephemeral_push_consumer_is_removed_on_close() {
    let test = TestEnvironment::create().await;

    let subscription = test
        .env
        .create_push_subscription(&test.stream, &test.subject("created"), "", ignore)
        .await
        .unwrap();
    let names = test.env.consumers().consumer_names(&test.stream).await.unwrap();
    assert!(subscription.is_ephemeral());
    assert_eq!(vec![subscription.consumer().to_owned()], names);

    subscription.close().await;
    subscription.close().await;

    let names = test.env.consumers().consumer_names(&test.stream).await.unwrap();
    assert!(names.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_push_consumer_is_rebound() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let first = test
        .env
        .create_push_subscription(&test.stream, &test.subject("created"), &durable, ignore)
        .await
        .unwrap();
    first.close().await;

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let second = test
        .env
        .create_push_subscription(
            &test.stream,
            &test.subject("created"),
            &durable,
            move |delivery: Delivery| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    delivery.ack().await
                }
            },
        )
        .await
        .unwrap();
    test.publish("created", 2).await;

    eventually(|| count.load(Ordering::SeqCst) == 2).await;
    assert_eq!(first.deliver_subject(), second.deliver_subject());
    assert!(!second.is_ephemeral());
    second.close().await;
    let names = test.env.consumers().consumer_names(&test.stream).await.unwrap();
    assert_eq!(vec![durable], names);
}

#[tokio::test(flavor = "multi_thread")]
async fn push_on_pull_consumer_fails() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    test.env
        .create_pull_subscription(&test.stream, &test.subject("created"), &durable)
        .await
        .unwrap();

    let error = test
        .env
        .create_push_subscription(&test.stream, &test.subject("created"), &durable, ignore)
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::PushSubscribeFailed, error.code());
}

/// Holds every delivery until a permit is released.
struct GatedHandler(Arc<Semaphore>);

#[async_trait::async_trait]
impl MessageHandler for GatedHandler {
    async fn handle_message(&self, _delivery: Delivery) -> JetStreamResult<()> {
        let _permit = self.0.acquire().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn close_drops_queued_messages() {
    let test = TestEnvironment::create().await;
    let gate = Arc::new(Semaphore::new(0));
    let subscription = test
        .env
        .create_push_subscription(
            &test.stream,
            &test.subject("created"),
            &test.durable(),
            GatedHandler(gate),
        )
        .await
        .unwrap();
    test.publish("created", 5).await;
    eventually(|| subscription.stats().received == 5).await;

    subscription.close().await;

    let stats = subscription.stats();
    assert_eq!(0, stats.dispatched);
    assert_eq!(5, stats.dropped);
    assert_eq!(SubscriptionState::Closed, subscription.state());
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_dispatches_queued_messages() {
    let test = TestEnvironment::create().await;
    let gate = Arc::new(Semaphore::new(0));
    let subscription = Arc::new(
        test.env
            .create_push_subscription(
                &test.stream,
                &test.subject("created"),
                &test.durable(),
                GatedHandler(gate.clone()),
            )
            .await
            .unwrap(),
    );
    test.publish("created", 5).await;
    eventually(|| subscription.stats().received == 5).await;

    let draining = subscription.clone();
    let drained = tokio::spawn(async move { draining.drain().await });
    gate.add_permits(5);
    drained.await.unwrap();

    let stats = subscription.stats();
    assert_eq!(5, stats.dispatched);
    assert_eq!(0, stats.dropped);
    assert_eq!(SubscriptionState::Closed, subscription.state());
}
