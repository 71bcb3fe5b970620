use std::time::Duration;

use nats_jetstream_client::{
    error::ErrorKind,
    policy::{AckPolicy, DeliverPolicy},
    transport::JetStream,
    types::ConsumerDescriptor,
    ConsumerConfig, ConsumerPatch, ErrorCode,
};
use time::OffsetDateTime;

use super::common::TestEnvironment;

#[tokio::test(flavor = "multi_thread")]
async fn create_consumer_converts_config() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let config = ConsumerConfig {
        deliver_policy: "by_start_time".to_owned(),
        opt_start_time: 1_700_000_000,
        ack_policy: "all".to_owned(),
        ack_wait_seconds: 10,
        max_deliver: 4,
        back_off: vec![1, 2, 4],
        filter_subject: test.subject("created"),
        ..ConsumerConfig::durable(durable.clone())
    };

    let info = test
        .env
        .consumers()
        .create_consumer(&test.stream, &config)
        .await
        .unwrap();

    assert_eq!(durable, info.name);
    let start_time = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
    assert_eq!(
        DeliverPolicy::ByStartTime { start_time },
        info.config.deliver_policy
    );
    assert_eq!(AckPolicy::All, info.config.ack_policy);
    assert_eq!(Duration::from_secs(10), info.config.ack_wait);
    assert_eq!(4, info.config.max_deliver);
    assert_eq!(
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)],
        info.config.backoff
    );
    assert_eq!(test.subject("created"), info.config.filter_subject);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_consumer_config_never_reaches_the_broker() {
    let test = TestEnvironment::empty();
    let cases = [
        ("", ConsumerConfig::durable("C1"), ErrorCode::EmptyStreamName),
        (test.stream.as_str(), ConsumerConfig::default(), ErrorCode::EmptyConsumerName),
        (
            test.stream.as_str(),
            ConsumerConfig {
                ack_wait_seconds: -1,
                ..ConsumerConfig::durable("C1")
            },
            ErrorCode::InvalidConfig,
        ),
        (
            test.stream.as_str(),
            ConsumerConfig {
                back_off: vec![1, -2],
                ..ConsumerConfig::durable("C1")
            },
            ErrorCode::InvalidConfig,
        ),
        (
            test.stream.as_str(),
            ConsumerConfig {
                stream: "ELSEWHERE".to_owned(),
                ..ConsumerConfig::durable("C1")
            },
            ErrorCode::InvalidConfig,
        ),
    ];

    for (stream, config, code) in cases {
        let error = test
            .env
            .consumers()
            .create_consumer(stream, &config)
            .await
            .unwrap_err();
        assert_eq!(code, error.code());
        assert_eq!(ErrorKind::Validation, error.kind());
    }
    assert_eq!(0, test.transport.admin_calls());
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_on_missing_stream_is_not_found() {
    let test = TestEnvironment::empty();

    let error = test
        .env
        .consumers()
        .create_consumer(&test.stream, &ConsumerConfig::durable("C1"))
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::StreamNotFound, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_consumer_with_other_config_is_a_create_error() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    test.env
        .consumers()
        .create_consumer(&test.stream, &ConsumerConfig::durable(durable.clone()))
        .await
        .unwrap();

    let error = test
        .env
        .consumers()
        .create_consumer(
            &test.stream,
            &ConsumerConfig {
                max_deliver: 9,
                ..ConsumerConfig::durable(durable)
            },
        )
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::ConsumerCreateFailed, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_merges_only_mutable_fields() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let config = ConsumerConfig {
        ack_wait_seconds: 10,
        max_deliver: 3,
        back_off: vec![2],
        ..ConsumerConfig::durable(durable.clone())
    };
    test.env
        .consumers()
        .create_consumer(&test.stream, &config)
        .await
        .unwrap();

    let info = test
        .env
        .consumers()
        .update_consumer(
            &test.stream,
            ConsumerPatch::new(durable.clone()).filter_subject(test.subject("updated")),
        )
        .await
        .unwrap();

    assert_eq!(test.subject("updated"), info.config.filter_subject);
    assert_eq!(Duration::from_secs(10), info.config.ack_wait);
    assert_eq!(3, info.config.max_deliver);
    assert_eq!(vec![Duration::from_secs(2)], info.config.backoff);

    let info = test
        .env
        .consumers()
        .update_consumer(
            &test.stream,
            ConsumerConfig {
                max_deliver: 7,
                ..ConsumerConfig::durable(durable)
            },
        )
        .await
        .unwrap();

    assert_eq!(7, info.config.max_deliver);
    assert_eq!(Duration::from_secs(10), info.config.ack_wait);
    assert_eq!(test.subject("updated"), info.config.filter_subject);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_keeps_fields_the_config_cannot_express() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    let descriptor = ConsumerDescriptor {
        durable_name: Some(durable.clone()),
        description: Some("billing replay".to_owned()),
        max_ack_pending: 25,
        headers_only: true,
        ..Default::default()
    };
    test.transport
        .create_consumer(&test.stream, &descriptor, Default::default())
        .await
        .unwrap();

    let info = test
        .env
        .consumers()
        .update_consumer(&test.stream, ConsumerPatch::new(durable).max_deliver(5))
        .await
        .unwrap();

    assert_eq!(5, info.config.max_deliver);
    assert_eq!(Some("billing replay"), info.config.description.as_deref());
    assert_eq!(25, info.config.max_ack_pending);
    assert!(info.config.headers_only);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_sequence_is_left_for_the_server_to_check() {
    let test = TestEnvironment::create().await;
    let config = ConsumerConfig {
        deliver_policy: "by_start_sequence".to_owned(),
        ..ConsumerConfig::durable(test.durable())
    };

    let error = test
        .env
        .consumers()
        .create_consumer(&test.stream, &config)
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::ConsumerCreateFailed, error.code());
    assert_eq!(1025, error.code().value());
    assert_eq!(2, test.transport.admin_calls());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_of_missing_consumer_is_not_found() {
    let test = TestEnvironment::create().await;

    let error = test
        .env
        .consumers()
        .update_consumer(&test.stream, ConsumerPatch::new("ghost").max_deliver(2))
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::ConsumerNotFound, error.code());
    assert!(error.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_info_and_names() {
    let test = TestEnvironment::create().await;
    let first = test.durable();
    let second = format!("{first}_2");
    for durable in [&first, &second] {
        test.env
            .consumers()
            .create_consumer(&test.stream, &ConsumerConfig::durable(durable.clone()))
            .await
            .unwrap();
    }

    let mut names = test.env.consumers().consumer_names(&test.stream).await.unwrap();
    names.sort();
    assert_eq!(vec![first.clone(), second.clone()], names);

    test.env
        .consumers()
        .delete_consumer(&test.stream, &first)
        .await
        .unwrap();
    let error = test
        .env
        .consumers()
        .consumer_info(&test.stream, &first)
        .await
        .unwrap_err();
    assert_eq!(ErrorCode::ConsumerNotFound, error.code());

    let info = test
        .env
        .consumers()
        .consumer_info(&test.stream, &second)
        .await
        .unwrap();
    assert_eq!(second, info.name);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_the_stream_orphans_its_consumers() {
    let test = TestEnvironment::create().await;
    let durable = test.durable();
    test.env
        .consumers()
        .create_consumer(&test.stream, &ConsumerConfig::durable(durable.clone()))
        .await
        .unwrap();

    test.env.delete_stream(&test.stream).await.unwrap();
    let error = test
        .env
        .consumers()
        .consumer_info(&test.stream, &durable)
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::StreamNotFound, error.code());
}
