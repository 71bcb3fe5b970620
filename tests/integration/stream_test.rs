use std::time::Duration;

use std::collections::HashMap;

use nats_jetstream_client::{
    error::ErrorKind,
    policy::{DiscardPolicy, RetentionPolicy, StorageType},
    transport::JetStream,
    types::{ByteCapacity, StreamDescriptor},
    ErrorCode, StreamConfig, StreamPatch,
};

use super::common::TestEnvironment;

#[tokio::test(flavor = "multi_thread")]
async fn create_stream_resolves_policies() {
    let test = TestEnvironment::empty();
    let config = StreamConfig {
        retention: "workqueue".to_owned(),
        storage: "memory".to_owned(),
        discard: "new".to_owned(),
        max_msgs: 100,
        ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
    };

    let info = test.env.streams().create_stream(&config).await.unwrap();

    assert_eq!(test.stream, info.config.name);
    assert_eq!(RetentionPolicy::WorkQueue, info.config.retention);
    assert_eq!(StorageType::Memory, info.config.storage);
    assert_eq!(DiscardPolicy::New, info.config.discard);
    assert_eq!(100, info.config.max_messages);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_symbols_fall_back_to_defaults() {
    let test = TestEnvironment::empty();
    let config = StreamConfig {
        retention: "WorkQueue".to_owned(),
        storage: "ssd".to_owned(),
        ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
    };

    let info = test.env.streams().create_stream(&config).await.unwrap();

    assert_eq!(RetentionPolicy::Limits, info.config.retention);
    assert_eq!(StorageType::File, info.config.storage);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_stream_config_never_reaches_the_broker() {
    let test = TestEnvironment::empty();
    let configs = [
        StreamConfig::new("", [test.subject(">")]),
        StreamConfig::new(test.stream.clone(), Vec::<String>::new()),
        StreamConfig {
            replicas: 7,
            ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
        },
        StreamConfig {
            max_bytes: -5,
            ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
        },
    ];

    for config in configs {
        let error = test.env.streams().create_stream(&config).await.unwrap_err();
        assert_eq!(ErrorKind::Validation, error.kind());
    }
    assert_eq!(0, test.transport.admin_calls());
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_stream_is_a_create_error() {
    let test = TestEnvironment::create().await;
    let conflicting = StreamConfig {
        max_msgs: 10,
        ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
    };

    let error = test
        .env
        .streams()
        .create_stream(&conflicting)
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::StreamCreateFailed, error.code());
    assert_eq!(ErrorKind::ConflictOrCreate, error.kind());
    assert!(error.transport_error().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_merges_only_present_fields() {
    let test = TestEnvironment::empty();
    let config = StreamConfig {
        max_msgs: 100,
        max_bytes: 4096,
        max_age_seconds: 60,
        ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
    };
    test.env.streams().create_stream(&config).await.unwrap();

    let info = test
        .env
        .streams()
        .update_stream(StreamPatch::new(test.stream.clone()).max_msgs(500))
        .await
        .unwrap();

    assert_eq!(500, info.config.max_messages);
    assert_eq!(4096, info.config.max_bytes);
    assert_eq!(Duration::from_secs(60), info.config.max_age);
    assert_eq!(vec![test.subject(">")], info.config.subjects);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_from_config_ignores_zero_fields() {
    let test = TestEnvironment::empty();
    let config = StreamConfig {
        max_msgs: 100,
        max_bytes: 4096,
        ..StreamConfig::new(test.stream.clone(), [test.subject(">")])
    };
    test.env.streams().create_stream(&config).await.unwrap();

    let update = StreamConfig {
        max_bytes: 8192,
        ..StreamConfig::new(test.stream.clone(), Vec::<String>::new())
    };
    let info = test.env.streams().update_stream(update).await.unwrap();

    assert_eq!(100, info.config.max_messages);
    assert_eq!(8192, info.config.max_bytes);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_keeps_fields_the_config_cannot_express() {
    let test = TestEnvironment::empty();
    let descriptor = StreamDescriptor {
        name: test.stream.clone(),
        subjects: vec![test.subject(">")],
        max_messages_per_subject: 5,
        description: Some("orders per region".to_owned()),
        deny_delete: true,
        metadata: HashMap::from([("team".to_owned(), "billing".to_owned())]),
        ..Default::default()
    };
    test.transport.create_stream(&descriptor).await.unwrap();

    let info = test
        .env
        .streams()
        .update_stream(StreamPatch::new(test.stream.clone()).max_msgs(500))
        .await
        .unwrap();

    assert_eq!(500, info.config.max_messages);
    assert_eq!(5, info.config.max_messages_per_subject);
    assert_eq!(Some("orders per region"), info.config.description.as_deref());
    assert!(info.config.deny_delete);
    assert_eq!(Some("billing"), info.config.metadata.get("team").map(String::as_str));
}

#[tokio::test(flavor = "multi_thread")]
async fn update_is_idempotent() {
    let test = TestEnvironment::create().await;
    let patch = StreamPatch::new(test.stream.clone())
        .max_bytes(1_000_000)
        .discard(DiscardPolicy::New);

    let first = test.env.streams().update_stream(patch.clone()).await.unwrap();
    let second = test.env.streams().update_stream(patch).await.unwrap();

    assert_eq!(first.config, second.config);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_with_empty_name_is_rejected_locally() {
    let test = TestEnvironment::empty();

    let error = test
        .env
        .streams()
        .update_stream(StreamPatch::new("").max_msgs(5))
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::EmptyStreamName, error.code());
    assert_eq!(0, test.transport.admin_calls());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_of_missing_stream_is_not_found() {
    let test = TestEnvironment::empty();

    let error = test
        .env
        .streams()
        .update_stream(StreamPatch::new(test.stream.clone()).max_msgs(5))
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::StreamNotFound, error.code());
    assert!(error.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_then_info_is_not_found() {
    let test = TestEnvironment::create().await;

    test.env.delete_stream(&test.stream).await.unwrap();
    let error = test.env.streams().stream_info(&test.stream).await.unwrap_err();

    assert_eq!(ErrorCode::StreamNotFound, error.code());
    let error = test.env.delete_stream(&test.stream).await.unwrap_err();
    assert_eq!(ErrorCode::StreamNotFound, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_reports_removed_messages() {
    let test = TestEnvironment::create().await;
    test.publish("created", 3).await;

    let purged = test.env.streams().purge_stream(&test.stream).await.unwrap();
    let info = test.env.streams().stream_info(&test.stream).await.unwrap();

    assert_eq!(3, purged);
    assert_eq!(0, info.state.messages);
    assert_eq!(3, info.state.last_seq);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_message_removes_one_message() {
    let test = TestEnvironment::create().await;
    test.publish("created", 2).await;

    test.env
        .streams()
        .delete_message(&test.stream, 1)
        .await
        .unwrap();
    let info = test.env.streams().stream_info(&test.stream).await.unwrap();
    let error = test
        .env
        .streams()
        .delete_message(&test.stream, 1)
        .await
        .unwrap_err();

    assert_eq!(1, info.state.messages);
    assert_eq!(2, info.state.first_seq);
    assert_eq!(ErrorCode::MessageDeleteFailed, error.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn names_and_subject_lookup() {
    let test = TestEnvironment::create().await;
    let other = StreamConfig::new("OTHER", ["other.>"]);
    test.env.streams().create_stream(&other).await.unwrap();

    let mut names = test.env.streams().stream_names().await.unwrap();
    names.sort();
    let found = test
        .env
        .streams()
        .find_stream_by_subject(&test.subject("created"))
        .await
        .unwrap();
    let missing = test
        .env
        .streams()
        .find_stream_by_subject("nobody.listens")
        .await
        .unwrap_err();

    let mut expected = vec!["OTHER".to_owned(), test.stream.clone()];
    expected.sort();
    assert_eq!(expected, names);
    assert_eq!(test.stream, found);
    assert_eq!(ErrorCode::StreamNotFound, missing.code());
}

#[tokio::test(flavor = "multi_thread")]
async fn account_info_counts_streams() {
    let test = TestEnvironment::create().await;
    test.publish("created", 2).await;

    let info = test.env.streams().account_info().await.unwrap();

    assert_eq!(1, info.streams);
    assert!(info.storage > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_creator_builds_config() {
    let test = TestEnvironment::empty();

    let info = test
        .env
        .stream_creator()
        .subjects([test.subject(">")])
        .storage(StorageType::Memory)
        .max_bytes(ByteCapacity::KB(64))
        .max_messages(1_000)
        .max_age(Duration::from_secs(3600))
        .create(&test.stream)
        .await
        .unwrap();

    assert_eq!(StorageType::Memory, info.config.storage);
    assert_eq!(64_000, info.config.max_bytes);
    assert_eq!(1_000, info.config.max_messages);
    assert_eq!(Duration::from_secs(3600), info.config.max_age);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_transport_is_connection_closed() {
    let test = TestEnvironment::empty();
    test.transport.disconnect();

    let error = test
        .env
        .streams()
        .create_stream(&StreamConfig::new(test.stream.clone(), [test.subject(">")]))
        .await
        .unwrap_err();

    assert_eq!(ErrorCode::ConnectionClosed, error.code());
    assert_eq!(ErrorKind::ConnectionClosed, error.kind());
}
