//! Partitioned-log adapter: shared producer, consumer bootstrap, rollback,
//! crash isolation and shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use broker_bus::kafka::MESSAGE_ID_HEADER;
use broker_bus::memory::Operation;
use broker_bus::topics::{ConsumeEntry, TopicEntry};
use broker_bus::{
    BrokerError, KafkaBroker, LogicalTopic, MessageBroker, PublishExt, PublishOptions,
    ShutdownResource,
};
use serde_json::json;

use crate::support::{eventually, kafka, registry, settle, Flaky, Received};

const RESULTS_GROUP: &str = "backend-evaluation-results";

#[tokio::test]
async fn unknown_topic_fails_before_connecting() {
    let (broker, cluster) = kafka();

    let err = broker
        .publish("bogus-topic", &json!({"a": 1}), PublishOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::UnknownTopic(_)));
    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 0);
    assert!(!broker.has_producer());
}

#[tokio::test]
async fn subscribe_validates_routes_synchronously() {
    let (broker, _cluster) = kafka();

    let err = broker
        .subscribe("evaluation-jobs", Received::default().handler())
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoConsumeRoute(_)));

    let cluster = broker_bus::memory::MemoryLogBroker::new();
    let without_group = registry().with_entry(TopicEntry {
        topic: LogicalTopic::ExperimentResults,
        consume: Some(ConsumeEntry {
            queue: true,
            group: false,
        }),
    });
    let broker = KafkaBroker::new(Arc::new(cluster), without_group);
    let err = broker
        .subscribe("experiment-results", Received::default().handler())
        .unwrap_err();
    assert!(matches!(err, BrokerError::MissingGroupId(ref t) if t == "experiment-results"));
    assert_eq!(broker.pending_subscriptions(), 0);
}

#[tokio::test]
async fn concurrent_first_publishes_share_one_producer() {
    let (broker, cluster) = kafka();

    let publishes = (0..10).map(|n| {
        let broker = &broker;
        async move {
            broker
                .publish("evaluation-jobs", &json!({"n": n}), PublishOptions::new())
                .await
        }
    });
    for result in futures::future::join_all(publishes).await {
        result.unwrap();
    }

    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 1);
    assert_eq!(cluster.connected_producers(), 1);
    assert_eq!(cluster.records("evaluation-jobs").len(), 10);
}

#[tokio::test]
async fn message_id_becomes_key_and_header() {
    let (broker, cluster) = kafka();

    broker
        .publish(
            "evaluation-jobs",
            &json!({"job": 1}),
            PublishOptions::new().with_message_id("job-1"),
        )
        .await
        .unwrap();
    broker
        .publish(
            "evaluation-jobs",
            &json!({"job": 2}),
            PublishOptions::new().with_message_id("job-2").with_key("run-7"),
        )
        .await
        .unwrap();
    broker
        .publish("evaluation-jobs", &json!({"job": 3}), PublishOptions::new())
        .await
        .unwrap();

    let records = cluster.records("evaluation-jobs");
    assert_eq!(records[0].key.as_deref(), Some("job-1"));
    assert_eq!(
        records[0].headers,
        vec![(MESSAGE_ID_HEADER.to_string(), "job-1".to_string())]
    );
    assert_eq!(records[1].key.as_deref(), Some("run-7"));
    assert_eq!(records[2].key, None);
    assert!(records[2].headers.is_empty());
    assert_eq!(records[2].value.as_deref(), Some(br#"{"job":3}"#.as_slice()));
}

#[tokio::test]
async fn unserializable_message_never_reaches_the_producer() {
    let (broker, cluster) = kafka();
    let mut bad: HashMap<(i32, i32), i32> = HashMap::new();
    bad.insert((1, 2), 3);

    let err = broker
        .publish_json("evaluation-jobs", &bad, PublishOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Serialization(_)));
    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 0);
}

#[tokio::test]
async fn null_message_is_rejected() {
    let (broker, cluster) = kafka();

    let err = broker
        .publish("evaluation-jobs", &json!(null), PublishOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::EmptyMessage(_)));
    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 0);
}

#[tokio::test]
async fn failed_producer_connect_is_retried_on_next_publish() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::ProducerConnect, 1, "Connection refused");

    let err = broker
        .publish("evaluation-jobs", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Connection(_)));
    assert_eq!(err.to_string(), "Connection refused");
    assert!(!broker.has_producer());

    broker
        .publish("evaluation-jobs", &json!({"n": 2}), PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 2);
    assert_eq!(cluster.records("evaluation-jobs").len(), 1);
}

#[tokio::test]
async fn concurrent_publishes_share_one_failed_connect() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_always(Operation::ProducerConnect, "Connection refused");

    let publishes = (0..5).map(|n| {
        let broker = &broker;
        async move {
            broker
                .publish("evaluation-jobs", &json!({"n": n}), PublishOptions::new())
                .await
        }
    });
    let results = futures::future::join_all(publishes).await;

    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 1);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert_eq!(err.to_string(), "Connection refused");
    }
    assert!(!broker.has_producer());

    cluster.faults().clear(Operation::ProducerConnect);
    broker
        .publish("evaluation-jobs", &json!({"n": 5}), PublishOptions::new())
        .await
        .unwrap();
    assert_eq!(cluster.faults().calls(Operation::ProducerConnect), 2);
    assert!(broker.has_producer());
}

#[tokio::test]
async fn bootstrap_starts_one_consumer_per_subscription() {
    let (broker, cluster) = kafka();
    let first = Received::default();
    let second = Received::default();

    broker
        .subscribe("evaluation-results", first.handler())
        .unwrap();
    broker
        .subscribe("evaluation-results", second.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();

    assert_eq!(broker.live_consumers(), 2);
    assert_eq!(cluster.connected_consumers(), 2);
    assert_eq!(broker.pending_subscriptions(), 0);
    assert_eq!(cluster.group_offset(RESULTS_GROUP, "evaluation-results"), Some(0));

    for n in 0..6 {
        broker
            .publish("evaluation-results", &json!({"n": n}), PublishOptions::new())
            .await
            .unwrap();
    }

    assert!(eventually(|| first.len() + second.len() == 6).await);
    settle().await;
    assert_eq!(first.len() + second.len(), 6);
    assert_eq!(cluster.group_offset(RESULTS_GROUP, "evaluation-results"), Some(6));
}

#[tokio::test]
async fn new_consumers_start_at_the_log_end() {
    let (broker, cluster) = kafka();
    let received = Received::default();
    cluster.append("evaluation-results", Some(br#"{"old":true}"#.to_vec()));

    broker
        .subscribe("evaluation-results", received.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();
    broker
        .publish("evaluation-results", &json!({"new": true}), PublishOptions::new())
        .await
        .unwrap();

    assert!(eventually(|| received.len() == 1).await);
    settle().await;
    assert_eq!(received.payloads(), vec![json!({"new": true})]);
}

#[tokio::test]
async fn failed_subscribe_rolls_back_every_started_consumer() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::Subscribe, 2, "Topic does not exist");

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker
        .subscribe("experiment-results", Received::default().handler())
        .unwrap();

    let err = broker.bootstrap().await.unwrap_err();

    assert!(matches!(err, BrokerError::Transport(_)));
    assert_eq!(err.to_string(), "Topic does not exist");
    assert_eq!(broker.live_consumers(), 0);
    assert_eq!(cluster.connected_consumers(), 0);
}

#[tokio::test]
async fn failed_connect_rolls_back_every_started_consumer() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::ConsumerConnect, 2, "Connection refused");

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker
        .subscribe("experiment-results", Received::default().handler())
        .unwrap();

    let err = broker.bootstrap().await.unwrap_err();

    assert!(matches!(err, BrokerError::Connection(_)));
    assert_eq!(broker.live_consumers(), 0);
    assert_eq!(cluster.connected_consumers(), 0);
}

#[tokio::test]
async fn rollback_keeps_going_when_a_disconnect_fails() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::Subscribe, 3, "Topic does not exist");
    // Disconnect #1 is the consumer whose subscribe failed; #2 is the first
    // consumer rolled back.
    cluster
        .faults()
        .fail_on(Operation::ConsumerDisconnect, 2, "socket hang up");

    for topic in ["evaluation-results", "experiment-results", "evaluation-results"] {
        broker
            .subscribe(topic, Received::default().handler())
            .unwrap();
    }

    let err = broker.bootstrap().await.unwrap_err();

    assert_eq!(err.to_string(), "Topic does not exist");
    assert_eq!(broker.live_consumers(), 0);
    assert_eq!(cluster.faults().calls(Operation::ConsumerDisconnect), 3);
    assert_eq!(cluster.connected_consumers(), 1);
}

#[tokio::test]
async fn subscribe_after_bootstrap_only_queues() {
    let (broker, cluster) = kafka();

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker.bootstrap().await.unwrap();
    assert_eq!(broker.pending_subscriptions(), 0);

    broker
        .subscribe("experiment-results", Received::default().handler())
        .unwrap();

    assert_eq!(broker.pending_subscriptions(), 1);
    assert_eq!(broker.live_consumers(), 1);
    assert_eq!(cluster.faults().calls(Operation::ConsumerConnect), 1);
}

#[tokio::test]
async fn crashed_consumer_loop_is_logged_not_propagated() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::Run, 1, "consumer crashed: group rebalance");

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker.bootstrap().await.unwrap();

    assert!(eventually(|| broker.crashes().len() == 1).await);
    let crash = &broker.crashes()[0];
    assert_eq!(crash.topic, "evaluation-results");
    assert_eq!(crash.group_id, RESULTS_GROUP);
    assert_eq!(crash.error, "consumer crashed: group rebalance");
    assert_eq!(broker.crash_count(), 1);
    assert_eq!(broker.live_consumers(), 1);
}

#[tokio::test]
async fn handler_failing_past_retries_crashes_only_its_loop() {
    let (broker, cluster) = kafka();
    cluster.set_max_retries(1);
    let failing = Flaky::new(usize::MAX);
    let healthy = Received::default();

    broker
        .subscribe("evaluation-results", failing.handler())
        .unwrap();
    broker
        .subscribe("experiment-results", healthy.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();

    broker
        .publish("evaluation-results", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap();
    assert!(eventually(|| broker.crashes().len() == 1).await);
    assert_eq!(failing.calls(), 2);
    assert_eq!(cluster.failed_records().len(), 1);

    broker
        .publish("experiment-results", &json!({"n": 2}), PublishOptions::new())
        .await
        .unwrap();
    assert!(eventually(|| healthy.len() == 1).await);
    assert_eq!(broker.live_consumers(), 2);
}

#[tokio::test]
async fn handler_error_is_retried() {
    let (broker, cluster) = kafka();
    let flaky = Flaky::new(2);

    broker
        .subscribe("experiment-results", flaky.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();
    broker
        .publish("experiment-results", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap();

    assert!(eventually(|| flaky.calls() == 3).await);
    settle().await;
    assert!(broker.crashes().is_empty());
    assert!(cluster.failed_records().is_empty());
}

#[tokio::test]
async fn empty_records_are_skipped() {
    let (broker, cluster) = kafka();
    let received = Received::default();

    broker
        .subscribe("evaluation-results", received.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();

    cluster.append("evaluation-results", None);
    cluster.append("evaluation-results", Some(Vec::new()));
    cluster.append("evaluation-results", Some(br#"{"after":"empty"}"#.to_vec()));

    assert!(eventually(|| received.len() == 1).await);
    assert_eq!(received.payloads(), vec![json!({"after": "empty"})]);
    assert!(broker.crashes().is_empty());
}

#[tokio::test]
async fn invalid_json_is_never_handed_to_the_handler() {
    let (broker, cluster) = kafka();
    cluster.set_max_retries(0);
    let received = Received::default();

    broker
        .subscribe("evaluation-results", received.handler())
        .unwrap();
    broker.bootstrap().await.unwrap();

    cluster.append("evaluation-results", Some(b"{oops".to_vec()));

    assert!(eventually(|| broker.crashes().len() == 1).await);
    assert!(broker.crashes()[0].error.contains("failed to parse message"));
    assert_eq!(received.len(), 0);
}

#[tokio::test]
async fn shutdown_releases_everything_once() {
    let (broker, cluster) = kafka();

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker.bootstrap().await.unwrap();
    broker
        .publish("evaluation-jobs", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap();
    settle().await;

    broker.shutdown().await.unwrap();

    assert!(!broker.has_producer());
    assert_eq!(broker.live_consumers(), 0);
    assert_eq!(cluster.connected_producers(), 0);
    assert_eq!(cluster.connected_consumers(), 0);

    broker.shutdown().await.unwrap();
    assert_eq!(cluster.faults().calls(Operation::ProducerDisconnect), 1);
    assert_eq!(cluster.faults().calls(Operation::ConsumerDisconnect), 1);
}

#[tokio::test]
async fn shutdown_without_resources_is_a_no_op() {
    let (broker, cluster) = kafka();

    broker.shutdown().await.unwrap();

    assert_eq!(cluster.faults().calls(Operation::ProducerDisconnect), 0);
    assert_eq!(cluster.faults().calls(Operation::ConsumerDisconnect), 0);
}

#[tokio::test]
async fn shutdown_aggregates_every_failure() {
    let (broker, cluster) = kafka();

    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker
        .subscribe("experiment-results", Received::default().handler())
        .unwrap();
    broker.bootstrap().await.unwrap();
    broker
        .publish("evaluation-jobs", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap();
    settle().await;

    cluster
        .faults()
        .fail_on(Operation::ProducerDisconnect, 1, "producer busy");
    cluster
        .faults()
        .fail_on(Operation::ConsumerDisconnect, 1, "socket hang up");

    let err = broker.shutdown().await.unwrap_err();
    let BrokerError::Shutdown(shutdown) = err else {
        panic!("expected a shutdown error");
    };
    assert_eq!(shutdown.len(), 2);
    assert_eq!(shutdown.failures[0].resource, ShutdownResource::Producer);
    assert_eq!(shutdown.failures[0].error.message(), "producer busy");
    assert_eq!(
        shutdown.failures[1].resource,
        ShutdownResource::Consumer {
            topic: "evaluation-results".to_string(),
            group_id: RESULTS_GROUP.to_string(),
        }
    );

    // The second consumer was still disconnected.
    assert_eq!(cluster.faults().calls(Operation::ConsumerDisconnect), 2);
    assert_eq!(broker.live_consumers(), 1);
    assert!(broker.has_producer());

    // Whatever failed is retried by the next shutdown.
    broker.shutdown().await.unwrap();
    assert_eq!(broker.live_consumers(), 0);
    assert!(!broker.has_producer());
    assert_eq!(cluster.connected_consumers(), 0);
    assert_eq!(cluster.connected_producers(), 0);
}
