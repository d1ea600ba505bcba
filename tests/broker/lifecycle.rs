//! Host lifecycle: bootstrap once, shut down on signal.

use std::sync::Arc;

use broker_bus::memory::{MemoryLogBroker, Operation};
use broker_bus::{
    map_env, BrokerAdapters, BrokerConfig, BrokerRuntime, KafkaBroker, MessageBroker,
    PublishOptions,
};
use serde_json::json;
use tokio::sync::oneshot;

use crate::support::{eventually, kafka, registry, Received};

#[tokio::test]
async fn runs_until_signalled_then_releases_consumers() {
    let (broker, cluster) = kafka();
    let broker = Arc::new(broker);
    let runtime = Arc::new(BrokerRuntime::new(broker.clone()));
    let received = Received::default();

    runtime
        .broker()
        .subscribe("evaluation-results", received.handler())
        .unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let host = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            runtime
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    assert!(eventually(|| runtime.is_bootstrapped() && broker.live_consumers() == 1).await);

    runtime
        .broker()
        .publish("evaluation-results", &json!({"score": 1}), PublishOptions::new())
        .await
        .unwrap();
    assert!(eventually(|| received.len() == 1).await);

    stop_tx.send(()).unwrap();
    host.await.unwrap().unwrap();

    assert_eq!(broker.live_consumers(), 0);
    assert_eq!(cluster.connected_consumers(), 0);
    assert_eq!(cluster.connected_producers(), 0);
}

#[tokio::test]
async fn failed_bootstrap_still_shuts_down() {
    let (broker, cluster) = kafka();
    cluster
        .faults()
        .fail_on(Operation::ConsumerConnect, 1, "Connection refused");
    broker
        .subscribe("evaluation-results", Received::default().handler())
        .unwrap();
    broker
        .publish("evaluation-jobs", &json!({"n": 1}), PublishOptions::new())
        .await
        .unwrap();

    let runtime = BrokerRuntime::new(Arc::new(broker));
    let err = runtime.run_until(std::future::pending()).await.unwrap_err();

    assert_eq!(err.to_string(), "Connection refused");
    assert_eq!(cluster.connected_producers(), 0);
}

#[tokio::test]
async fn from_config_wires_the_selected_adapter() {
    let cluster = MemoryLogBroker::new();
    let config = BrokerConfig::from_lookup(&map_env([("MESSAGE_BROKER", "kafka")]));
    let adapters = BrokerAdapters::new().with_kafka(Arc::new(KafkaBroker::new(
        Arc::new(cluster.clone()),
        registry(),
    )));

    let runtime = BrokerRuntime::from_config(&config, &adapters).unwrap();
    runtime
        .broker()
        .subscribe("experiment-results", Received::default().handler())
        .unwrap();
    runtime.bootstrap().await.unwrap();
    runtime.bootstrap().await.unwrap();

    assert_eq!(cluster.faults().calls(Operation::ConsumerConnect), 1);
    runtime.shutdown().await.unwrap();
    assert_eq!(cluster.connected_consumers(), 0);
}
