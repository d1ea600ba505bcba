//! End-to-end: a typed message published through one facade arrives,
//! decoded, at a typed handler, whichever broker is behind it.

use std::sync::Arc;

use broker_bus::{typed_handler, HandlerError, MessageBroker, PublishExt, PublishOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::support::{amqp, kafka, within};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EvaluationResult {
    run_id: String,
    score: f64,
    passed: bool,
}

fn sample() -> EvaluationResult {
    EvaluationResult {
        run_id: "run-42".to_string(),
        score: 0.875,
        passed: true,
    }
}

async fn round_trip(broker: Arc<dyn MessageBroker>) -> EvaluationResult {
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            "evaluation-results",
            typed_handler(move |result: EvaluationResult| {
                let tx = tx.clone();
                async move {
                    tx.send(result)?;
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .unwrap();
    broker.bootstrap().await.unwrap();

    broker
        .publish_json(
            "evaluation-results",
            &sample(),
            PublishOptions::new().with_message_id("run-42"),
        )
        .await
        .unwrap();

    within(rx.recv()).await.expect("channel closed")
}

#[tokio::test]
async fn amqp_round_trip() {
    let (broker, _cluster) = amqp();
    assert_eq!(round_trip(Arc::new(broker)).await, sample());
}

#[tokio::test]
async fn amqp_round_trip_with_client_side_json_decoding() {
    let (broker, cluster) = amqp();
    cluster.set_decode_json(true);
    assert_eq!(round_trip(Arc::new(broker)).await, sample());
}

#[tokio::test]
async fn kafka_round_trip() {
    let (broker, _cluster) = kafka();
    assert_eq!(round_trip(Arc::new(broker)).await, sample());
}
