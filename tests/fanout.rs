//! End-to-end fanout tests over the in-process broker.
//!
//! Run with: cargo test --test fanout
//!
//! Several replica hosts share one `InMemoryBroker`, the way several
//! processes share one RabbitMQ.

mod common;

use std::sync::Arc;

use common::{three_replica_config, Recorder};
use holiday_bus::bus::{init_connection, ConnectionManager, InMemoryBroker};
use holiday_bus::config::{BrokerBackend, BrokerConfig, Config, ConfigError, ReplicaConfig};
use holiday_bus::consumer::{ConsumerDomain, ConsumerState};
use holiday_bus::replica::ReplicaHost;

struct Replica {
    host: ReplicaHost,
    holidays: Recorder,
    colabs: Recorder,
}

async fn start_replica(
    broker: &InMemoryBroker,
    config: &Config,
    name: &str,
    holidays: Recorder,
) -> Replica {
    let args = [format!("--replicaName={}", name)];
    let replica = ReplicaConfig::resolve(&args, config).expect("replica should resolve");
    let connection = Arc::new(ConnectionManager::from_broker(Arc::new(broker.clone())));
    let colabs = Recorder::new();

    let host = ReplicaHost::builder(replica, config.messaging.clone())
        .on_holiday_change(holidays.clone())
        .on_colaborator_id_change(colabs.clone())
        .start(connection)
        .await
        .expect("host should start");

    Replica {
        host,
        holidays,
        colabs,
    }
}

#[tokio::test]
async fn test_publish_reaches_both_queues_of_replica() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let replica = start_replica(&broker, &config, "Repl1", Recorder::new()).await;

    replica
        .host
        .publisher()
        .publish("colab:42 updated")
        .await
        .unwrap();

    assert_eq!(replica.holidays.wait_for(1).await, vec!["colab:42 updated"]);
    assert_eq!(replica.colabs.wait_for(1).await, vec!["colab:42 updated"]);

    // Each queue got exactly one copy and acked it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for queue in ["repl1-holiday", "repl1-colab"] {
        assert_eq!(broker.ready_count(queue), 0, "{} not drained", queue);
        assert_eq!(broker.unacked_count(queue), 0, "{} not acked", queue);
    }
    assert_eq!(replica.holidays.wait_for(1).await.len(), 1);
    assert_eq!(replica.colabs.wait_for(1).await.len(), 1);
}

#[tokio::test]
async fn test_every_replica_receives_every_change() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let mut replicas = Vec::new();
    for name in ["Repl1", "Repl2", "Repl3"] {
        replicas.push(start_replica(&broker, &config, name, Recorder::new()).await);
    }

    replicas[1]
        .host
        .notifier()
        .notify_change("holiday:7 created".into())
        .await
        .unwrap();

    for replica in &replicas {
        assert_eq!(replica.holidays.wait_for(1).await, vec!["holiday:7 created"]);
        assert_eq!(replica.colabs.wait_for(1).await, vec!["holiday:7 created"]);
    }
    assert_eq!(broker.bound_queues("logs").len(), 6);
}

#[tokio::test]
async fn test_queue_order_is_preserved() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let replica = start_replica(&broker, &config, "Repl1", Recorder::new()).await;
    let publisher = replica.host.publisher();

    let sent: Vec<String> = (1..=5).map(|i| format!("holiday:{} updated", i)).collect();
    for payload in &sent {
        publisher.publish(payload.clone()).await.unwrap();
    }

    assert_eq!(replica.holidays.wait_for(5).await, sent);
    assert_eq!(replica.colabs.wait_for(5).await, sent);
}

#[tokio::test]
async fn test_failing_handler_is_isolated() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let replica = start_replica(&broker, &config, "Repl1", Recorder::failing_on("bad")).await;
    let publisher = replica.host.publisher();

    publisher.publish("bad").await.unwrap();
    publisher.publish("good").await.unwrap();

    // The failing queue moves on; the other queue is unaffected.
    assert_eq!(replica.holidays.wait_for(1).await, vec!["good"]);
    assert_eq!(replica.colabs.wait_for(2).await, vec!["bad", "good"]);

    let dead = broker.queued_payloads("repl1-holiday.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].as_str(), Some("bad"));
    assert_eq!(broker.ready_count("repl1-colab.dlq"), 0);
}

#[tokio::test]
async fn test_consumers_resubscribe_after_disconnect() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let replica = start_replica(&broker, &config, "Repl1", Recorder::new()).await;
    let publisher = replica.host.publisher();

    publisher.publish("before").await.unwrap();
    assert_eq!(replica.holidays.wait_for(1).await, vec!["before"]);

    broker.disconnect();
    publisher.publish("after").await.unwrap();

    assert_eq!(replica.holidays.wait_for(2).await, vec!["before", "after"]);
    assert_eq!(replica.colabs.wait_for(2).await, vec!["before", "after"]);

    let controller = replica.host.controller(ConsumerDomain::Holiday).unwrap();
    assert_eq!(controller.state().await, ConsumerState::Consuming);
}

#[tokio::test]
async fn test_argument_selects_replica_over_configured_default() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();
    let replica = start_replica(&broker, &config, "Repl2", Recorder::new()).await;

    assert_eq!(replica.host.replica().replica_name, "Repl2");
    assert_eq!(replica.host.replica().port, 5012);
    assert_eq!(
        broker.bound_queues("logs"),
        vec!["repl2-holiday", "repl2-colab"]
    );
}

#[tokio::test]
async fn test_unmapped_replica_fails_before_consumers_start() {
    let broker = InMemoryBroker::new();
    let config = three_replica_config();

    let result = ReplicaConfig::resolve(&["--replicaName=Repl9"], &config);

    assert!(matches!(result, Err(ConfigError::UnknownQueue(name)) if name == "Repl9"));
    assert!(broker.bound_queues("logs").is_empty());
}

#[tokio::test]
async fn test_memory_backend_from_configuration() {
    let mut config = three_replica_config();
    config.messaging.backend = BrokerBackend::Memory;

    let replica = ReplicaConfig::resolve(&[] as &[&str], &config).unwrap();
    assert_eq!(replica.replica_name, "Repl1");

    let connection = init_connection(&config.messaging, &BrokerConfig::default())
        .await
        .unwrap();
    let holidays = Recorder::new();
    let host = ReplicaHost::builder(replica, config.messaging.clone())
        .on_holiday_change(holidays.clone())
        .start(connection)
        .await
        .unwrap();

    host.publisher().publish("holiday:1 created").await.unwrap();
    assert_eq!(holidays.wait_for(1).await, vec!["holiday:1 created"]);
    host.shutdown().await.unwrap();
}
