//! Limited protocol tests against the in-memory server.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use tnt_queue::{
    InMemoryServer, LeaseObserver, Protocol, PutOptions, QueueClient, QueueClientConfig,
    QueueError, TaskId, TaskStatus, TubeOptions, Verb,
};

fn limited_client(server: &InMemoryServer) -> QueueClient {
    init_tracing();
    let config = QueueClientConfig {
        protocol: Protocol::Limited,
        ..QueueClientConfig::new("localhost", 33013, 0)
    };
    QueueClient::new(config, Arc::new(server.clone())).expect("test configuration is valid")
}

/// Verify put, take and ack work end to end with numeric ids.
#[test]
fn test_produce_and_consume() {
    let server = InMemoryServer::new();
    let client = limited_client(&server);
    let tube = client.tube("uploads", TubeOptions::new());

    let put = tube.put(&json!({"file": "a.png"}), &PutOptions::new()).unwrap();
    assert!(put.id().as_str().parse::<i64>().is_ok());

    let mut task = take_ready(&tube);
    assert_eq!(task.id(), put.id());
    assert_eq!(task.tube(), "uploads");
    assert_eq!(task.data().unwrap(), Some(&json!({"file": "a.png"})));
    assert!(task.ack().unwrap());
    assert_eq!(server.task_status(put.id()), None);
}

/// Verify a tube at its capacity refuses another put.
#[test]
fn test_limits_bound_the_tube() {
    let server = InMemoryServer::new();
    let client = limited_client(&server);
    let tube = client.tube("bounded", TubeOptions::new().limits(2));

    tube.put(&json!(1), &PutOptions::new()).unwrap();
    tube.put(&json!(2), &PutOptions::new()).unwrap();
    let err = tube.put(&json!(3), &PutOptions::new()).unwrap_err();

    assert!(matches!(err, QueueError::EmptyResult { verb: Verb::Put }));
    assert_eq!(server.task_count(), 2);
}

/// Verify a task released more often than its retry bound is buried.
#[test]
fn test_retry_bound_buries_task() {
    let server = InMemoryServer::new();
    let client = limited_client(&server);
    let tube = client.tube("flaky", TubeOptions::new().retry(1));
    let id = tube.put(&json!("job"), &PutOptions::new()).unwrap().id().clone();

    for _ in 0..2 {
        let mut task = take_ready(&tube);
        task.release(Default::default()).unwrap();
    }

    assert!(tube.take(POLL).unwrap().is_none());
    assert_eq!(server.task_status(&id), Some(TaskStatus::Buried));
}

/// Verify the drop-time release works under the limited protocol.
#[test]
fn test_abandoned_task_is_released() {
    let server = InMemoryServer::new();
    let client = limited_client(&server);
    let observer = Arc::new(RecordingObserver::default());
    client.set_lease_observer(Some(observer.clone() as Arc<dyn LeaseObserver>));
    let tube = client.tube("abandon", TubeOptions::new());
    tube.put(&json!("work"), &PutOptions::new()).unwrap();

    let id: TaskId = take_ready(&tube).id().clone();

    assert_eq!(observer.abandoned(), vec![id.clone()]);
    let mut again = take_ready(&tube);
    assert_eq!(again.id(), &id);
    again.delete().unwrap();
}

/// Verify the standard-only operations are refused with their procedure name.
#[test]
fn test_standard_only_operations_refused() {
    let server = InMemoryServer::new();
    let client = limited_client(&server);
    let tube = client.tube("plain", TubeOptions::new());
    tube.put(&json!(1), &PutOptions::new()).unwrap();

    let mut task = take_ready(&tube);
    assert!(matches!(
        task.requeue(),
        Err(QueueError::Capability { capability }) if capability == "box.queue.requeue"
    ));
    assert!(matches!(
        tube.statistics(),
        Err(QueueError::Capability { capability }) if capability == "box.queue.statistics"
    ));
    assert!(task.ack().unwrap());
}

/// Verify a limited server missing one of its procedures is refused.
#[test]
fn test_missing_limited_procedure() {
    let server = InMemoryServer::new().without_verb(Verb::Delete);
    let client = limited_client(&server);

    let err = client.open().err().unwrap();
    assert!(matches!(
        err,
        QueueError::Capability { capability } if capability == "box.queue.delete"
    ));
}
