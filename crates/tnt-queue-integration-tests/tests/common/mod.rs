//! Common test utilities for tnt-queue integration tests
//!
//! This module provides:
//! - Tracing setup routed through the test harness writer
//! - Client fixtures wired to a fresh in-memory server
//! - A recording lease observer

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tnt_queue::{
    InMemoryServer, LeaseObserver, QueueClient, QueueClientConfig, QueueError, Task, TaskId,
    Tube, TubeOptions,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Poll timeout used by tests that expect a task to be ready
#[allow(dead_code)]
pub const POLL: Option<Duration> = Some(Duration::ZERO);

/// Install a fmt subscriber once per test binary.
///
/// Set `RUST_LOG=tnt_queue=debug` to see every queue call.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "tnt_queue=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Client for space 0 backed by a fresh in-memory server
#[allow(dead_code)]
pub fn test_client() -> (QueueClient, InMemoryServer) {
    client_in_space(0)
}

/// Client for `space`; pass a shared server to put several clients on one
/// engine
#[allow(dead_code)]
pub fn client_in_space(space: u32) -> (QueueClient, InMemoryServer) {
    let server = InMemoryServer::new();
    (client_on(&server, space), server)
}

#[allow(dead_code)]
pub fn client_on(server: &InMemoryServer, space: u32) -> QueueClient {
    init_tracing();
    QueueClient::new(
        QueueClientConfig::new("localhost", 33013, space),
        Arc::new(server.clone()),
    )
    .expect("test configuration is valid")
}

#[allow(dead_code)]
pub fn tube(client: &QueueClient, name: &str) -> Tube {
    client.tube(name, TubeOptions::new())
}

/// Take the next task, failing the test if none is ready
#[allow(dead_code)]
pub fn take_ready(tube: &Tube) -> Task {
    tube.take(POLL)
        .expect("take succeeds")
        .expect("a task is ready")
}

/// Decoded payload as a string, for tests that put plain strings
#[allow(dead_code)]
pub fn text_of(task: &Task) -> String {
    task.data()
        .expect("payload decodes")
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

// ============================================================================
// Recording Lease Observer
// ============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingObserver {
    abandoned: Mutex<Vec<TaskId>>,
    failed: Mutex<Vec<(TaskId, String)>>,
}

impl RecordingObserver {
    #[allow(dead_code)]
    pub fn abandoned(&self) -> Vec<TaskId> {
        self.abandoned.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn failed(&self) -> Vec<(TaskId, String)> {
        self.failed.lock().unwrap().clone()
    }
}

impl LeaseObserver for RecordingObserver {
    fn task_abandoned(&self, task_id: &TaskId, _tube: &str) {
        self.abandoned.lock().unwrap().push(task_id.clone());
    }

    fn abandoned_release_failed(&self, task_id: &TaskId, _tube: &str, error: &QueueError) {
        self.failed
            .lock()
            .unwrap()
            .push((task_id.clone(), error.to_string()));
    }
}
