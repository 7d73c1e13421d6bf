//! Task handles and their disposition lifecycle.
//!
//! A [`Task`] is built from a server row. A task that was taken is a lease:
//! the consumer must ack, release, requeue, bury, delete or complete it. If
//! the handle is dropped while still taken and undisposed, its `Drop`
//! implementation releases the lease synchronously so the task becomes
//! available to other consumers again.
//!
//! ```text
//! Ready --take--> Taken --ack/done--> Done
//!                   |----release----> Ready | Delayed
//!                   |----requeue----> Ready (tail)
//!                   |----bury-------> Buried --dig--> Ready
//!   (any) --delete--> Deleted
//! ```

use crate::client::QueueClient;
use crate::connection::{CallResponse, Field, Row, Verb};
use crate::error::QueueError;
use crate::serialization::PayloadDeserializer;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, warn};

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;

/// Fields in a task row: task_id, tube, status, payload
pub const TASK_ROW_FIELDS: usize = 4;

/// Fields in a meta row
pub const META_ROW_FIELDS: usize = 13;

/// Fields in a limited-protocol task row: 64-bit id at 0, tube at 4,
/// payload at 8
pub const LIMITED_ROW_FIELDS: usize = 9;

// ============================================================================
// Identifiers and status
// ============================================================================

/// Server-assigned task identifier, unique within a space
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Task state as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ready,
    Taken,
    Delayed,
    Buried,
    Done,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Taken => "taken",
            Self::Delayed => "delayed",
            Self::Buried => "buried",
            Self::Done => "done",
            Self::Deleted => "deleted",
        }
    }

    /// No mutating operation may follow a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Deleted)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "taken" => Ok(Self::Taken),
            "delayed" => Ok(Self::Delayed),
            "buried" => Ok(Self::Buried),
            "done" => Ok(Self::Done),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Options for [`Task::release`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOptions {
    /// Seconds before the task is ready again; non-zero makes it delayed
    pub delay: u64,
    /// New time to live in seconds, `0` keeps the server default
    pub ttl: u64,
}

// ============================================================================
// Rows
// ============================================================================

/// Decoded task row: (task_id, tube, status, payload)
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TaskRow {
    pub task_id: TaskId,
    pub tube: String,
    pub status: TaskStatus,
    pub payload: Bytes,
}

impl TaskRow {
    /// Decode the single task row of a response.
    pub(crate) fn parse(verb: Verb, response: CallResponse) -> Result<Self, QueueError> {
        let row = single_row(verb, response)?;
        if row.len() < TASK_ROW_FIELDS {
            return Err(QueueError::MalformedResponse {
                verb,
                expected: TASK_ROW_FIELDS,
                actual: row.len(),
            });
        }

        let mut fields = row.into_iter();
        let task_id = next_text(verb, "task_id", fields.next())?;
        let tube = next_text(verb, "tube", fields.next())?;
        let status = next_text(verb, "status", fields.next())?
            .parse()
            .map_err(|_| QueueError::InvalidField {
                verb,
                field: "status",
            })?;
        let payload = fields.next().map(|f| f.into_bytes()).unwrap_or_default();

        Ok(Self {
            task_id: TaskId(task_id),
            tube,
            status,
            payload,
        })
    }
}

impl TaskRow {
    /// Decode the single limited-protocol row of a response.
    ///
    /// These rows carry no status the client reads, so `status` is the one
    /// the issuing verb implies.
    pub(crate) fn parse_limited(
        verb: Verb,
        response: CallResponse,
        status: TaskStatus,
    ) -> Result<Self, QueueError> {
        let row = single_row(verb, response)?;
        if row.len() < LIMITED_ROW_FIELDS {
            return Err(QueueError::MalformedResponse {
                verb,
                expected: LIMITED_ROW_FIELDS,
                actual: row.len(),
            });
        }

        let mut fields = row.into_iter();
        let task_id = limited_id(verb, fields.next())?;
        let tube = next_text(verb, "tube", fields.nth(3))?;
        let payload = fields.nth(3).map(|f| f.into_bytes()).unwrap_or_default();

        Ok(Self {
            task_id,
            tube,
            status,
            payload,
        })
    }
}

/// Id returned by a limited-protocol put: the first field of the only row
pub(crate) fn limited_put_id(response: CallResponse) -> Result<TaskId, QueueError> {
    let row = single_row(Verb::Put, response)?;
    limited_id(Verb::Put, row.into_iter().next())
}

fn limited_id(verb: Verb, value: Option<Field>) -> Result<TaskId, QueueError> {
    value
        .as_ref()
        .and_then(Field::as_i64_le)
        .map(TaskId::from)
        .ok_or(QueueError::InvalidField {
            verb,
            field: "task_id",
        })
}

fn single_row(verb: Verb, response: CallResponse) -> Result<Row, QueueError> {
    response
        .rows
        .into_iter()
        .next()
        .ok_or(QueueError::EmptyResult { verb })
}

fn next_text(
    verb: Verb,
    field: &'static str,
    value: Option<Field>,
) -> Result<String, QueueError> {
    value
        .as_ref()
        .and_then(|f| f.as_text())
        .map(str::to_string)
        .ok_or(QueueError::InvalidField { verb, field })
}

// ============================================================================
// Metadata
// ============================================================================

/// Server-side bookkeeping for one task.
///
/// Timestamps and durations are in microseconds, as the server keeps them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_id: TaskId,
    pub tube: String,
    pub status: TaskStatus,
    /// Time of the next scheduled state change
    pub event: i64,
    pub ipri: i64,
    pub pri: i64,
    /// Id of the connection that holds the task
    pub cid: i32,
    pub created: i64,
    pub ttl: i64,
    pub ttr: i64,
    /// Times the task was buried
    pub cbury: i64,
    /// Times the task was taken
    pub ctaken: i64,
    /// Server clock when the row was produced
    pub now: i64,
}

impl TaskMeta {
    /// Decode a meta row. Field layout:
    ///
    /// | idx | field  | encoding |
    /// |-----|--------|----------|
    /// | 0-2 | task_id, tube, status | text |
    /// | 3 | event | i64 LE |
    /// | 4-5 | ipri, pri | decimal text, or i64/i32 LE |
    /// | 6 | cid | i32 LE |
    /// | 7-12 | created, ttl, ttr, cbury, ctaken, now | i64 LE |
    pub(crate) fn parse(row: Row) -> Result<Self, QueueError> {
        let verb = Verb::Meta;
        if row.len() < META_ROW_FIELDS {
            return Err(QueueError::MalformedResponse {
                verb,
                expected: META_ROW_FIELDS,
                actual: row.len(),
            });
        }

        let text = |idx: usize, field: &'static str| {
            row[idx]
                .as_text()
                .map(str::to_string)
                .ok_or(QueueError::InvalidField { verb, field })
        };
        let long = |idx: usize, field: &'static str| {
            row[idx]
                .as_i64_le()
                .ok_or(QueueError::InvalidField { verb, field })
        };
        let priority = |idx: usize, field: &'static str| {
            priority_value(&row[idx]).ok_or(QueueError::InvalidField { verb, field })
        };

        Ok(Self {
            task_id: TaskId(text(0, "task_id")?),
            tube: text(1, "tube")?,
            status: text(2, "status")?
                .parse()
                .map_err(|_| QueueError::InvalidField {
                    verb,
                    field: "status",
                })?,
            event: long(3, "event")?,
            ipri: priority(4, "ipri")?,
            pri: priority(5, "pri")?,
            cid: row[6]
                .as_i32_le()
                .ok_or(QueueError::InvalidField { verb, field: "cid" })?,
            created: long(7, "created")?,
            ttl: long(8, "ttl")?,
            ttr: long(9, "ttr")?,
            cbury: long(10, "cbury")?,
            ctaken: long(11, "ctaken")?,
            now: long(12, "now")?,
        })
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.created)
    }

    pub fn now_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.now)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_micros(self.ttl.max(0) as u64)
    }

    pub fn ttr(&self) -> Duration {
        Duration::from_micros(self.ttr.max(0) as u64)
    }
}

/// Priorities arrive as decimal text from some servers and as fixed-width
/// integers from others. Text wins when every byte is a digit.
fn priority_value(field: &Field) -> Option<i64> {
    let decimal = field
        .as_text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| t.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()))
        .and_then(|t| t.parse::<i64>().ok());

    decimal
        .or_else(|| field.as_i64_le())
        .or_else(|| field.as_i32_le().map(i64::from))
}

// ============================================================================
// Lease observer
// ============================================================================

/// Hook notified when a dropped task has its lease released automatically.
///
/// The release runs inside `Drop`, so it cannot return an error; failures are
/// reported here instead of being discarded.
pub trait LeaseObserver: Send + Sync {
    /// A taken task was dropped without disposition and has been released
    fn task_abandoned(&self, _task_id: &TaskId, _tube: &str) {}

    /// Releasing an abandoned task failed
    fn abandoned_release_failed(&self, _task_id: &TaskId, _tube: &str, _error: &QueueError) {}
}

// ============================================================================
// Task handle
// ============================================================================

/// Handle to one task on the server
pub struct Task {
    client: QueueClient,
    task_id: TaskId,
    tube: String,
    status: TaskStatus,
    payload: Bytes,
    space: u32,
    disposed: bool,
    deserializer: Option<Arc<dyn PayloadDeserializer>>,
    decoded: OnceLock<Value>,
}

impl Task {
    pub(crate) fn from_row(client: QueueClient, row: TaskRow) -> Self {
        let space = client.space();
        Self {
            client,
            task_id: row.task_id,
            tube: row.tube,
            status: row.status,
            payload: row.payload,
            space,
            disposed: false,
            deserializer: None,
            decoded: OnceLock::new(),
        }
    }

    /// Handle that never triggers the drop-time release
    pub(crate) fn detached(client: QueueClient, row: TaskRow) -> Self {
        let mut task = Self::from_row(client, row);
        task.disposed = true;
        task
    }

    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    /// Raw payload bytes as received from the server
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether a disposition has been recorded for this handle
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Use `deserializer` for this task, ahead of tube and queue overrides
    pub fn set_deserializer(&mut self, deserializer: Option<Arc<dyn PayloadDeserializer>>) {
        self.deserializer = deserializer;
        self.decoded = OnceLock::new();
    }

    /// Decoded payload, computed on first access and cached.
    ///
    /// An empty payload decodes to `None`.
    pub fn data(&self) -> Result<Option<&Value>, QueueError> {
        if self.payload.is_empty() {
            return Ok(None);
        }

        if let Some(value) = self.decoded.get() {
            return Ok(Some(value));
        }

        let deserializer = self
            .client
            .resolve_deserializer(self.deserializer.as_ref(), &self.tube);
        let value = deserializer.deserialize(&self.payload)?;
        Ok(Some(self.decoded.get_or_init(|| value)))
    }

    /// Decoded payload converted into a typed value
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, QueueError> {
        match self.data()? {
            Some(value) => {
                let typed = T::deserialize(value).map_err(crate::SerializationError::from)?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    /// Confirm completion; the server removes the task
    pub fn ack(&mut self) -> Result<bool, QueueError> {
        self.begin(Verb::Ack)?;
        let acked = self.client.ack(&self.task_id)?;
        if acked {
            self.status = TaskStatus::Done;
        }
        Ok(acked)
    }

    /// Return the task to the queue without executing it
    pub fn release(&mut self, options: ReleaseOptions) -> Result<TaskStatus, QueueError> {
        self.begin(Verb::Release)?;
        let row = self.client.release_row(&self.task_id, options)?;
        self.status = row.status;
        Ok(self.status)
    }

    /// Delete the task regardless of its server-side state
    pub fn delete(&mut self) -> Result<bool, QueueError> {
        self.begin(Verb::Delete)?;
        let deleted = self.client.delete(&self.task_id)?;
        if deleted {
            self.status = TaskStatus::Deleted;
        }
        Ok(deleted)
    }

    /// Put the task back behind every task that is currently ready
    pub fn requeue(&mut self) -> Result<bool, QueueError> {
        self.begin(Verb::Requeue)?;
        let requeued = self.client.requeue(&self.task_id)?;
        if requeued {
            self.status = TaskStatus::Ready;
        }
        Ok(requeued)
    }

    /// Mark the task done without deleting it, replacing its payload
    pub fn done(&mut self, payload: &Value) -> Result<bool, QueueError> {
        self.begin(Verb::Done)?;
        let config = self.client.tube_config(&self.tube);
        let encoded = self
            .client
            .resolve_serializer(None, &config)
            .serialize(payload)?;

        let completed = self.client.done(&self.task_id, encoded.clone())?;
        if completed {
            self.status = TaskStatus::Done;
            self.payload = encoded;
            self.decoded = OnceLock::new();
        }
        Ok(completed)
    }

    /// Exclude the task from scheduling until it is dug up
    pub fn bury(&mut self) -> Result<bool, QueueError> {
        self.begin(Verb::Bury)?;
        let buried = self.client.bury(&self.task_id)?;
        if buried {
            self.status = TaskStatus::Buried;
        }
        Ok(buried)
    }

    /// Return a buried task to the ready state
    pub fn dig(&mut self) -> Result<bool, QueueError> {
        self.begin(Verb::Dig)?;
        let dug = self.client.dig(&self.task_id)?;
        if dug {
            self.status = TaskStatus::Ready;
        }
        Ok(dug)
    }

    /// Extend the lease of a taken task
    pub fn touch(&self) -> Result<bool, QueueError> {
        self.client.touch(&self.task_id)
    }

    /// Server metadata, or `None` if the server no longer knows the task
    pub fn meta(&self) -> Result<Option<TaskMeta>, QueueError> {
        self.client.meta(&self.task_id)
    }

    /// Record a disposition. Refused operations leave the handle as it was,
    /// so the drop-time release still applies.
    fn begin(&mut self, verb: Verb) -> Result<(), QueueError> {
        if self.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                task_id: self.task_id.clone(),
                status: self.status,
                operation: verb.as_str(),
            });
        }

        let protocol = self.client.protocol();
        if !protocol.defines(verb) {
            return Err(QueueError::Capability {
                capability: protocol.procedure(verb),
            });
        }

        self.disposed = true;
        Ok(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.status != TaskStatus::Taken || self.disposed {
            return;
        }

        warn!(
            task_id = %self.task_id,
            tube = %self.tube,
            space = self.space,
            "Taken task dropped without disposition; releasing lease"
        );

        let observer = self.client.lease_observer();
        match self.client.release_row(&self.task_id, ReleaseOptions::default()) {
            Ok(row) => {
                self.status = row.status;
                if let Some(observer) = observer {
                    observer.task_abandoned(&self.task_id, &self.tube);
                }
            }
            Err(e) => {
                error!(
                    task_id = %self.task_id,
                    tube = %self.tube,
                    error = %e,
                    "Failed to release abandoned task"
                );
                if let Some(observer) = observer {
                    observer.abandoned_release_failed(&self.task_id, &self.tube, &e);
                }
            }
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Task (id: {}, tube: {}, status: {}, space: {})",
            self.task_id, self.tube, self.status, self.space
        )
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("tube", &self.tube)
            .field("status", &self.status)
            .field("space", &self.space)
            .field("disposed", &self.disposed)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
