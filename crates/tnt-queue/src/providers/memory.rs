//! In-memory queue server for testing and development.
//!
//! This module provides a fully functional in-process queue engine that:
//! - Answers every `queue.<verb>` procedure the client issues
//! - Orders urgent tasks ahead of normal ones, most recent urgent first
//! - Implements delay, time to live and lease (ttr) expiry
//! - Blocks `take` callers until a task is ready or their timeout elapses
//! - Keeps per-space statistics in the flat `space<N>.<tube>.<metric>` form
//!
//! Illegal transitions are answered with a non-zero return code, as a real
//! server does, rather than with an error.
//!
//! Connections opened with [`Protocol::Limited`] answer the `box.queue.*`
//! subset instead. Their puts carry a retry bound and a tube capacity, and
//! their task rows have nine fields:
//!
//! | idx | field | encoding |
//! |-----|-------|----------|
//! | 0 | task id | i64 LE |
//! | 1-3 | space, status, pri | text |
//! | 4 | tube | text |
//! | 5 | ctaken | i64 LE |
//! | 6 | cid | i32 LE |
//! | 7 | created | i64 LE |
//! | 8 | payload | bytes |

use crate::connection::{
    Arg, CallResponse, ConnectParams, Connection, ConnectionFactory, Field, Protocol, Row, Verb,
};
use crate::error::QueueError;
use crate::task::{TaskId, TaskStatus};
use bytes::Bytes;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Return code for calls that are not legal in the task's current state
pub const ILLEGAL_TRANSITION: u32 = 1;

/// Return code for a limited-protocol put into a tube at capacity
pub const TUBE_FULL: u32 = 2;

const MICROS_PER_SECOND: i64 = 1_000_000;

const GAUGES: [&str; 6] = ["ready", "taken", "delayed", "buried", "done", "total"];

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn seconds(value: u64) -> i64 {
    i64::try_from(value)
        .unwrap_or(i64::MAX)
        .saturating_mul(MICROS_PER_SECOND)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Scheduling position of a ready task. Urgent tasks sort first, the most
/// recent one leading; normal tasks follow by priority, then insertion.
/// Requeued tasks sort after every normal task, in requeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Urgent(Reverse<u64>),
    Normal { pri: u32, seq: u64 },
    Tail(u64),
}

struct StoredTask {
    id: TaskId,
    number: i64,
    space: u32,
    tube: String,
    status: TaskStatus,
    payload: Bytes,
    slot: Slot,
    pri: u32,
    cid: i32,
    created: i64,
    ttl: i64,
    ttr: i64,
    expires_at: Option<i64>,
    ready_at: Option<i64>,
    lease_until: Option<i64>,
    cbury: i64,
    ctaken: i64,
    /// Takes allowed after the first; limited-protocol tasks only
    retry: Option<u64>,
}

impl StoredTask {
    fn row(&self) -> Row {
        self.row_with_status(self.status)
    }

    fn row_for(&self, protocol: Protocol) -> Row {
        match protocol {
            Protocol::Standard => self.row(),
            Protocol::Limited => self.limited_row(),
        }
    }

    fn limited_row(&self) -> Row {
        vec![
            Field::from_i64(self.number),
            Field::from(self.space.to_string()),
            Field::from(self.status.as_str()),
            Field::from(self.pri.to_string()),
            Field::from(self.tube.as_str()),
            Field::from_i64(self.ctaken),
            Field::from_i32(self.cid),
            Field::from_i64(self.created),
            Field::from(self.payload.clone()),
        ]
    }

    fn row_with_status(&self, status: TaskStatus) -> Row {
        vec![
            Field::from(self.id.as_str()),
            Field::from(self.tube.as_str()),
            Field::from(status.as_str()),
            Field::from(self.payload.clone()),
        ]
    }

    /// Next time this task changes state on its own
    fn next_event(&self) -> Option<i64> {
        let transition = match self.status {
            TaskStatus::Delayed => self.ready_at,
            TaskStatus::Taken => self.lease_until,
            _ => None,
        };
        [transition, self.expires_at].into_iter().flatten().min()
    }

    fn meta_row(&self, now: i64) -> Row {
        let ipri = match self.slot {
            Slot::Urgent(_) => 0,
            Slot::Normal { pri, .. } => pri,
            Slot::Tail(_) => u32::MAX,
        };
        vec![
            Field::from(self.id.as_str()),
            Field::from(self.tube.as_str()),
            Field::from(self.status.as_str()),
            Field::from_i64(self.next_event().unwrap_or(0)),
            Field::from(ipri.to_string()),
            Field::from(self.pri.to_string()),
            Field::from_i32(self.cid),
            Field::from_i64(self.created),
            Field::from_i64(self.ttl),
            Field::from_i64(self.ttr),
            Field::from_i64(self.cbury),
            Field::from_i64(self.ctaken),
            Field::from_i64(now),
        ]
    }

    fn lease(&mut self, cid: i32, now: i64) {
        self.status = TaskStatus::Taken;
        self.cid = cid;
        self.ctaken += 1;
        self.lease_until = (self.ttr > 0).then(|| now.saturating_add(self.ttr));
    }

    fn make_ready(&mut self) {
        self.status = TaskStatus::Ready;
        self.cid = 0;
        self.ready_at = None;
        self.lease_until = None;
    }

    fn bury(&mut self) {
        self.status = TaskStatus::Buried;
        self.cid = 0;
        self.ready_at = None;
        self.lease_until = None;
        self.cbury += 1;
    }

    fn retries_exhausted(&self) -> bool {
        self.retry
            .is_some_and(|retry| u64::try_from(self.ctaken).unwrap_or(0) > retry)
    }

    /// Return a lease to the schedule, or bury the task once its retries are
    /// used up
    fn end_lease(&mut self) {
        if self.retries_exhausted() {
            debug!(task_id = %self.id, ctaken = self.ctaken, "Retries exhausted, burying task");
            self.bury();
        } else {
            self.make_ready();
        }
    }
}

#[derive(Default)]
struct ServerState {
    tasks: HashMap<TaskId, StoredTask>,
    sequence: u64,
    counters: BTreeMap<(u32, String, &'static str), u64>,
    next_cid: i32,
    connections: usize,
    fail_next: HashSet<Verb>,
    unsupported: HashSet<Verb>,
}

impl ServerState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn count(&mut self, space: u32, tube: &str, verb: Verb) {
        *self
            .counters
            .entry((space, tube.to_string(), verb.as_str()))
            .or_default() += 1;
    }

    /// Apply every time-driven transition that is due
    fn expire(&mut self, now: i64) {
        self.tasks
            .retain(|_, task| task.expires_at.map_or(true, |at| at > now));

        for task in self.tasks.values_mut() {
            match task.status {
                TaskStatus::Delayed if task.ready_at.is_some_and(|at| at <= now) => {
                    task.make_ready()
                }
                TaskStatus::Taken if task.lease_until.is_some_and(|at| at <= now) => {
                    task.end_lease()
                }
                _ => {}
            }
        }
    }

    fn find_mut(&mut self, space: u32, id: &TaskId) -> Option<&mut StoredTask> {
        self.tasks.get_mut(id).filter(|task| task.space == space)
    }

    fn next_ready(&mut self, space: u32, tube: &str) -> Option<&mut StoredTask> {
        self.tasks
            .values_mut()
            .filter(|t| t.space == space && t.tube == tube && t.status == TaskStatus::Ready)
            .min_by_key(|t| t.slot)
    }

    fn next_event(&self, space: u32, tube: &str) -> Option<i64> {
        self.tasks
            .values()
            .filter(|t| t.space == space && t.tube == tube)
            .filter_map(StoredTask::next_event)
            .min()
    }

    // ------------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------------

    fn put(&mut self, args: &Args<'_>, urgent: bool, now: i64) -> Result<CallResponse, QueueError> {
        let space = args.space()?;
        let tube = args.text(1, "tube")?.to_string();
        let delay = if urgent { 0 } else { args.uint(2, "delay")? };
        let ttl = seconds(args.uint(3, "ttl")?);
        let ttr = seconds(args.uint(4, "ttr")?);
        let pri = u32::try_from(args.uint(5, "pri")?).map_err(|_| args.invalid(5, "pri"))?;
        let payload = args.bytes(6, "payload")?;

        let seq = self.next_sequence();
        let slot = if urgent {
            Slot::Urgent(Reverse(seq))
        } else {
            Slot::Normal { pri, seq }
        };
        let ready_at = (delay > 0).then(|| now.saturating_add(seconds(delay)));

        let task = StoredTask {
            id: TaskId::from(Uuid::new_v4().simple().to_string()),
            number: i64::try_from(seq).unwrap_or(i64::MAX),
            space,
            tube: tube.clone(),
            status: if ready_at.is_some() {
                TaskStatus::Delayed
            } else {
                TaskStatus::Ready
            },
            payload,
            slot,
            pri,
            cid: 0,
            created: now,
            ttl,
            ttr,
            expires_at: (ttl > 0).then(|| now.saturating_add(ttl)),
            ready_at,
            lease_until: None,
            cbury: 0,
            ctaken: 0,
            retry: None,
        };
        let row = task.row();
        self.tasks.insert(task.id.clone(), task);
        self.count(space, &tube, args.verb);

        Ok(CallResponse::rows(vec![row]))
    }

    /// Limited-protocol put. Arguments: space, tube, limits, pri, delay, ttr,
    /// ttl, retry, payload. Answers with the new 64-bit id only.
    fn put_limited(&mut self, args: &Args<'_>, now: i64) -> Result<CallResponse, QueueError> {
        let space = args.space()?;
        let tube = args.text(1, "tube")?.to_string();
        let limits = args.uint(2, "limits")?;
        let pri = u32::try_from(args.uint(3, "pri")?).map_err(|_| args.invalid(3, "pri"))?;
        let delay = args.uint(4, "delay")?;
        let ttr = seconds(args.uint(5, "ttr")?);
        let ttl = seconds(args.uint(6, "ttl")?);
        let retry = args.uint(7, "retry")?;
        let payload = args.bytes(8, "payload")?;

        let held = self
            .tasks
            .values()
            .filter(|t| t.space == space && t.tube == tube)
            .count();
        if u64::try_from(held).unwrap_or(u64::MAX) >= limits {
            debug!(tube = %tube, held, limits, "Tube is at capacity");
            return Ok(CallResponse::status(TUBE_FULL));
        }

        let seq = self.next_sequence();
        let number = i64::try_from(seq).unwrap_or(i64::MAX);
        let ready_at = (delay > 0).then(|| now.saturating_add(seconds(delay)));
        let task = StoredTask {
            id: TaskId::from(number),
            number,
            space,
            tube: tube.clone(),
            status: if ready_at.is_some() {
                TaskStatus::Delayed
            } else {
                TaskStatus::Ready
            },
            payload,
            slot: Slot::Normal { pri, seq },
            pri,
            cid: 0,
            created: now,
            ttl,
            ttr,
            expires_at: (ttl > 0).then(|| now.saturating_add(ttl)),
            ready_at,
            lease_until: None,
            cbury: 0,
            ctaken: 0,
            retry: Some(retry),
        };
        self.tasks.insert(task.id.clone(), task);
        self.count(space, &tube, Verb::Put);

        Ok(CallResponse::rows(vec![vec![Field::from_i64(number)]]))
    }

    /// Apply a task-level verb on behalf of connection `cid`.
    ///
    /// Ack, release, done and touch act on a lease, so only the connection
    /// holding it may issue them.
    fn settle(&mut self, args: &Args<'_>, cid: i32, now: i64) -> Result<CallResponse, QueueError> {
        let protocol = args.protocol;
        let verb = args.verb;
        let space = args.space()?;
        let id = TaskId::from(args.text(1, "task_id")?);
        let sequence = self.next_sequence();

        let Some(task) = self.find_mut(space, &id) else {
            return Ok(CallResponse::status(ILLEGAL_TRANSITION));
        };

        let allowed = match verb {
            Verb::Ack | Verb::Release | Verb::Done | Verb::Touch => {
                task.status == TaskStatus::Taken && task.cid == cid
            }
            Verb::Requeue => matches!(
                task.status,
                TaskStatus::Taken | TaskStatus::Ready | TaskStatus::Delayed
            ),
            Verb::Bury => matches!(
                task.status,
                TaskStatus::Taken | TaskStatus::Ready | TaskStatus::Delayed
            ),
            Verb::Dig => task.status == TaskStatus::Buried,
            _ => true,
        };
        if !allowed {
            debug!(
                task_id = %id,
                status = %task.status,
                holder = task.cid,
                cid,
                verb = %verb,
                "Rejecting illegal transition"
            );
            return Ok(CallResponse::status(ILLEGAL_TRANSITION));
        }

        let row = match verb {
            Verb::Ack => task.row_with_status(TaskStatus::Done),
            Verb::Delete => task.row_with_status(TaskStatus::Deleted),
            Verb::Release => {
                let delay = args.optional_uint(2).unwrap_or(0);
                let ttl = args.optional_uint(3).unwrap_or(0);
                task.end_lease();
                if delay > 0 && task.status == TaskStatus::Ready {
                    task.status = TaskStatus::Delayed;
                    task.ready_at = Some(now.saturating_add(seconds(delay)));
                }
                if ttl > 0 {
                    task.ttl = seconds(ttl);
                    task.expires_at = Some(now.saturating_add(task.ttl));
                }
                task.row_for(protocol)
            }
            Verb::Requeue => {
                task.make_ready();
                task.slot = Slot::Tail(sequence);
                task.row()
            }
            Verb::Bury => {
                task.bury();
                task.row()
            }
            Verb::Dig => {
                task.make_ready();
                task.row()
            }
            Verb::Done => {
                task.status = TaskStatus::Done;
                task.payload = args.bytes(2, "payload")?;
                task.cid = 0;
                task.lease_until = None;
                task.row()
            }
            Verb::Touch => {
                if task.ttr > 0 {
                    task.lease_until = Some(now.saturating_add(task.ttr));
                }
                task.row()
            }
            Verb::Meta => task.meta_row(now),
            _ => task.row(),
        };

        let tube = task.tube.clone();
        if matches!(verb, Verb::Ack | Verb::Delete) {
            self.tasks.remove(&id);
        }
        self.count(space, &tube, verb);

        Ok(CallResponse::rows(vec![row]))
    }

    fn kick(&mut self, args: &Args<'_>) -> Result<CallResponse, QueueError> {
        let space = args.space()?;
        let tube = args.text(1, "tube")?.to_string();
        let limit = args.optional_uint(2).filter(|n| *n > 0).unwrap_or(1);

        let mut buried: Vec<&mut StoredTask> = self
            .tasks
            .values_mut()
            .filter(|t| t.space == space && t.tube == tube && t.status == TaskStatus::Buried)
            .collect();
        buried.sort_by_key(|t| t.slot);

        let mut kicked = 0u64;
        for task in buried.into_iter().take(usize::try_from(limit).unwrap_or(usize::MAX)) {
            task.make_ready();
            kicked += 1;
        }
        self.count(space, &tube, Verb::Kick);

        Ok(CallResponse::rows(vec![vec![Field::from(kicked.to_string())]]))
    }

    fn statistics(&self, args: &Args<'_>) -> CallResponse {
        let only = args.optional_text(1);
        let wanted = |tube: &str| only.map_or(true, |name| name == tube);

        let blank = || GAUGES.iter().map(|g| (*g, 0u64)).collect::<BTreeMap<_, _>>();
        let mut flat: BTreeMap<String, String> = BTreeMap::new();
        let mut gauges: BTreeMap<(u32, String), BTreeMap<&'static str, u64>> = BTreeMap::new();

        for ((space, tube, verb), value) in &self.counters {
            if wanted(tube.as_str()) {
                flat.insert(format!("space{space}.{tube}.{verb}"), value.to_string());
                gauges.entry((*space, tube.clone())).or_insert_with(blank);
            }
        }
        for task in self.tasks.values().filter(|t| wanted(t.tube.as_str())) {
            let entry = gauges
                .entry((task.space, task.tube.clone()))
                .or_insert_with(blank);
            if let Some(n) = entry.get_mut(task.status.as_str()) {
                *n += 1;
            }
            *entry.entry("total").or_default() += 1;
        }
        for ((space, tube), counts) in gauges {
            for (status, value) in counts {
                flat.insert(
                    format!("space{space}.{tube}.tasks.{status}"),
                    value.to_string(),
                );
            }
        }

        let row: Row = flat
            .into_iter()
            .flat_map(|(key, value)| [Field::from(key), Field::from(value)])
            .collect();
        CallResponse::rows(vec![row])
    }
}

/// Positional argument reader for one call
struct Args<'a> {
    verb: Verb,
    protocol: Protocol,
    args: &'a [Arg],
}

impl<'a> Args<'a> {
    fn new(verb: Verb, protocol: Protocol, args: &'a [Arg]) -> Self {
        Self {
            verb,
            protocol,
            args,
        }
    }

    fn invalid(&self, idx: usize, name: &str) -> QueueError {
        QueueError::transport(format!(
            "{}: argument #{} ({}) is missing or has the wrong type",
            self.protocol.procedure(self.verb),
            idx + 1,
            name
        ))
    }

    fn space(&self) -> Result<u32, QueueError> {
        u32::try_from(self.uint(0, "space")?).map_err(|_| self.invalid(0, "space"))
    }

    fn uint(&self, idx: usize, name: &str) -> Result<u64, QueueError> {
        self.optional_uint(idx).ok_or_else(|| self.invalid(idx, name))
    }

    fn optional_uint(&self, idx: usize) -> Option<u64> {
        self.args.get(idx).and_then(Arg::as_u64)
    }

    fn optional_float(&self, idx: usize) -> Option<f64> {
        self.args.get(idx).and_then(Arg::as_f64)
    }

    fn text(&self, idx: usize, name: &str) -> Result<&'a str, QueueError> {
        self.optional_text(idx).ok_or_else(|| self.invalid(idx, name))
    }

    fn optional_text(&self, idx: usize) -> Option<&'a str> {
        self.args.get(idx).and_then(Arg::as_str)
    }

    fn bytes(&self, idx: usize, name: &str) -> Result<Bytes, QueueError> {
        match self.args.get(idx) {
            Some(Arg::Bytes(bytes)) => Ok(bytes.clone()),
            Some(Arg::Str(text)) => Ok(Bytes::from(text.clone())),
            _ => Err(self.invalid(idx, name)),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

struct Shared {
    state: Mutex<ServerState>,
    ready: Condvar,
}

/// In-process queue server.
///
/// Clones share one engine. Every connection opened through the
/// [`ConnectionFactory`] implementation gets its own connection id.
#[derive(Clone)]
pub struct InMemoryServer {
    shared: Arc<Shared>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Report `verb` as unsupported on every connection
    pub fn without_verb(self, verb: Verb) -> Self {
        self.lock().unsupported.insert(verb);
        self
    }

    /// Make the next call of `verb` fail with a transport error
    pub fn fail_next(&self, verb: Verb) {
        self.lock().fail_next.insert(verb);
    }

    /// Connections opened so far
    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    /// Tasks currently stored across every space
    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Server-side status of a task, `None` once it is gone
    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        let mut state = self.lock();
        state.expire(now_micros());
        state.tasks.get(id).map(|task| task.status)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for InMemoryServer {
    fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>, QueueError> {
        let cid = {
            let mut state = self.lock();
            state.connections += 1;
            state.next_cid += 1;
            state.next_cid
        };
        info!(
            host = %params.host,
            port = params.port,
            cid,
            protocol = %params.protocol,
            "In-memory connection opened"
        );

        Ok(Arc::new(InMemoryConnection {
            server: self.clone(),
            cid,
            protocol: params.protocol,
        }))
    }
}

/// One connection to an [`InMemoryServer`]
pub struct InMemoryConnection {
    server: InMemoryServer,
    cid: i32,
    protocol: Protocol,
}

impl InMemoryConnection {
    pub fn cid(&self) -> i32 {
        self.cid
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn take(&self, args: &Args<'_>) -> Result<CallResponse, QueueError> {
        let space = args.space()?;
        let tube = args.text(1, "tube")?;
        let deadline = args
            .optional_float(2)
            .map(|timeout| now_micros().saturating_add((timeout.max(0.0) * 1e6) as i64));

        let mut state = self.server.lock();
        loop {
            let now = now_micros();
            state.expire(now);

            if let Some(task) = state.next_ready(space, tube) {
                task.lease(self.cid, now);
                let row = task.row_for(self.protocol);
                state.count(space, tube, Verb::Take);
                return Ok(CallResponse::rows(vec![row]));
            }

            if deadline.is_some_and(|at| now >= at) {
                return Ok(CallResponse::rows(Vec::new()));
            }

            let wake = [deadline, state.next_event(space, tube)]
                .into_iter()
                .flatten()
                .min();
            state = match wake {
                Some(at) => {
                    let wait = Duration::from_micros(u64::try_from(at - now).unwrap_or(0).max(1));
                    self.server
                        .shared
                        .ready
                        .wait_timeout(state, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .server
                    .shared
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl Connection for InMemoryConnection {
    fn call(&self, verb: Verb, args: &[Arg]) -> Result<CallResponse, QueueError> {
        let procedure = self.protocol.procedure(verb);
        {
            let mut state = self.server.lock();
            if state.fail_next.remove(&verb) {
                return Err(QueueError::transport(format!(
                    "injected failure for {}",
                    procedure
                )));
            }
            if state.unsupported.contains(&verb) || !self.protocol.defines(verb) {
                return Err(QueueError::transport(format!(
                    "procedure {} is not defined",
                    procedure
                )));
            }
        }

        debug!(cid = self.cid, procedure = %procedure, "In-memory call");
        let args = Args::new(verb, self.protocol, args);
        if verb == Verb::Take {
            return self.take(&args);
        }

        let response = {
            let mut state = self.server.lock();
            let now = now_micros();
            state.expire(now);
            match verb {
                Verb::Put if self.protocol == Protocol::Limited => state.put_limited(&args, now)?,
                Verb::Put => state.put(&args, false, now)?,
                Verb::Urgent => state.put(&args, true, now)?,
                Verb::Kick => state.kick(&args)?,
                Verb::Statistics => state.statistics(&args),
                _ => state.settle(&args, self.cid, now)?,
            }
        };
        self.server.shared.ready.notify_all();

        Ok(response)
    }

    fn supports(&self, verb: Verb) -> bool {
        self.protocol.defines(verb) && !self.server.lock().unsupported.contains(&verb)
    }
}
