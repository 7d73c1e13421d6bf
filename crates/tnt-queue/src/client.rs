//! Queue client: session state and RPC primitives.
//!
//! [`QueueClient`] is pinned to one space. It owns the connection, the tube
//! registry and the queue-level payload codecs. It is cheap to clone; clones
//! share all state, which is how [`Tube`] and [`Task`] handles call back into
//! it.
//!
//! Under [`Protocol::Limited`] only put, take, ack, release and delete are
//! available; every other operation fails with [`QueueError::Capability`]
//! before anything is sent.

use crate::connection::{
    verify_capabilities, Arg, CallResponse, Connection, ConnectionFactory, Protocol, Verb,
};
use crate::error::QueueError;
use crate::serialization::{PayloadDeserializer, PayloadSerializer, SerializationPolicy};
use crate::settings::QueueClientConfig;
use crate::stats::{StatsAggregator, StatsSnapshot, TubeStats};
use crate::task::{
    limited_put_id, LeaseObserver, ReleaseOptions, Task, TaskId, TaskMeta, TaskRow, TaskStatus,
};
use crate::tube::{TaskOptions, Tube, TubeConfig, TubeOptions, TubeRegistry};
use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

struct ClientInner {
    config: QueueClientConfig,
    factory: RwLock<Arc<dyn ConnectionFactory>>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    tubes: RwLock<TubeRegistry>,
    codecs: RwLock<SerializationPolicy>,
    observer: RwLock<Option<Arc<dyn LeaseObserver>>>,
}

/// Client for one space of a remote task queue
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

fn read<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl QueueClient {
    /// Create a client. The configuration is validated immediately; no
    /// connection is opened until the first call.
    pub fn new(
        config: QueueClientConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let mut registry = TubeRegistry::new();
        for (name, options) in &config.tubes {
            registry.get_or_create(name, options);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                factory: RwLock::new(factory),
                connection: RwLock::new(None),
                tubes: RwLock::new(registry),
                codecs: RwLock::new(SerializationPolicy::new()),
                observer: RwLock::new(None),
            }),
        })
    }

    pub fn config(&self) -> &QueueClientConfig {
        &self.inner.config
    }

    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    pub fn space(&self) -> u32 {
        self.inner.config.space
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.config.protocol
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Return the live connection, opening it first if needed.
    ///
    /// Concurrent first callers are serialized on the write lock and re-check
    /// after acquiring it, so at most one connection is ever built.
    pub fn open(&self) -> Result<Arc<dyn Connection>, QueueError> {
        if let Some(connection) = read(&self.inner.connection).as_ref() {
            return Ok(Arc::clone(connection));
        }

        let mut slot = write(&self.inner.connection);
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }

        let factory = read(&self.inner.factory).clone();
        let connection = factory.connect(&self.inner.config.connect_params())?;
        verify_capabilities(connection.as_ref(), self.protocol())?;

        info!(
            host = %self.inner.config.host,
            port = self.inner.config.port,
            space = self.inner.config.space,
            protocol = %self.protocol(),
            "Opened queue connection"
        );
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Drop the live connection, if any. The next call reconnects.
    pub fn close(&self) {
        if write(&self.inner.connection).take().is_some() {
            info!(host = %self.inner.config.host, "Closed queue connection");
        }
    }

    pub fn is_connected(&self) -> bool {
        read(&self.inner.connection).is_some()
    }

    /// Replace the connection factory. Any live connection is dropped so the
    /// next call is served by the new factory.
    pub fn set_connection_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        *write(&self.inner.factory) = factory;
        self.close();
    }

    // ------------------------------------------------------------------------
    // Codecs and observers
    // ------------------------------------------------------------------------

    /// Set the queue-level serializer; `None` restores the built-in codec
    pub fn set_serializer(&self, serializer: Option<Arc<dyn PayloadSerializer>>) {
        write(&self.inner.codecs).set_serializer(serializer);
    }

    /// Set the queue-level deserializer; `None` restores the built-in codec
    pub fn set_deserializer(&self, deserializer: Option<Arc<dyn PayloadDeserializer>>) {
        write(&self.inner.codecs).set_deserializer(deserializer);
    }

    pub(crate) fn resolve_serializer(
        &self,
        call: Option<&Arc<dyn PayloadSerializer>>,
        tube: &TubeConfig,
    ) -> Arc<dyn PayloadSerializer> {
        SerializationPolicy::resolve_serializer(call, tube.codecs(), &read(&self.inner.codecs))
    }

    pub(crate) fn resolve_deserializer(
        &self,
        task: Option<&Arc<dyn PayloadDeserializer>>,
        tube: &str,
    ) -> Arc<dyn PayloadDeserializer> {
        let tubes = read(&self.inner.tubes);
        let queue = read(&self.inner.codecs);
        match tubes.get(tube) {
            Some(config) => SerializationPolicy::resolve_deserializer(task, config.codecs(), &queue),
            None => {
                SerializationPolicy::resolve_deserializer(task, &SerializationPolicy::new(), &queue)
            }
        }
    }

    /// Install a hook for drop-time lease releases; `None` removes it
    pub fn set_lease_observer(&self, observer: Option<Arc<dyn LeaseObserver>>) {
        *write(&self.inner.observer) = observer;
    }

    pub(crate) fn lease_observer(&self) -> Option<Arc<dyn LeaseObserver>> {
        read(&self.inner.observer).clone()
    }

    // ------------------------------------------------------------------------
    // Tube registry
    // ------------------------------------------------------------------------

    /// Get a tube handle, registering the tube on first use.
    ///
    /// `options` are merged into the tube's defaults; keys not given keep
    /// their earlier values.
    pub fn tube(&self, name: &str, options: TubeOptions) -> Tube {
        write(&self.inner.tubes).get_or_create(name, &options);
        Tube::new(self.clone(), name.to_string())
    }

    /// Names of every registered tube, sorted
    pub fn tube_names(&self) -> Vec<String> {
        read(&self.inner.tubes).names()
    }

    /// Snapshot of a tube's configuration; unregistered tubes read as
    /// defaults
    pub(crate) fn tube_config(&self, name: &str) -> TubeConfig {
        read(&self.inner.tubes)
            .get(name)
            .cloned()
            .unwrap_or_else(|| TubeConfig::new(name, TubeOptions::default()))
    }

    pub(crate) fn with_tube_mut<R>(&self, name: &str, f: impl FnOnce(&mut TubeConfig) -> R) -> R {
        let mut tubes = write(&self.inner.tubes);
        f(tubes.get_or_create(name, &TubeOptions::default()))
    }

    // ------------------------------------------------------------------------
    // RPC primitives
    // ------------------------------------------------------------------------

    fn call(&self, verb: Verb, args: Vec<Arg>) -> Result<CallResponse, QueueError> {
        let protocol = self.protocol();
        if !protocol.defines(verb) {
            return Err(QueueError::Capability {
                capability: protocol.procedure(verb),
            });
        }

        let connection = self.open()?;
        debug!(verb = %verb, space = self.space(), args = args.len(), "Queue call");
        connection.call(verb, &args)
    }

    fn call_status(&self, verb: Verb, task_id: &TaskId) -> Result<bool, QueueError> {
        let response = self.call(
            verb,
            vec![Arg::from(self.space()), Arg::from(task_id.as_str())],
        )?;
        Ok(response.is_success())
    }

    /// Enqueue an already encoded payload with `verb` (put or urgent)
    pub(crate) fn put(
        &self,
        tube: &str,
        verb: Verb,
        options: TaskOptions,
        payload: Bytes,
    ) -> Result<Task, QueueError> {
        debug!(tube = %tube, verb = %verb, ?options, "Enqueueing task");
        if self.protocol() == Protocol::Limited {
            return self.put_limited(tube, verb, options, payload);
        }

        let response = self.call(
            verb,
            vec![
                Arg::from(self.space()),
                Arg::from(tube),
                Arg::from(options.delay),
                Arg::from(options.ttl),
                Arg::from(options.ttr),
                Arg::from(options.pri),
                Arg::from(payload),
            ],
        )?;
        let row = TaskRow::parse(verb, response)?;
        Ok(Task::from_row(self.clone(), row))
    }

    /// Limited-protocol put. The server answers with the new id only, so the
    /// handle is built from what was sent.
    fn put_limited(
        &self,
        tube: &str,
        verb: Verb,
        options: TaskOptions,
        payload: Bytes,
    ) -> Result<Task, QueueError> {
        let response = self.call(
            verb,
            vec![
                Arg::from(self.space()),
                Arg::from(tube),
                Arg::from(options.limits_or_default()),
                Arg::from(options.pri),
                Arg::from(options.delay),
                Arg::from(options.ttr),
                Arg::from(options.ttl),
                Arg::from(options.retry_or_default()),
                Arg::from(payload.clone()),
            ],
        )?;
        let task_id = limited_put_id(response)?;
        let status = if options.delay > 0 {
            TaskStatus::Delayed
        } else {
            TaskStatus::Ready
        };

        Ok(Task::from_row(
            self.clone(),
            TaskRow {
                task_id,
                tube: tube.to_string(),
                status,
                payload,
            },
        ))
    }

    /// Take the highest-priority ready task of `tube`.
    ///
    /// See [`Tube::take`] for the meaning of `timeout`.
    pub fn take(&self, tube: &str, timeout: Option<Duration>) -> Result<Option<Task>, QueueError> {
        let mut args = vec![Arg::from(self.space()), Arg::from(tube)];
        if let Some(timeout) = timeout {
            args.push(Arg::Float(timeout.as_secs_f64()));
        }

        let response = self.call(Verb::Take, args)?;
        if response.row_count() == 0 {
            return Ok(None);
        }
        let row = match self.protocol() {
            Protocol::Standard => TaskRow::parse(Verb::Take, response)?,
            Protocol::Limited => TaskRow::parse_limited(Verb::Take, response, TaskStatus::Taken)?,
        };
        Ok(Some(Task::from_row(self.clone(), row)))
    }

    /// Confirm completion of a task
    pub fn ack(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Ack, task_id)
    }

    pub(crate) fn release_row(
        &self,
        task_id: &TaskId,
        options: ReleaseOptions,
    ) -> Result<TaskRow, QueueError> {
        if self.protocol() == Protocol::Limited {
            if options != ReleaseOptions::default() {
                debug!(task_id = %task_id, ?options, "Limited protocol release ignores options");
            }
            let response = self.call(
                Verb::Release,
                vec![Arg::from(self.space()), Arg::from(task_id.as_str())],
            )?;
            return TaskRow::parse_limited(Verb::Release, response, TaskStatus::Ready);
        }

        let response = self.call(
            Verb::Release,
            vec![
                Arg::from(self.space()),
                Arg::from(task_id.as_str()),
                Arg::from(options.delay),
                Arg::from(options.ttl),
            ],
        )?;
        TaskRow::parse(Verb::Release, response)
    }

    /// Return a taken task to the queue
    pub fn release(&self, task_id: &TaskId, options: ReleaseOptions) -> Result<Task, QueueError> {
        let row = self.release_row(task_id, options)?;
        Ok(Task::from_row(self.clone(), row))
    }

    /// Put a task back behind every task that is currently ready
    pub fn requeue(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Requeue, task_id)
    }

    pub fn bury(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Bury, task_id)
    }

    pub fn dig(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Dig, task_id)
    }

    /// Delete a task whatever its state
    pub fn delete(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Delete, task_id)
    }

    /// Mark a task done, replacing its payload with `payload`
    pub fn done(&self, task_id: &TaskId, payload: Bytes) -> Result<bool, QueueError> {
        let response = self.call(
            Verb::Done,
            vec![
                Arg::from(self.space()),
                Arg::from(task_id.as_str()),
                Arg::from(payload),
            ],
        )?;
        Ok(response.is_success())
    }

    /// Extend the lease of a taken task
    pub fn touch(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.call_status(Verb::Touch, task_id)
    }

    /// Server metadata for a task; `None` when the server has no such task
    pub fn meta(&self, task_id: &TaskId) -> Result<Option<TaskMeta>, QueueError> {
        let response = self.call(
            Verb::Meta,
            vec![Arg::from(self.space()), Arg::from(task_id.as_str())],
        )?;
        match response.rows.into_iter().next() {
            Some(row) => TaskMeta::parse(row).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch a task without taking it.
    ///
    /// The returned handle never releases on drop: the lease, if any, belongs
    /// to whoever took the task.
    pub fn peek(&self, task_id: &TaskId) -> Result<Task, QueueError> {
        let response = self.call(
            Verb::Peek,
            vec![Arg::from(self.space()), Arg::from(task_id.as_str())],
        )?;
        let row = TaskRow::parse(Verb::Peek, response)?;
        Ok(Task::detached(self.clone(), row))
    }

    /// Dig up `count` buried tasks of `tube`, or one when `count` is `None`
    pub fn kick(&self, tube: &str, count: Option<u32>) -> Result<bool, QueueError> {
        let mut args = vec![Arg::from(self.space()), Arg::from(tube)];
        if let Some(count) = count.filter(|c| *c > 0) {
            args.push(Arg::from(count));
        }
        Ok(self.call(Verb::Kick, args)?.is_success())
    }

    fn fetch_statistics(&self, tube: Option<&str>) -> Result<StatsSnapshot, QueueError> {
        let mut args = vec![Arg::from(self.space())];
        if let Some(tube) = tube {
            args.push(Arg::from(tube));
        }

        let response = self.call(Verb::Statistics, args)?;
        let aggregator = StatsAggregator::new(self.space());
        let snapshot = match response.rows.first() {
            Some(row) => aggregator.aggregate(StatsAggregator::pairs_from_row(row)?)?,
            None => StatsSnapshot::default(),
        };
        Ok(snapshot)
    }

    /// Statistics accumulated since server start for every tube of this space
    pub fn statistics(&self) -> Result<StatsSnapshot, QueueError> {
        self.fetch_statistics(None)
    }

    /// Statistics for one tube; empty when the tube has no activity yet
    pub fn tube_statistics(&self, tube: &str) -> Result<TubeStats, QueueError> {
        Ok(self.fetch_statistics(Some(tube))?.into_tube(tube))
    }
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("space", &self.inner.config.space)
            .field("protocol", &self.inner.config.protocol)
            .field("connected", &self.is_connected())
            .finish()
    }
}
