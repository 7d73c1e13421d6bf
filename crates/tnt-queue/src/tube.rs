//! Tubes: named partitions with default task parameters.
//!
//! A [`TubeConfig`] lives in the client's [`TubeRegistry`] for the lifetime
//! of the client. [`Tube`] is a cheap handle (client plus name) that reads the
//! registry on every call, so option and codec changes made through one
//! handle are visible through all others.

use crate::client::QueueClient;
use crate::connection::{Protocol, Verb};
use crate::error::QueueError;
use crate::serialization::{PayloadDeserializer, PayloadSerializer, SerializationPolicy};
use crate::stats::TubeStats;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "tube_tests.rs"]
mod tests;

// ============================================================================
// Options
// ============================================================================

/// Retry bound sent by a limited-protocol put when the tube sets none
pub const DEFAULT_RETRY: u32 = 5;

/// Tube capacity sent by a limited-protocol put when the tube sets none
pub const DEFAULT_LIMITS: u64 = 500_000;

/// Fully resolved task parameters sent with a put.
///
/// All durations are whole seconds; `0` means "none" for delay and ttl and
/// "server default" for ttr. `retry` and `limits` are only sent under
/// [`Protocol::Limited`](crate::Protocol::Limited).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    pub delay: u64,
    pub ttl: u64,
    pub ttr: u64,
    /// Lower values are served first
    pub pri: u32,
    pub retry: Option<u32>,
    pub limits: Option<u64>,
}

impl TaskOptions {
    /// Retry bound for a limited-protocol put
    pub fn retry_or_default(&self) -> u32 {
        self.retry.unwrap_or(DEFAULT_RETRY)
    }

    /// Tube capacity for a limited-protocol put
    pub fn limits_or_default(&self) -> u64 {
        self.limits.unwrap_or(DEFAULT_LIMITS)
    }
}

/// Partial task parameters. Only the keys that are set take part in a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeOptions {
    pub delay: Option<u64>,
    pub ttl: Option<u64>,
    pub ttr: Option<u64>,
    pub pri: Option<u32>,
    /// Takes allowed after the first before the server buries the task.
    /// Limited protocol only.
    pub retry: Option<u32>,
    /// Most tasks the tube may hold. Limited protocol only.
    pub limits: Option<u64>,
}

impl TubeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn ttr(mut self, seconds: u64) -> Self {
        self.ttr = Some(seconds);
        self
    }

    pub fn pri(mut self, pri: u32) -> Self {
        self.pri = Some(pri);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn limits(mut self, limits: u64) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite the keys set in `other`, keep everything else.
    pub fn merge(&mut self, other: &TubeOptions) {
        if other.delay.is_some() {
            self.delay = other.delay;
        }
        if other.ttl.is_some() {
            self.ttl = other.ttl;
        }
        if other.ttr.is_some() {
            self.ttr = other.ttr;
        }
        if other.pri.is_some() {
            self.pri = other.pri;
        }
        if other.retry.is_some() {
            self.retry = other.retry;
        }
        if other.limits.is_some() {
            self.limits = other.limits;
        }
    }

    /// Apply these options on top of resolved parameters
    pub fn apply_to(&self, base: TaskOptions) -> TaskOptions {
        TaskOptions {
            delay: self.delay.unwrap_or(base.delay),
            ttl: self.ttl.unwrap_or(base.ttl),
            ttr: self.ttr.unwrap_or(base.ttr),
            pri: self.pri.unwrap_or(base.pri),
            retry: self.retry.or(base.retry),
            limits: self.limits.or(base.limits),
        }
    }
}

/// Per-call options for [`Tube::put`]
#[derive(Clone, Default)]
pub struct PutOptions {
    pub overrides: TubeOptions,
    /// Enqueue ahead of every non-urgent ready task, ignoring delay
    pub urgent: bool,
    /// Serializer for this call only
    pub serializer: Option<Arc<dyn PayloadSerializer>>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, seconds: u64) -> Self {
        self.overrides.delay = Some(seconds);
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.overrides.ttl = Some(seconds);
        self
    }

    pub fn ttr(mut self, seconds: u64) -> Self {
        self.overrides.ttr = Some(seconds);
        self
    }

    pub fn pri(mut self, pri: u32) -> Self {
        self.overrides.pri = Some(pri);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.overrides.retry = Some(retry);
        self
    }

    pub fn limits(mut self, limits: u64) -> Self {
        self.overrides.limits = Some(limits);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }
}

impl std::fmt::Debug for PutOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutOptions")
            .field("overrides", &self.overrides)
            .field("urgent", &self.urgent)
            .field("serializer", &self.serializer.is_some())
            .finish()
    }
}

// ============================================================================
// Tube configuration and registry
// ============================================================================

/// Registered state of one tube
#[derive(Debug, Clone)]
pub struct TubeConfig {
    name: String,
    options: TubeOptions,
    codecs: SerializationPolicy,
}

impl TubeConfig {
    pub fn new(name: impl Into<String>, options: TubeOptions) -> Self {
        Self {
            name: name.into(),
            options,
            codecs: SerializationPolicy::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options as configured, including unset keys
    pub fn options(&self) -> &TubeOptions {
        &self.options
    }

    /// Default task parameters with unset keys resolved to zero
    pub fn defaults(&self) -> TaskOptions {
        self.options.apply_to(TaskOptions::default())
    }

    pub fn codecs(&self) -> &SerializationPolicy {
        &self.codecs
    }

    pub fn codecs_mut(&mut self) -> &mut SerializationPolicy {
        &mut self.codecs
    }

    pub fn update_options(&mut self, options: &TubeOptions) {
        self.options.merge(options);
    }

    /// Resolve the RPC verb and parameters for one put.
    ///
    /// Overrides win key by key. Urgent puts always have zero delay.
    pub fn plan_put(&self, put: &PutOptions) -> (Verb, TaskOptions) {
        let mut effective = put.overrides.apply_to(self.defaults());
        if put.urgent {
            effective.delay = 0;
            (Verb::Urgent, effective)
        } else {
            (Verb::Put, effective)
        }
    }
}

/// Owned map of every tube a client has referenced
#[derive(Debug, Default)]
pub struct TubeRegistry {
    tubes: HashMap<String, TubeConfig>,
}

impl TubeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tube, creating it if needed, with `options` merged in.
    ///
    /// Keys missing from `options` keep whatever an earlier call set.
    pub fn get_or_create(&mut self, name: &str, options: &TubeOptions) -> &mut TubeConfig {
        match self.tubes.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if !options.is_empty() {
                    debug!(tube = %name, ?options, "Merging options into registered tube");
                }
                let tube = entry.into_mut();
                tube.update_options(options);
                tube
            }
            Entry::Vacant(entry) => {
                debug!(tube = %name, ?options, "Registering tube");
                entry.insert(TubeConfig::new(name, options.clone()))
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TubeConfig> {
        self.tubes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TubeConfig> {
        self.tubes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tubes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }

    /// Registered tube names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tubes.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// Tube handle
// ============================================================================

/// Handle to one registered tube
#[derive(Clone)]
pub struct Tube {
    client: QueueClient,
    name: String,
}

impl Tube {
    pub(crate) fn new(client: QueueClient, name: String) -> Self {
        Self { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    /// Snapshot of the registered configuration
    pub fn config(&self) -> TubeConfig {
        self.client.tube_config(&self.name)
    }

    /// Merge new default options into this tube
    pub fn update_options(&self, options: &TubeOptions) {
        self.client
            .with_tube_mut(&self.name, |tube| tube.update_options(options));
    }

    /// Set or clear (with `None`) the tube's serializer override
    pub fn set_serializer(&self, serializer: Option<Arc<dyn PayloadSerializer>>) {
        self.client
            .with_tube_mut(&self.name, |tube| tube.codecs_mut().set_serializer(serializer));
    }

    /// Set or clear (with `None`) the tube's deserializer override
    pub fn set_deserializer(&self, deserializer: Option<Arc<dyn PayloadDeserializer>>) {
        self.client.with_tube_mut(&self.name, |tube| {
            tube.codecs_mut().set_deserializer(deserializer)
        });
    }

    /// Enqueue a task.
    ///
    /// With `options.urgent` the task goes ahead of every non-urgent ready
    /// task; among urgent tasks the most recent one is served first.
    pub fn put(&self, payload: &Value, options: &PutOptions) -> Result<Task, QueueError> {
        let config = self.config();
        let (verb, effective) = config.plan_put(options);
        if self.client.protocol() == Protocol::Standard
            && (effective.retry.is_some() || effective.limits.is_some())
        {
            debug!(
                tube = %self.name,
                retry = ?effective.retry,
                limits = ?effective.limits,
                "retry/limits only apply to the limited protocol"
            );
        }

        let serializer = self
            .client
            .resolve_serializer(options.serializer.as_ref(), &config);
        let encoded = serializer.serialize(payload)?;

        self.client.put(&self.name, verb, effective, encoded)
    }

    /// Serialize a typed value to JSON and enqueue it
    pub fn put_typed<T: Serialize>(
        &self,
        payload: &T,
        options: &PutOptions,
    ) -> Result<Task, QueueError> {
        let value = serde_json::to_value(payload).map_err(crate::SerializationError::from)?;
        self.put(&value, options)
    }

    /// Same as [`Tube::put`] with `urgent` set
    pub fn urgent(&self, payload: &Value, options: &PutOptions) -> Result<Task, QueueError> {
        let options = options.clone().urgent();
        self.put(payload, &options)
    }

    /// Take the highest-priority ready task.
    ///
    /// `Some(Duration::ZERO)` polls once, `Some(d)` waits up to `d`, `None`
    /// waits until a task becomes ready. Returns `None` when the wait ends
    /// without a task.
    pub fn take(&self, timeout: Option<Duration>) -> Result<Option<Task>, QueueError> {
        self.client.take(&self.name, timeout)
    }

    /// Dig up `count` buried tasks, or one when `count` is `None`
    pub fn kick(&self, count: Option<u32>) -> Result<bool, QueueError> {
        self.client.kick(&self.name, count)
    }

    /// Statistics for this tube only
    pub fn statistics(&self) -> Result<TubeStats, QueueError> {
        self.client.tube_statistics(&self.name)
    }
}

impl std::fmt::Debug for Tube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tube")
            .field("name", &self.name)
            .field("space", &self.client.space())
            .finish()
    }
}
