//! # tnt-queue
//!
//! Client for a remote task queue hosted by a Tarantool-style server.
//!
//! Producers put tasks into named tubes. Consumers take them under a lease,
//! then dispose of them: ack, release, requeue, bury, delete or done. The
//! library provides:
//! - Lazy, single-instance connection management behind a pluggable transport
//! - Per-tube default task options merged across repeated references
//! - Layered payload codecs (call, tube, queue, built-in JSON)
//! - Task handles that release their lease when dropped undisposed
//! - Per-tube statistics rebuilt from the server's flat counter namespace
//! - The standard and the limited (`box.queue.*`) procedure families
//! - An in-memory server for tests and local development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`connection`] - Verbs, arguments, responses and the connection traits
//! - [`serialization`] - Payload codecs and override resolution
//! - [`settings`] - Client configuration and loading
//! - [`tube`] - Tube options, registry and handles
//! - [`task`] - Task handles, identifiers and metadata
//! - [`client`] - The queue client and its RPC primitives
//! - [`stats`] - Statistics aggregation
//! - [`providers`] - Connection providers

pub mod client;
pub mod connection;
pub mod error;
pub mod providers;
pub mod serialization;
pub mod settings;
pub mod stats;
pub mod task;
pub mod tube;

pub use client::QueueClient;
pub use connection::{
    Arg, CallResponse, ConnectParams, Connection, ConnectionFactory, Field, Protocol, Row, Verb,
    SUCCESS_CODE,
};
pub use error::{ConfigurationError, QueueError, SerializationError, StatsParseError};
pub use providers::{InMemoryConnection, InMemoryServer};
pub use serialization::{JsonCodec, PayloadDeserializer, PayloadSerializer, SerializationPolicy};
pub use settings::QueueClientConfig;
pub use stats::{StatsAggregator, StatsSnapshot, TubeStats};
pub use task::{LeaseObserver, ReleaseOptions, Task, TaskId, TaskMeta, TaskStatus};
pub use tube::{PutOptions, TaskOptions, Tube, TubeConfig, TubeOptions, TubeRegistry};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
