//! Connection providers.
//!
//! Network transports are supplied by the application through
//! [`crate::ConnectionFactory`]. This module carries the in-process server
//! used for testing and local development.

pub mod memory;

pub use memory::{InMemoryConnection, InMemoryServer};
