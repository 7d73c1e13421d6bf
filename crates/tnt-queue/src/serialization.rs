//! Payload serialization and the override chain that selects a codec.
//!
//! Payloads travel as opaque bytes. The client turns [`serde_json::Value`]s
//! into bytes with a [`PayloadSerializer`] and back with a
//! [`PayloadDeserializer`]. Both may be overridden at three levels, checked
//! in this order:
//!
//! 1. the individual call or task
//! 2. the tube
//! 3. the queue client
//!
//! When no level sets an override the built-in [`JsonCodec`] is used.

use crate::error::SerializationError;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

#[cfg(test)]
#[path = "serialization_tests.rs"]
mod tests;

/// Encodes payload values into bytes
pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError>;
}

/// Decodes payload bytes into values
pub trait PayloadDeserializer: Send + Sync {
    fn deserialize(&self, raw: &[u8]) -> Result<Value, SerializationError>;
}

impl<F> PayloadSerializer for F
where
    F: Fn(&Value) -> Result<Bytes, SerializationError> + Send + Sync,
{
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        self(value)
    }
}

impl<F> PayloadDeserializer for F
where
    F: Fn(&[u8]) -> Result<Value, SerializationError> + Send + Sync,
{
    fn deserialize(&self, raw: &[u8]) -> Result<Value, SerializationError> {
        self(raw)
    }
}

/// Built-in codec storing payloads as JSON documents
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadSerializer for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl PayloadDeserializer for JsonCodec {
    fn deserialize(&self, raw: &[u8]) -> Result<Value, SerializationError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Optional serializer/deserializer overrides held by one level of the chain.
///
/// `None` means "not set here"; resolution then falls through to the next
/// level.
#[derive(Clone, Default)]
pub struct SerializationPolicy {
    serializer: Option<Arc<dyn PayloadSerializer>>,
    deserializer: Option<Arc<dyn PayloadDeserializer>>,
}

impl SerializationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serializer(&self) -> Option<&Arc<dyn PayloadSerializer>> {
        self.serializer.as_ref()
    }

    pub fn deserializer(&self) -> Option<&Arc<dyn PayloadDeserializer>> {
        self.deserializer.as_ref()
    }

    /// Set or clear (with `None`) the serializer override
    pub fn set_serializer(&mut self, serializer: Option<Arc<dyn PayloadSerializer>>) {
        self.serializer = serializer;
    }

    /// Set or clear (with `None`) the deserializer override
    pub fn set_deserializer(&mut self, deserializer: Option<Arc<dyn PayloadDeserializer>>) {
        self.deserializer = deserializer;
    }

    /// Pick the serializer for one call: call > tube > queue > built-in.
    pub fn resolve_serializer(
        call: Option<&Arc<dyn PayloadSerializer>>,
        tube: &SerializationPolicy,
        queue: &SerializationPolicy,
    ) -> Arc<dyn PayloadSerializer> {
        call.or(tube.serializer())
            .or(queue.serializer())
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonCodec))
    }

    /// Pick the deserializer for one task: task > tube > queue > built-in.
    pub fn resolve_deserializer(
        task: Option<&Arc<dyn PayloadDeserializer>>,
        tube: &SerializationPolicy,
        queue: &SerializationPolicy,
    ) -> Arc<dyn PayloadDeserializer> {
        task.or(tube.deserializer())
            .or(queue.deserializer())
            .cloned()
            .unwrap_or_else(|| Arc::new(JsonCodec))
    }
}

impl std::fmt::Debug for SerializationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationPolicy")
            .field("serializer", &self.serializer.is_some())
            .field("deserializer", &self.deserializer.is_some())
            .finish()
    }
}
