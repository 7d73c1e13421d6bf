//! Connection contract between the client and the remote queue server.
//!
//! The client never speaks a wire protocol itself. It issues one stored
//! procedure call per operation through a [`Connection`] and interprets the
//! [`CallResponse`]. Connections are produced by a [`ConnectionFactory`],
//! which lets tests and development setups plug in the in-memory server.
//!
//! Two procedure families exist. [`Protocol::Standard`] is the full
//! `queue.<verb>` set. [`Protocol::Limited`] is the older `box.queue.<verb>`
//! set: put, take, ack, release and delete only, with per-tube retry and
//! capacity bounds on put and 64-bit task ids.

use crate::error::QueueError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Return code the server uses to signal success.
pub const SUCCESS_CODE: u32 = 0;

// ============================================================================
// Verbs
// ============================================================================

/// Remote procedures exposed by the queue server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Put,
    Urgent,
    Take,
    Ack,
    Release,
    Requeue,
    Bury,
    Dig,
    Delete,
    Done,
    Meta,
    Touch,
    Peek,
    Kick,
    Statistics,
}

impl Verb {
    /// Every verb the client may issue.
    pub const ALL: [Verb; 15] = [
        Verb::Put,
        Verb::Urgent,
        Verb::Take,
        Verb::Ack,
        Verb::Release,
        Verb::Requeue,
        Verb::Bury,
        Verb::Dig,
        Verb::Delete,
        Verb::Done,
        Verb::Meta,
        Verb::Touch,
        Verb::Peek,
        Verb::Kick,
        Verb::Statistics,
    ];

    /// Short verb name, also used as the statistics counter name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Urgent => "urgent",
            Self::Take => "take",
            Self::Ack => "ack",
            Self::Release => "release",
            Self::Requeue => "requeue",
            Self::Bury => "bury",
            Self::Dig => "dig",
            Self::Delete => "delete",
            Self::Done => "done",
            Self::Meta => "meta",
            Self::Touch => "touch",
            Self::Peek => "peek",
            Self::Kick => "kick",
            Self::Statistics => "statistics",
        }
    }

    /// Stored procedure name under the standard protocol
    pub fn procedure(&self) -> String {
        Protocol::Standard.procedure(*self)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Protocol variants
// ============================================================================

/// Stored-procedure family spoken by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Standard,
    Limited,
}

impl Protocol {
    /// Verbs of the limited procedure family
    pub const LIMITED_VERBS: [Verb; 5] = [
        Verb::Put,
        Verb::Take,
        Verb::Ack,
        Verb::Release,
        Verb::Delete,
    ];

    /// Every verb this protocol defines
    pub fn verbs(&self) -> &'static [Verb] {
        match self {
            Self::Standard => &Verb::ALL,
            Self::Limited => &Self::LIMITED_VERBS,
        }
    }

    pub fn defines(&self, verb: Verb) -> bool {
        self.verbs().contains(&verb)
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Standard => "queue",
            Self::Limited => "box.queue",
        }
    }

    /// Fully qualified stored procedure name for `verb`
    pub fn procedure(&self, verb: Verb) -> String {
        format!("{}.{}", self.namespace(), verb.as_str())
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Limited => write!(f, "limited"),
        }
    }
}

// ============================================================================
// Arguments and responses
// ============================================================================

/// A positional call argument, encoded with the transport's native types
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
}

impl Arg {
    /// Unsigned integer value, if this argument holds one
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(value) => Some(*value),
            _ => None,
        }
    }

    /// Floating point value; integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::UInt(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Text value, if this argument holds one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Raw bytes; text arguments are returned as their UTF-8 bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value),
            Self::Str(value) => Some(value.as_bytes()),
            _ => None,
        }
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// A single raw field of a response row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field(Bytes);

impl Field {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encode a signed 64-bit integer as 8 little-endian bytes
    pub fn from_i64(value: i64) -> Self {
        Self(Bytes::copy_from_slice(&value.to_le_bytes()))
    }

    /// Encode a signed 32-bit integer as 4 little-endian bytes
    pub fn from_i32(value: i32) -> Self {
        Self(Bytes::copy_from_slice(&value.to_le_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field as UTF-8 text
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Decode a fixed-width little-endian signed 64-bit integer
    pub fn as_i64_le(&self) -> Option<i64> {
        let raw: [u8; 8] = self.0.as_ref().try_into().ok()?;
        Some(i64::from_le_bytes(raw))
    }

    /// Decode a fixed-width little-endian signed 32-bit integer
    pub fn as_i32_le(&self) -> Option<i32> {
        let raw: [u8; 4] = self.0.as_ref().try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for Field {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

/// One response tuple
pub type Row = Vec<Field>;

/// Result of one remote call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallResponse {
    pub return_code: u32,
    pub rows: Vec<Row>,
}

impl CallResponse {
    /// Successful response carrying the given rows
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            return_code: SUCCESS_CODE,
            rows,
        }
    }

    /// Response with no rows and the given return code
    pub fn status(return_code: u32) -> Self {
        Self {
            return_code,
            rows: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.return_code == SUCCESS_CODE
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

// ============================================================================
// Connection traits
// ============================================================================

/// Parameters handed to a [`ConnectionFactory`] unmodified
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    /// Opaque schema value passed through to the connection
    pub schema: Option<serde_json::Value>,
    /// Procedure family the connection must call
    pub protocol: Protocol,
}

/// An open connection to the queue server.
///
/// Calls are blocking: they return once the server answers or the
/// connection's own timeout elapses. Transport failures must be reported as
/// [`QueueError::Transport`] so they propagate to the caller unchanged.
/// A connection maps each verb to the procedure name of the
/// [`ConnectParams::protocol`] it was opened with.
pub trait Connection: Send + Sync {
    /// Issue one remote call
    fn call(&self, verb: Verb, args: &[Arg]) -> Result<CallResponse, QueueError>;

    /// Report whether this connection can issue the given verb
    fn supports(&self, _verb: Verb) -> bool {
        true
    }
}

/// Produces connections for a [`crate::QueueClient`]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>, QueueError>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&ConnectParams) -> Result<Arc<dyn Connection>, QueueError> + Send + Sync,
{
    fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>, QueueError> {
        self(params)
    }
}

/// Check a freshly opened connection against every verb of `protocol`.
pub(crate) fn verify_capabilities(
    connection: &dyn Connection,
    protocol: Protocol,
) -> Result<(), QueueError> {
    match protocol.verbs().iter().find(|verb| !connection.supports(**verb)) {
        Some(verb) => Err(QueueError::Capability {
            capability: protocol.procedure(*verb),
        }),
        None => Ok(()),
    }
}
