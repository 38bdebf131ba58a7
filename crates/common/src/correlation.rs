//! Trace correlation carried from capture through delivery.
//!
//! The context is plain data: it is stored with every outbox event, handed to
//! the publisher, and written onto outgoing messages as a W3C `traceparent`
//! header. Nothing here consults a global tracer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header name used to propagate the correlation context on broker messages.
pub const TRACEPARENT_HEADER: &str = "traceparent";

const TRACEPARENT_VERSION: &str = "00";
const SAMPLED_FLAGS: &str = "01";

/// Trace and span identifiers linking an outbox event to the operation
/// that produced it.
///
/// `trace_id` is 32 lowercase hex characters and `span_id` is 16, matching
/// the W3C trace-context encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl CorrelationContext {
    /// Mints a fresh root context with new trace and span ids.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Returns a child context in the same trace, parented on this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// Encodes the context as a W3C `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "{TRACEPARENT_VERSION}-{}-{}-{SAMPLED_FLAGS}",
            self.trace_id, self.span_id
        )
    }

    /// Decodes a W3C `traceparent` header value.
    ///
    /// Returns `None` for anything that is not a well-formed version-00
    /// header with non-zero ids.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != TRACEPARENT_VERSION || flags.len() != 2 {
            return None;
        }
        if !is_hex_id(trace_id, 32) || !is_hex_id(span_id, 16) {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: None,
        })
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new_root()
    }
}

impl std::fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && value.bytes().any(|b| b != b'0')
}
