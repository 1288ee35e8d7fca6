//! Message envelope.
//!
//! Every message body is a `{data, meta}` object. `data` is opaque to the
//! engine; `meta` carries routing, fan-out tracking and failure diagnostics.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::handler::HandlerError;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A queue message: payload plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Application payload. Opaque to the engine.
    pub data: serde_json::Value,
    pub meta: Meta,
}

/// Metadata carried alongside every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Queue whose handler processes this message. Immutable after creation.
    pub queue_name: String,

    /// Groups an originating unit of work with everything it fanned out into.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opaque_id"
    )]
    pub correlation_id: Option<String>,

    /// Subject being acted upon. Audit trail only; handlers never look data up by it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opaque_id"
    )]
    pub target_id: Option<String>,

    /// Payload shape version, used by handlers to pick a decoding path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    /// Most recent failure message.
    #[serde(default, alias = "error_message", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Most recent failure trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,

    /// Queue the parent unit of work was consumed from, when the producer
    /// recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_queue: Option<String>,

    /// Delivery attempt about to happen (1 on first delivery). Never decreases.
    #[serde(default = "first_attempt")]
    pub attempt: u32,

    /// Fields this version does not know about, carried through retries untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn first_attempt() -> u32 {
    1
}

/// Integer or semantic version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    Number(u64),
    Tag(String),
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{n}"),
            Version::Tag(t) => write!(f, "{t}"),
        }
    }
}

impl From<u64> for Version {
    fn from(n: u64) -> Self {
        Version::Number(n)
    }
}

impl From<&str> for Version {
    fn from(tag: &str) -> Self {
        Version::Tag(tag.to_string())
    }
}

/// Accept string or numeric ids; older producers wrote integer correlation ids.
fn opaque_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("meta.queue_name must not be empty")]
    EmptyQueueName,
}

impl Envelope {
    /// Build a first-attempt envelope for `queue_name`.
    ///
    /// Nothing is checked here. A null `data` or empty `queue_name` builds an
    /// envelope that [`Envelope::parse`] rejects and backends refuse to
    /// enqueue; use [`Envelope::try_new`] for untrusted input.
    pub fn new(queue_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data,
            meta: Meta {
                queue_name: queue_name.into(),
                correlation_id: None,
                target_id: None,
                version: None,
                error: None,
                stack_trace: None,
                correlation_queue: None,
                attempt: first_attempt(),
                extra: serde_json::Map::new(),
            },
        }
    }

    /// Like [`Envelope::new`], but fails the way decoding would.
    pub fn try_new(
        queue_name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<Self, DecodeError> {
        let envelope = Self::new(queue_name, data);
        envelope.check()?;
        Ok(envelope)
    }

    /// Check the invariants [`Envelope::from_value`] enforces.
    pub fn check(&self) -> Result<(), DecodeError> {
        if self.data.is_null() {
            return Err(DecodeError::MissingField("data"));
        }
        if self.meta.queue_name.is_empty() {
            return Err(DecodeError::EmptyQueueName);
        }
        Ok(())
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(id.into());
        self
    }

    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.meta.target_id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<Version>) -> Self {
        self.meta.version = Some(version.into());
        self
    }

    /// Parse a raw message body.
    pub fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        Self::from_value(value)
    }

    /// Validate and convert an already-decoded JSON body.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        let obj = value.as_object().ok_or(DecodeError::MissingField("data"))?;
        if obj.get("data").is_none_or(|d| d.is_null()) {
            return Err(DecodeError::MissingField("data"));
        }
        let Some(meta) = obj.get("meta").and_then(|m| m.as_object()) else {
            return Err(DecodeError::MissingField("meta"));
        };
        match meta.get("queue_name") {
            None | Some(serde_json::Value::Null) => {
                return Err(DecodeError::MissingField("meta.queue_name"));
            }
            Some(serde_json::Value::String(s)) if s.is_empty() => {
                return Err(DecodeError::EmptyQueueName);
            }
            _ => {}
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn serialize(&self) -> Vec<u8> {
        // Envelope contains only JSON-native types; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode `data` into a typed payload. Malformed data can never succeed,
    /// so the failure is fatal.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| HandlerError::fatal(format!("cannot decode data: {e}")))
    }

    /// Record a failed attempt before re-enqueue or dead-letter.
    pub(crate) fn annotate_failure(&mut self, error: &HandlerError) {
        self.meta.error = Some(error.message.clone());
        self.meta.stack_trace = error.trace.clone();
    }
}
