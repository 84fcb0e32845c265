//! Commands and the envelope that carries them across the queue.
//!
//! A [`Command`] is a typed request to change state. Before it reaches the
//! broker it is sealed into a [`CommandEnvelope`]: the command type, the
//! payload schema version, the JSON payload and a correlation id that stays
//! stable across every redelivery. Envelopes are immutable; every field is
//! private and only exposed through getters.
//!
//! On the wire an envelope is UTF-8 JSON with camelCase field names. Unknown
//! fields are ignored so that older consumers keep working when producers add
//! fields.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;
use crate::types::{CommandType, CorrelationId, SchemaVersion};

/// A request to change system state, routed to exactly one handler.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct AddComponent { product_name: String, sn: String }
///
/// impl Command for AddComponent {
///     const COMMAND_TYPE: &'static str = "AddComponent";
///     const FAMILY: &'static str = "composent";
/// }
/// ```
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used to resolve the handler.
    const COMMAND_TYPE: &'static str;

    /// Command family; determines the queue (`<system>.<family>.commands`).
    const FAMILY: &'static str;

    /// Current payload schema version.
    const SCHEMA_VERSION: u16 = 1;

    /// Producer-side validation of required fields.
    ///
    /// The publisher refuses to enqueue a command that fails validation.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Correlation id supplied by the producer, if any.
    fn correlation_id(&self) -> Option<CorrelationId> {
        None
    }

    /// The command type as a validated value.
    fn command_type() -> Result<CommandType, EnvelopeError> {
        CommandType::try_new(Self::COMMAND_TYPE).map_err(|error| EnvelopeError::SerializationFailed {
            command_type: Self::COMMAND_TYPE.to_string(),
            detail: error.to_string(),
        })
    }

    /// The schema version as a validated value.
    fn schema_version() -> SchemaVersion {
        SchemaVersion::try_new(Self::SCHEMA_VERSION).unwrap_or_default()
    }
}

/// The serialized, queue-transported representation of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    command_type: CommandType,
    #[serde(default)]
    schema_version: SchemaVersion,
    payload: Value,
    correlation_id: CorrelationId,
    published_at: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Seals a command into an envelope.
    pub fn seal<C: Command>(
        command: &C,
        correlation_id: CorrelationId,
    ) -> Result<Self, EnvelopeError> {
        let payload =
            serde_json::to_value(command).map_err(|error| EnvelopeError::SerializationFailed {
                command_type: C::COMMAND_TYPE.to_string(),
                detail: error.to_string(),
            })?;

        Ok(Self {
            command_type: C::command_type()?,
            schema_version: C::schema_version(),
            payload,
            correlation_id,
            published_at: Utc::now(),
        })
    }

    /// Builds an envelope from raw parts.
    ///
    /// Used by producers that relay already-serialized payloads and by tests.
    pub fn from_parts(
        command_type: CommandType,
        schema_version: SchemaVersion,
        payload: Value,
        correlation_id: CorrelationId,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_type,
            schema_version,
            payload,
            correlation_id,
            published_at,
        }
    }

    /// Parses an envelope from a message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        let text =
            std::str::from_utf8(body).map_err(|error| EnvelopeError::InvalidUtf8(error.to_string()))?;
        serde_json::from_str(text).map_err(|error| EnvelopeError::Malformed(error.to_string()))
    }

    /// Serializes the envelope into a UTF-8 JSON message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|error| EnvelopeError::SerializationFailed {
            command_type: self.command_type.to_string(),
            detail: error.to_string(),
        })
    }

    /// Decodes the payload into the typed command.
    ///
    /// Fails when the envelope carries a schema version newer than `C`
    /// understands or when the payload does not match `C`'s shape.
    pub fn decode<C: Command>(&self) -> Result<C, EnvelopeError> {
        let supported = C::schema_version();
        if self.schema_version > supported {
            return Err(EnvelopeError::UnsupportedSchemaVersion {
                command_type: self.command_type.clone(),
                found: self.schema_version,
                supported,
            });
        }

        C::deserialize(&self.payload).map_err(|error| EnvelopeError::PayloadMismatch {
            command_type: self.command_type.clone(),
            detail: error.to_string(),
        })
    }

    /// The command type.
    pub const fn command_type(&self) -> &CommandType {
        &self.command_type
    }

    /// The payload schema version.
    pub const fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    /// The raw payload.
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// The correlation id.
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// When the envelope was published.
    pub const fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}
