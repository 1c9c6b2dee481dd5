//! Command response envelope.

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Response envelope returned for every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Envelope version
    pub protocol_version: u32,
    /// Request ID echoed from the request
    pub request_id: String,
    /// Command name echoed from the request
    pub command: String,
    /// Whether the command succeeded
    pub ok: bool,
    /// Success payload (present when ok=true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error details (present when ok=false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandResponse {
    /// Create a success response.
    pub fn success(request_id: String, command: &str, result: serde_json::Value) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            request_id,
            command: command.to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(request_id: String, command: &str, error: CommandError) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            request_id,
            command: command.to_string(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Process exit code for CLI front-ends: 0 ok, 1 rejected, 2 unrecoverable.
    pub fn exit_code(&self) -> i32 {
        match &self.error {
            None => 0,
            Some(e) if e.is_unrecoverable() => 2,
            Some(_) => 1,
        }
    }
}
