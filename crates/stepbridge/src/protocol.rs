//! Line protocol spoken between the core and worker processes.
//!
//! The worker receives one [`Invocation`] as a command-line argument and
//! answers on stdout with newline-delimited JSON messages:
//!
//! ```text
//! {"kind":"emit","type":"order.created","data":{...}}
//! {"kind":"log","level":"warn","message":"..."}
//! {"kind":"result","data":{...}}
//! ```
//!
//! `result` and `error` are terminal. A line without `kind` but with a string
//! `type` is read as an emit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Payload handed to a worker for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub step_id: String,
    pub trace_id: String,
    pub flows: BTreeSet<String>,
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Emit { event_type: String, data: Value },
    Log { level: String, message: String },
    Result(Value),
    Error(String),
}

impl WireMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WireMessage::Result(_) | WireMessage::Error(_))
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        if object.contains_key("kind") {
            let tagged: Tagged =
                serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
            return Ok(tagged.into());
        }

        match object.get("type") {
            Some(Value::String(event_type)) => Ok(WireMessage::Emit {
                event_type: event_type.clone(),
                data: object.get("data").cloned().unwrap_or(Value::Null),
            }),
            _ => Err(ProtocolError::Unrecognized),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Tagged {
    Emit {
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        data: Value,
    },
    Log {
        #[serde(default = "default_level")]
        level: String,
        message: String,
    },
    Result {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
    },
}

fn default_level() -> String {
    "info".to_string()
}

impl From<Tagged> for WireMessage {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Emit { event_type, data } => WireMessage::Emit { event_type, data },
            Tagged::Log { level, message } => WireMessage::Log { level, message },
            Tagged::Result { data } => WireMessage::Result(data),
            Tagged::Error { message } => WireMessage::Error(message),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("line is not JSON: {0}")]
    NotJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("message has neither `kind` nor a string `type`")]
    Unrecognized,
}
