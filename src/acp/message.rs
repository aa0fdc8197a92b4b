//! JSON-RPC message model for the ACP wire format.
//!
//! Every line on the wire decodes into exactly one [`Message`]. Classification
//! follows the shape of the object rather than a `jsonrpc` version tag:
//!
//! | `id` | `method` | `result`/`error` | Kind                       |
//! |------|----------|------------------|----------------------------|
//! | yes  | yes      | -                | [`Message::Call`]          |
//! | yes  | no       | yes              | [`Message::Response`]      |
//! | no   | yes      | -                | [`Message::Notification`]  |
//! | *anything else*                    || `AppError::TransportParse` |

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// JSON-RPC error code: the method does not exist or is not supported.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code: internal error while handling a call.
pub const INTERNAL_ERROR: i64 = -32603;

/// Correlation token carried by calls and responses.
///
/// Calls issued by this side always use [`RequestId::Number`]; the agent may
/// use either form for its own calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// Unsigned integer identifier.
    Number(u64),
    /// String identifier.
    Str(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Structured error object carried by a failed [`Message::Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error without structured data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The `-32601` reply sent for inbound calls nobody handles.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not supported: {method}"))
    }
}

/// One decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request that expects a response.
    Call {
        /// Correlation token.
        id: RequestId,
        /// Method name.
        method: String,
        /// Method parameters (`Value::Null` when absent).
        params: Value,
    },
    /// The answer to an earlier call.
    Response {
        /// Correlation token of the call being answered.
        id: RequestId,
        /// Result value or structured error.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// A fire-and-forget message.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters (`Value::Null` when absent).
        params: Value,
    },
}

impl Message {
    /// Parse one line of text into a classified [`Message`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportParse`] if the line is not JSON or the
    /// object does not have the shape of a call, response, or notification.
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AppError::TransportParse(format!("malformed json: {e}")))?;
        Self::classify(value)
    }

    /// Classify an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportParse`] for any shape other than the three
    /// message kinds.
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(AppError::TransportParse(
                "unclassifiable message: not a json object".into(),
            ));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(RequestId::from_value(&raw).ok_or_else(|| {
                AppError::TransportParse(format!("unclassifiable message: invalid id {raw}"))
            })?),
        };
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(other) => {
                return Err(AppError::TransportParse(format!(
                    "unclassifiable message: method is not a string: {other}"
                )))
            }
        };
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Call { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                if let Some(raw) = obj.remove("error") {
                    let err: RpcError = serde_json::from_value(raw).map_err(|e| {
                        AppError::TransportParse(format!("malformed error object: {e}"))
                    })?;
                    Ok(Self::Response { id, outcome: Err(err) })
                } else if let Some(result) = obj.remove("result") {
                    Ok(Self::Response { id, outcome: Ok(result) })
                } else {
                    Err(AppError::TransportParse(format!(
                        "unclassifiable message: id {id} without method, result, or error"
                    )))
                }
            }
            (None, None) => Err(AppError::TransportParse(
                "unclassifiable message: neither id nor method".into(),
            )),
        }
    }

    /// Method name for calls and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Call { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Render the message as a JSON-RPC 2.0 object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from("2.0"));
        match self {
            Self::Call { id, method, params } => {
                obj.insert("id".into(), id.to_value());
                obj.insert("method".into(), Value::from(method.as_str()));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), id.to_value());
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(err) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(err).unwrap_or(Value::Null),
                        );
                    }
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }
}
