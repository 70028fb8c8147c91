//! Outcome of a downstream integration call.
//!
//! [`ProcessingOutcome`] is what the processing logger records. The typed
//! struct is produced by the integration client; results that arrive as raw
//! JSON go through [`ProcessingOutcome::from_value`], which enforces the
//! same shape before anything reaches the backend.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    models::ProcessingStatus,
};

/// Message recorded for failed outcomes that carry no error text.
pub const UNKNOWN_ERROR: &str = "Unknown error";

const REQUIRED_KEYS: [&str; 5] = ["status", "status_code", "data", "error", "response_headers"];

/// Whether a downstream call succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// The call returned a 2xx response.
    Success,
    /// The call failed or returned a non-2xx response.
    Error,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Full outcome of a downstream call, stored verbatim as the log result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    /// Success or error.
    pub status: CallStatus,

    /// HTTP status; `None` when no response was received.
    pub status_code: Option<u16>,

    /// Parsed response body.
    pub data: Option<Value>,

    /// Error description for failed calls.
    pub error: Option<String>,

    /// Response headers.
    pub response_headers: Option<HashMap<String, String>>,
}

impl ProcessingOutcome {
    /// Creates a successful outcome.
    pub fn success(status_code: u16, data: Option<Value>) -> Self {
        Self {
            status: CallStatus::Success,
            status_code: Some(status_code),
            data,
            error: None,
            response_headers: None,
        }
    }

    /// Creates a failed outcome.
    pub fn failure(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Error,
            status_code,
            data: None,
            error: Some(error.into()),
            response_headers: None,
        }
    }

    /// Attaches response headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.response_headers = Some(headers);
        self
    }

    /// Attaches a response body.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }

    /// Maps the outcome to the stored processing status.
    pub fn processing_status(&self) -> ProcessingStatus {
        match self.status {
            CallStatus::Success => ProcessingStatus::Success,
            CallStatus::Error => ProcessingStatus::Failed,
        }
    }

    /// Error text recorded with the log: `None` on success, the outcome's
    /// error or [`UNKNOWN_ERROR`] on failure.
    pub fn result_error(&self) -> Option<String> {
        match self.status {
            CallStatus::Success => None,
            CallStatus::Error => {
                Some(self.error.clone().unwrap_or_else(|| UNKNOWN_ERROR.to_string()))
            },
        }
    }

    /// Serializes the outcome for the log's result column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the outcome cannot be represented as
    /// JSON.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| {
            Error::validation(format!("Invalid api_call_result: cannot be converted to JSON - {e}"))
        })
    }

    /// Parses a raw call result, checking its shape strictly.
    ///
    /// Every one of `status`, `status_code`, `data`, `error` and
    /// `response_headers` must be present (null is allowed where the field
    /// is optional). `status` must be `"success"` or `"error"` and
    /// `status_code` an integer or null.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` describing the first violation found.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::validation("Invalid api_call_result: must be a JSON object"));
        };

        let missing: Vec<&str> =
            REQUIRED_KEYS.iter().copied().filter(|key| !object.contains_key(*key)).collect();
        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "Invalid api_call_result: missing required keys: {missing:?}"
            )));
        }

        let status = match object.get("status").and_then(Value::as_str) {
            Some("success") => CallStatus::Success,
            Some("error") => CallStatus::Error,
            _ => {
                return Err(Error::validation(format!(
                    "Invalid api_call_result.status: must be 'success' or 'error', got {}",
                    object.get("status").unwrap_or(&Value::Null)
                )));
            },
        };

        let status_code = match object.get("status_code") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => {
                let code = n.as_u64().and_then(|code| u16::try_from(code).ok()).ok_or_else(|| {
                    Error::validation(format!(
                        "Invalid api_call_result.status_code: must be int or None, got {n}"
                    ))
                })?;
                Some(code)
            },
            Some(other) => {
                return Err(Error::validation(format!(
                    "Invalid api_call_result.status_code: must be int or None, got {}",
                    json_type(other)
                )));
            },
        };

        let error = match object.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        };

        let response_headers = match object.get("response_headers") {
            None | Some(Value::Null) => None,
            Some(Value::Object(headers)) => Some(string_map(headers)),
            Some(other) => {
                return Err(Error::validation(format!(
                    "Invalid api_call_result.response_headers: must be an object or None, got {}",
                    json_type(other)
                )));
            },
        };

        let data = object.get("data").filter(|data| !data.is_null()).cloned();

        Ok(Self { status, status_code, data, error, response_headers })
    }
}

/// Where a downstream call was sent, recorded alongside its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Target URL.
    pub url: Option<String>,
    /// HTTP method.
    pub method: Option<String>,
    /// Request body.
    pub payload: Option<Value>,
}

impl Provenance {
    /// Creates provenance for a call to `url` with `method`.
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self { url: Some(url.into()), method: Some(method.into()), payload: None }
    }

    /// Attaches the request body.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

fn string_map(headers: &Map<String, Value>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    fn raw(status: &str) -> Value {
        json!({
            "status": status,
            "status_code": 200,
            "data": {"ok": true},
            "error": null,
            "response_headers": {"content-type": "application/json"}
        })
    }

    #[test]
    fn parses_well_formed_result() {
        let outcome = ProcessingOutcome::from_value(&raw("success")).unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(outcome.data, Some(json!({"ok": true})));
        assert_eq!(
            outcome.response_headers.unwrap().get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn missing_keys_are_listed() {
        let err = ProcessingOutcome::from_value(&json!({"status": "success"})).unwrap_err();

        assert!(err.is_validation());
        let message = err.to_string();
        assert!(message.contains("missing required keys"));
        assert!(message.contains("status_code"));
        assert!(message.contains("response_headers"));
    }

    #[test]
    fn rejects_unknown_status() {
        let err = ProcessingOutcome::from_value(&raw("pending")).unwrap_err();
        assert!(err.to_string().contains("must be 'success' or 'error'"));
    }

    #[test]
    fn rejects_non_integer_status_code() {
        let mut value = raw("error");
        value["status_code"] = json!("500");

        let err = ProcessingOutcome::from_value(&value).unwrap_err();
        assert!(err.to_string().contains("got str"));

        value["status_code"] = json!(2.5);
        assert!(ProcessingOutcome::from_value(&value).is_err());
    }

    #[test]
    fn null_status_code_is_allowed() {
        let mut value = raw("error");
        value["status_code"] = Value::Null;
        value["error"] = json!("Connection error to http://x: refused");

        let outcome = ProcessingOutcome::from_value(&value).unwrap();
        assert_eq!(outcome.status_code, None);
        assert_eq!(outcome.processing_status(), ProcessingStatus::Failed);
    }

    #[test]
    fn failed_outcome_without_message_gets_placeholder() {
        let outcome = ProcessingOutcome {
            status: CallStatus::Error,
            status_code: Some(500),
            data: None,
            error: None,
            response_headers: None,
        };

        assert_eq!(outcome.result_error().as_deref(), Some(UNKNOWN_ERROR));
        assert_eq!(ProcessingOutcome::success(200, None).result_error(), None);
    }

    #[test]
    fn serialized_form_keeps_all_keys() {
        let value = ProcessingOutcome::failure(Some(404), "HTTP 404: Not Found").to_value().unwrap();

        assert_eq!(value["status"], "error");
        assert_eq!(value["status_code"], 404);
        assert_eq!(value["error"], "HTTP 404: Not Found");
        assert!(value.get("data").unwrap().is_null());
        assert!(value.get("response_headers").unwrap().is_null());

        let reparsed = ProcessingOutcome::from_value(&value).unwrap();
        assert_eq!(reparsed.status, CallStatus::Error);
    }
}
