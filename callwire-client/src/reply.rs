use callwire_core::{Fault, Headers, Message, Outcome};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Why a call produced no usable result.
///
/// Faults are listed so [`Reply::into_result`] can fold them in; everything
/// else is a transport-class failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication required for realm {0:?}")]
    AuthenticationRequired(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{}", .0.fault_as_string())]
    Fault(Fault),

    #[error("call cancelled")]
    Cancelled,
}

/// The result of one call.
///
/// The default value is what a pending call reports before it finishes:
/// a null value, no fault, no error and no headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    value: Value,
    fault: Option<Fault>,
    error: Option<CallError>,
    headers: Headers,
}

impl Reply {
    pub fn from_value(value: Value, headers: Headers) -> Self {
        Reply {
            value,
            headers,
            ..Default::default()
        }
    }

    pub fn from_fault(fault: Fault, headers: Headers) -> Self {
        Reply {
            fault: Some(fault),
            headers,
            ..Default::default()
        }
    }

    pub fn from_error(error: CallError) -> Self {
        Reply {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Build a reply from a response message. Any other message kind is a
    /// protocol error.
    pub fn from_message(message: Message) -> Self {
        match message {
            Message::Response {
                outcome: Outcome::Success { value },
                headers,
                ..
            } => Reply::from_value(value, headers),
            Message::Response {
                outcome: Outcome::Fault { fault },
                headers,
                ..
            } => Reply::from_fault(fault, headers),
            Message::Request { id, .. } | Message::AuthChallenge { id, .. } => Reply::from_error(
                CallError::Protocol(format!("expected a response for {id}")),
            ),
        }
    }

    /// The whole returned payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The returned value, unwrapped from a single-field object when the
    /// service wraps it in one.
    pub fn return_value(&self) -> Value {
        match &self.value {
            Value::Object(fields) if fields.len() == 1 => fields
                .values()
                .next()
                .cloned()
                .unwrap_or(Value::Null),
            other => other.clone(),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Human readable description of the fault; empty for every reply that
    /// is not a fault, including transport errors. Use [`error`](Self::error)
    /// for those.
    pub fn fault_as_string(&self) -> String {
        self.fault
            .as_ref()
            .map(Fault::fault_as_string)
            .unwrap_or_default()
    }

    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, CallError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        match self.fault {
            Some(fault) => Err(CallError::Fault(fault)),
            None => Ok(self.value),
        }
    }
}
