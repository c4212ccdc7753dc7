use crate::fault::Fault;
use crate::headers::Headers;
use crate::ids::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success { value: Value },
    Fault { fault: Fault },
}

impl Outcome {
    pub fn is_fault(&self) -> bool {
        matches!(self, Outcome::Fault { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request {
        id: CallId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Headers::is_empty")]
        headers: Headers,
    },
    Response {
        id: CallId,
        #[serde(flatten)]
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Headers::is_empty")]
        headers: Headers,
    },
    /// Sent instead of a response when the request lacks acceptable
    /// credentials.
    AuthChallenge { id: CallId, realm: String },
}

impl Message {
    pub fn request(id: CallId, method: impl Into<String>, args: Vec<Value>, headers: Headers) -> Self {
        Message::Request {
            id,
            method: method.into(),
            args,
            headers,
        }
    }

    pub fn success(id: CallId, value: Value) -> Self {
        Message::Response {
            id,
            outcome: Outcome::Success { value },
            headers: Headers::new(),
        }
    }

    pub fn fault(id: CallId, fault: Fault) -> Self {
        Message::Response {
            id,
            outcome: Outcome::Fault { fault },
            headers: Headers::new(),
        }
    }

    pub fn id(&self) -> CallId {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::AuthChallenge { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_layout() {
        let msg = Message::request(CallId::new(1), "getMothersDay", vec![json!(2012)], Headers::new());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"type": "request", "id": 1, "method": "getMothersDay", "args": [2012]})
        );
    }

    #[test]
    fn test_fault_response_round_trip() {
        let msg = Message::fault(CallId::new(9), Fault::not_found("no such method"));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"fault\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.id(), CallId::new(9));
    }

    #[test]
    fn test_missing_args_and_headers_default() {
        let back: Message =
            serde_json::from_value(json!({"type": "request", "id": 3, "method": "ping"})).unwrap();
        match back {
            Message::Request { args, headers, .. } => {
                assert!(args.is_empty());
                assert!(headers.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
