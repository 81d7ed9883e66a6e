//! Rust struct definitions that ser/de to/from the envelopes exchanged on a channel.
//!
//! Every message on the wire is an [`Envelope`] naming the channel it belongs to.  The RPC layer
//! uses four channels, one per message kind: notifications, requests, responses and
//! cancellations.  Field names are camelCase on the wire.
use serde::{Deserialize, Serialize};

/// Re-export the error codes of the JSON-RPC protocol, whose numbering this protocol shares.
pub use jsonrpsee_types::error::ErrorCode;
pub use serde_json::Value as JsonValue;

use crate::{Result, RpcError};

/// Code used on the wire for errors caused by cancellation.
pub const REQUEST_CANCELLED_CODE: i32 = -32800;

/// Numeric identifier of a request, unique and increasing per client.
pub type RequestId = u64;

/// A message tagged with the name of the channel it travels on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: JsonValue,
}

/// Fire-and-forget call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<JsonValue>>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: impl Into<Option<Vec<JsonValue>>>) -> Self {
        Self {
            method: method.into(),
            params: params.into(),
        }
    }
}

/// Call that expects a [`Response`] carrying the same request ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<JsonValue>>,
}

impl Request {
    pub fn new(
        request_id: RequestId,
        method: impl Into<String>,
        params: impl Into<Option<Vec<JsonValue>>>,
    ) -> Self {
        Self {
            request_id,
            method: method.into(),
            params: params.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: RequestId,
    /// Exactly one of `result` or `error`.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(request_id: RequestId, payload: ResponsePayload) -> Self {
        Self { request_id, payload }
    }

    pub fn success(request_id: RequestId, result: JsonValue) -> Self {
        Self::new(request_id, ResponsePayload::success(result))
    }

    pub fn error(request_id: RequestId, error: impl Into<ErrorDetails>) -> Self {
        Self::new(request_id, ResponsePayload::error(error))
    }
}

/// Asks the peer to stop working on a request it is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    pub request_id: RequestId,
}

/// Possible payloads of a response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  This works because success responses have `result` and error responses
/// have `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Error(ErrorResponse),
    Success(SuccessResponse),
}

impl ResponsePayload {
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Serialize our way to a successful payload, producing an error payload instead if
    /// serialization fails.
    pub fn serialize_to_success<T: Serialize>(result: T) -> Self {
        match serde_json::to_value(result) {
            Ok(json) => Self::success(json),
            Err(source) => Self::error(RpcError::Serialize {
                source,
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(ErrorResponse { error: details.into() })
    }

    /// Turn the payload into the outcome seen by the caller of `method`.
    pub fn into_result(self, method: &str) -> Result<JsonValue> {
        match self {
            ResponsePayload::Success(success) => Ok(success.result),
            ResponsePayload::Error(ErrorResponse { error }) if error.is_cancelled() => Err(RpcError::Cancelled),
            ResponsePayload::Error(ErrorResponse { error }) => Err(RpcError::MethodError {
                method: method.to_string(),
                error,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Details of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
            data: data.into(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }

    pub fn cancelled() -> Self {
        Self::server_error(REQUEST_CANCELLED_CODE, "Cancelled", None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::ServerError(REQUEST_CANCELLED_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    #[test]
    fn test_request_serialization() {
        let known_good_json = r#"{"requestId":1,"method":"$getZoomLevel","params":[1,"test",true]}"#;
        let known_good_value: Value = serde_json::from_str(known_good_json).unwrap();

        let our_request = Request::new(1, "$getZoomLevel", Some(vec![json!(1), json!("test"), json!(true)]));
        let our_value = serde_json::to_value(&our_request).unwrap();
        assert_eq!(known_good_value, our_value);

        let parsed: Request = serde_json::from_str(known_good_json).unwrap();
        assert_eq!(parsed, our_request);
    }

    #[test]
    fn test_params_are_optional() {
        let notification: Notification = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(notification, Notification::new("ping", None));

        let json = serde_json::to_string(&Notification::new("ping", None)).unwrap();
        assert_eq!(json, r#"{"method":"ping"}"#);
    }

    #[test]
    fn test_success_response_serialization() {
        let known_good_json = r#"{"requestId":7,"result":{"zoom":2}}"#;
        let response = Response::success(7, json!({"zoom": 2}));

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::from_str::<Value>(known_good_json).unwrap()
        );

        let parsed: Response = serde_json::from_str(known_good_json).unwrap();
        assert_eq!(parsed.request_id, 7);
        assert_matches!(parsed.payload, ResponsePayload::Success(SuccessResponse { result }) if result == json!({"zoom": 2}));
    }

    #[test]
    fn test_error_response_serialization() {
        let known_good_json =
            r#"{"requestId":3,"error":{"code":-32601,"message":"No callable method '$nope'","stack":"at nope"}}"#;
        let response = Response::error(
            3,
            ErrorDetails::method_not_found("No callable method '$nope'", None).with_stack("at nope"),
        );

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::from_str::<Value>(known_good_json).unwrap()
        );

        let parsed: Response = serde_json::from_str(known_good_json).unwrap();
        assert_matches!(parsed.payload, ResponsePayload::Error(ErrorResponse { error }) => {
            assert_eq!(error.code, ErrorCode::MethodNotFound);
            assert_eq!(error.stack.as_deref(), Some("at nope"));
        });
    }

    #[test]
    fn test_null_result_is_success() {
        let parsed: Response = serde_json::from_str(r#"{"requestId":1,"result":null}"#).unwrap();
        assert_matches!(parsed.payload, ResponsePayload::Success(SuccessResponse { result: Value::Null }));
    }

    #[test]
    fn test_cancel_serialization() {
        let json = serde_json::to_string(&Cancel { request_id: 12 }).unwrap();
        assert_eq!(json, r#"{"requestId":12}"#);
    }

    #[test]
    fn test_cancelled_payload_maps_to_cancelled_error() {
        let payload = ResponsePayload::error(ErrorDetails::cancelled());
        assert_matches!(payload.into_result("$slow"), Err(RpcError::Cancelled));

        let payload = ResponsePayload::error(ErrorDetails::internal_error("boom", None));
        assert_matches!(
            payload.into_result("$explode"),
            Err(RpcError::MethodError { method, error }) if method == "$explode" && error.message == "boom"
        );
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope {
            channel: "rpc.request".to_string(),
            payload: serde_json::to_value(Request::new(1, "$ping", None)).unwrap(),
        };

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"channel": "rpc.request", "payload": {"requestId": 1, "method": "$ping"}})
        );
    }
}
