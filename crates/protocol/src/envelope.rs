use serde::{Deserialize, Serialize};

use crate::constants::Method;

/// Error details carried by a completion frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: i32,
    pub message: String,
}

/// Envelope for all WebSocket communication with the control plane.
///
/// Invocations that expect a reply carry an `id`; the hub answers with a
/// [`Method::Completion`] frame using the same id. Pushes and
/// fire-and-forget invocations have no id.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the target is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub target: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

impl Frame {
    /// Creates a frame for the given target and payload.
    pub fn new<T: Serialize>(
        id: Option<String>,
        target: Method,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => Some(serde_json::value::to_raw_value(p)?),
            None => None,
        };
        Ok(Self {
            id,
            target,
            payload: raw,
            error: None,
        })
    }

    /// Creates a successful completion for the invocation with `id`.
    pub fn completion(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            target: Method::Completion,
            payload: None,
            error: None,
        }
    }

    /// Creates a failed completion for the invocation with `id`.
    pub fn completion_error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            target: Method::Completion,
            payload: None,
            error: Some(FrameError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_new_with_payload() {
        let payload = serde_json::json!({"key": "value"});
        let frame = Frame::new(Some("f-1".into()), Method::SendHeartbeat, Some(&payload)).unwrap();
        assert_eq!(frame.id.as_deref(), Some("f-1"));
        assert_eq!(frame.target, Method::SendHeartbeat);
        assert!(frame.payload.is_some());
        assert!(frame.error.is_none());
    }

    #[test]
    fn frame_omits_empty_fields() {
        let frame = Frame::new::<()>(None, Method::ReceivePing, None).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"target":"ReceivePing"}"#);
    }

    #[test]
    fn completion_error_parses_back() {
        let frame = Frame::completion_error("req-9", 403, "forbidden");
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("req-9"));
        assert_eq!(parsed.target, Method::Completion);
        let err = parsed.error.unwrap();
        assert_eq!(err.code, 403);
        assert_eq!(err.message, "forbidden");
    }

    #[test]
    fn string_payload_is_preserved_verbatim() {
        let raw_command = r#"{"commandType":"Ping"}"#.to_string();
        let frame = Frame::new(None, Method::ReceiveCommand, Some(&raw_command)).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        let text: String = parsed.parse_payload().unwrap().unwrap();
        assert_eq!(text, raw_command);
    }

    #[test]
    fn unknown_target_still_parses() {
        let parsed: Frame = serde_json::from_str(r#"{"target":"Reboot","payload":1}"#).unwrap();
        assert_eq!(parsed.target, Method::Unknown);
        assert!(parsed.id.is_none());
    }
}
