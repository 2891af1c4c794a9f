//! Gateway WebSocket wire types (client side): request/response/event
//! envelopes, connect params with the signed device block, and wake params.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this client (both ends of the advertised range).
pub const PROTOCOL_VERSION: u32 = 3;

/// Error code a gateway returns for a device it has not approved yet.
pub const NOT_PAIRED: &str = "NOT_PAIRED";

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl WsRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            typ: "req".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Wire response: `{ "type": "res", "id", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Wire event: `{ "type": "event", "event", "payload" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub typ: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WsEvent {
    /// Nonce from a `connect.challenge` event, when present.
    pub fn challenge_nonce(&self) -> Option<String> {
        if self.event != "connect.challenge" {
            return None;
        }
        self.payload
            .get("nonce")
            .and_then(|n| n.as_str())
            .map(|s| s.to_string())
    }
}

/// Error block carried in a response: `{ code?, message? }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorInfo {
    pub fn is_not_paired(&self) -> bool {
        self.code.as_deref() == Some(NOT_PAIRED)
    }

    /// Message-text convention signaling that a stored device token is no
    /// longer valid on the gateway side.
    pub fn is_stale_token(&self) -> bool {
        self.message
            .as_deref()
            .map(|m| m.contains("token mismatch"))
            .unwrap_or(false)
    }

    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(c), Some(m)) => format!("{}: {}", c, m),
            (Some(c), None) => c.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Inbound frame, keyed on the `type` field.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(WsResponse),
    Event(WsEvent),
}

/// Parse one inbound text frame. Unknown or malformed frames => None.
pub fn parse_frame(text: &str) -> Option<Frame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("res") => serde_json::from_value(value).ok().map(Frame::Response),
        Some("event") => serde_json::from_value(value).ok().map(Frame::Event),
        _ => None,
    }
}

/// Client connect params: protocol range, client descriptor, auth, and the
/// signed device block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub caps: Vec<String>,
    pub auth: ConnectAuth,
    pub role: String,
    pub scopes: Vec<String>,
    pub device: ConnectDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: String,
}

/// Device identity block: id, raw public key (URL-safe base64), signature over
/// the canonical payload, signing timestamp, and the challenge nonce when one
/// was received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectDevice {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Successful connect ack payload (subset this client reads).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    #[serde(default)]
    pub auth: Option<AckAuth>,
}

/// Auth info in a connect ack; `deviceToken` is set when the gateway issued
/// (or re-issued) a device credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckAuth {
    #[serde(default)]
    pub device_token: Option<String>,
}

/// Params for the `wake` method: immediate out-of-band nudge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeParams {
    pub mode: String,
    pub text: String,
}

impl WakeParams {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            mode: "now".to_string(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_use_camel_case_wire_names() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ConnectClient {
                id: "gateway-client".to_string(),
                version: "1.0.0".to_string(),
                platform: "linux".to_string(),
                mode: "backend".to_string(),
                instance_id: "i-1".to_string(),
            },
            caps: vec![],
            auth: ConnectAuth {
                token: "tok".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.admin".to_string()],
            device: ConnectDevice {
                id: "d".to_string(),
                public_key: "pk".to_string(),
                signature: "sig".to_string(),
                signed_at: 1,
                nonce: None,
            },
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["minProtocol"], 3);
        assert_eq!(v["client"]["instanceId"], "i-1");
        assert_eq!(v["device"]["publicKey"], "pk");
        assert_eq!(v["device"]["signedAt"], 1);
        assert!(v["device"].get("nonce").is_none());
    }

    #[test]
    fn parse_frame_routes_by_type() {
        let res = parse_frame(r#"{"type":"res","id":"1","payload":{}}"#);
        assert!(matches!(res, Some(Frame::Response(_))));

        let ev = parse_frame(r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"n1"}}"#);
        let Some(Frame::Event(ev)) = ev else {
            panic!("expected event frame");
        };
        assert_eq!(ev.challenge_nonce(), Some("n1".to_string()));

        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"type":"other"}"#).is_none());
    }

    #[test]
    fn error_taxonomy() {
        let not_paired = ErrorInfo {
            code: Some(NOT_PAIRED.to_string()),
            message: None,
        };
        assert!(not_paired.is_not_paired());
        assert!(!not_paired.is_stale_token());

        let stale = ErrorInfo {
            code: Some("AUTH".to_string()),
            message: Some("device token mismatch".to_string()),
        };
        assert!(stale.is_stale_token());
        assert_eq!(stale.describe(), "AUTH: device token mismatch");
    }
}
