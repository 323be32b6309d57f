//! Wire protocol between the manager and device plugins.
//!
//! Both sockets speak newline-delimited JSON: one JSON object per line.
//!
//! The registration socket is owned by the manager. A plugin connects, writes
//! one request line and reads one response line:
//!
//! ```json
//! // Request
//! {"version":1,"request_id":"req-1","command":"register","payload":{"resource_name":"vendor.example/gpu","api_version":"v1alpha","endpoint":"gpu.sock"}}
//! // Response
//! {"version":1,"request_id":"req-1","status":"ok","payload":{"resource_name":"vendor.example/gpu","generation":3}}
//! ```
//!
//! The device socket is owned by the plugin. The manager connects, writes a
//! `list-and-watch` request line and then reads [`ListAndWatchResponse`]
//! lines for as long as the connection stays open. Every line is a full
//! snapshot of the plugin's devices.

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Protocol version for the JSON envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Command sent to the manager to register a plugin.
pub const COMMAND_REGISTER: &str = "register";

/// Command sent to a plugin to open its device stream.
pub const COMMAND_LIST_AND_WATCH: &str = "list-and-watch";

/// A request envelope, used on both sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketRequest {
    /// Protocol version. Must be [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Unique identifier echoed back in the response.
    pub request_id: String,
    /// Command to execute (e.g., `"register"`).
    pub command: String,
    /// Command-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SocketRequest {
    pub fn new(command: &str, payload: serde_json::Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: new_request_id(),
            command: command.to_string(),
            payload,
        }
    }
}

/// A response envelope from the registration socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketResponse {
    pub version: u32,
    /// Echoed `request_id` from the corresponding request.
    pub request_id: String,
    /// `"ok"` on success, `"error"` on failure.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SocketError>,
}

impl SocketResponse {
    pub fn ok(request_id: &str, payload: serde_json::Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.to_string(),
            status: "ok".to_string(),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(request_id: &str, code: &str, message: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.to_string(),
            status: "error".to_string(),
            payload: None,
            error: Some(SocketError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }

    /// Returns `true` if the response indicates success.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Error details carried by an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketError {
    /// Machine-readable error code (e.g., `"INVALID_RESOURCE_NAME"`).
    pub code: String,
    pub message: String,
}

/// Payload of a `register` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Vendor-namespaced resource name, e.g. `"nvidia.com/gpu"`.
    pub resource_name: String,
    /// Device plugin API version the plugin speaks.
    pub api_version: String,
    /// Path of the plugin's device socket. Relative paths are resolved
    /// against the directory of the manager's registration socket.
    pub endpoint: String,
}

impl RegisterRequest {
    pub fn new(
        resource_name: impl Into<String>,
        api_version: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            resource_name: resource_name.into(),
            api_version: api_version.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Payload of a successful `register` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub resource_name: String,
    /// Generation minted for the plugin's new endpoint.
    pub generation: u64,
}

/// One snapshot line on the device stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAndWatchResponse {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Generate a compact request identifier.
pub fn new_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{}-{nanos}-{seq}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Health;

    #[test]
    fn test_register_request_envelope() {
        let payload = serde_json::to_value(RegisterRequest::new(
            "vendor.example/gpu",
            "v1alpha",
            "gpu.sock",
        ))
        .unwrap();
        let req = SocketRequest::new(COMMAND_REGISTER, payload);

        let json = serde_json::to_string(&req).unwrap();
        let decoded: SocketRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.command, "register");
        let body: RegisterRequest = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(body.resource_name, "vendor.example/gpu");
        assert_eq!(body.endpoint, "gpu.sock");
    }

    #[test]
    fn test_request_without_payload_defaults_to_null() {
        let req: SocketRequest =
            serde_json::from_str(r#"{"version":1,"request_id":"r","command":"list-and-watch"}"#)
                .unwrap();
        assert!(req.payload.is_null());
    }

    #[test]
    fn test_error_response_omits_payload() {
        let resp = SocketResponse::error("r1", "INVALID_ENDPOINT", "dial failed");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(!json.contains("payload"));
        assert!(!resp.is_ok());
        assert_eq!(resp.error.unwrap().code, "INVALID_ENDPOINT");
    }

    #[test]
    fn test_snapshot_line_parses() {
        let line = r#"{"devices":[{"id":"Dev1","health":"Healthy"},{"id":"Dev2","health":"Unhealthy"}]}"#;
        let snapshot: ListAndWatchResponse = serde_json::from_str(line).unwrap();

        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.devices[1].health, Health::Unhealthy);
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
