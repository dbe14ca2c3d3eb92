//! IPC protocol between local clients and the tunnel service
//!
//! Requests are newline-delimited JSON objects of the shape
//! `{"Function": "...", "Payload": {...}}`. Every request is answered with a
//! single [`Response`] line. The event channel streams [`Event`] lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{Fingerprint, Service, TransferMetrics};

/// Version of the event protocol announced in status events
pub const API_VERSION: u32 = 1;

/// Raw request envelope as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandMsg {
    /// Name of the function to invoke
    pub function: String,
    /// Function arguments
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Decoded control command, one variant per supported function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enroll a new identity; the enrollment payload follows on the next line
    AddIdentity,
    /// Forget an identity and delete its file
    RemoveIdentity { fingerprint: Fingerprint },
    /// Report the full tunnel status
    Status,
    /// Turn the whole tunnel on or off
    TunnelState { on_off: bool },
    /// Turn a single identity on or off
    IdentityOnOff { fingerprint: Fingerprint, on_off: bool },
    /// Change the service log level
    SetLogLevel { level: String },
    /// Write engine diagnostics for every loaded identity
    ZitiDump,
    /// Emit a canned series of events
    Debug,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FingerprintPayload {
    fingerprint: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OnOffPayload {
    on_off: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityOnOffPayload {
    fingerprint: String,
    on_off: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LevelPayload {
    level: String,
}

/// Why a request line could not be turned into a [`Command`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The line is not a JSON command envelope
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The function name is not one the service understands
    #[error("unknown operation: {0}")]
    UnknownFunction(String),

    /// The payload is missing fields or has the wrong types
    #[error("invalid payload for {function}: {reason}")]
    InvalidPayload { function: String, reason: String },
}

impl CommandError {
    /// Response code reported for this error
    pub fn code(&self) -> ResponseCode {
        match self {
            CommandError::UnknownFunction(_) => ResponseCode::UnknownOperation,
            CommandError::Malformed(_) | CommandError::InvalidPayload { .. } => {
                ResponseCode::ProtocolError
            }
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    function: &str,
    payload: Value,
) -> Result<T, CommandError> {
    serde_json::from_value(payload).map_err(|e| CommandError::InvalidPayload {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

impl Command {
    /// Decode a single request line
    pub fn decode(line: &str) -> Result<Self, CommandError> {
        let msg: CommandMsg =
            serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))?;
        Self::try_from(msg)
    }

    /// Wire name of this command's function
    pub fn function(&self) -> &'static str {
        match self {
            Command::AddIdentity => "AddIdentity",
            Command::RemoveIdentity { .. } => "RemoveIdentity",
            Command::Status => "Status",
            Command::TunnelState { .. } => "TunnelState",
            Command::IdentityOnOff { .. } => "IdentityOnOff",
            Command::SetLogLevel { .. } => "SetLogLevel",
            Command::ZitiDump => "ZitiDump",
            Command::Debug => "Debug",
        }
    }

    /// Encode into the wire envelope
    pub fn to_msg(&self) -> CommandMsg {
        let payload = match self {
            Command::RemoveIdentity { fingerprint } => {
                serde_json::json!({ "Fingerprint": fingerprint })
            }
            Command::TunnelState { on_off } => serde_json::json!({ "OnOff": on_off }),
            Command::IdentityOnOff {
                fingerprint,
                on_off,
            } => serde_json::json!({ "Fingerprint": fingerprint, "OnOff": on_off }),
            Command::SetLogLevel { level } => serde_json::json!({ "Level": level }),
            Command::AddIdentity | Command::Status | Command::ZitiDump | Command::Debug => {
                Value::Null
            }
        };
        CommandMsg {
            function: self.function().to_string(),
            payload,
        }
    }
}

impl TryFrom<CommandMsg> for Command {
    type Error = CommandError;

    fn try_from(msg: CommandMsg) -> Result<Self, Self::Error> {
        let function = msg.function.as_str();
        let command = match function {
            "AddIdentity" => Command::AddIdentity,
            "RemoveIdentity" => {
                let p: FingerprintPayload = payload(function, msg.payload)?;
                Command::RemoveIdentity {
                    fingerprint: Fingerprint::new(p.fingerprint),
                }
            }
            "Status" => Command::Status,
            "TunnelState" => {
                let p: OnOffPayload = payload(function, msg.payload)?;
                Command::TunnelState { on_off: p.on_off }
            }
            "IdentityOnOff" => {
                let p: IdentityOnOffPayload = payload(function, msg.payload)?;
                Command::IdentityOnOff {
                    fingerprint: Fingerprint::new(p.fingerprint),
                    on_off: p.on_off,
                }
            }
            "SetLogLevel" => {
                let p: LevelPayload = payload(function, msg.payload)?;
                Command::SetLogLevel { level: p.level }
            }
            "ZitiDump" => Command::ZitiDump,
            "Debug" => Command::Debug,
            other => return Err(CommandError::UnknownFunction(other.to_string())),
        };
        Ok(command)
    }
}

/// Second line of an `AddIdentity` request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddIdentity {
    #[serde(rename = "Flags")]
    pub flags: EnrollmentFlags,
    #[serde(rename = "Id", default)]
    pub id: IdentityRequest,
}

/// Enrollment options supplied by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrollmentFlags {
    /// Enrollment token (JWT)
    pub jwt_string: String,
}

/// Client-chosen attributes of the identity to create
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityRequest {
    /// Desired display name; defaults to the fingerprint when blank
    #[serde(default)]
    pub name: String,
}

/// Numeric response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResponseCode {
    Success = 0,
    UnknownError = 1,
    CouldNotEnroll = 2,
    CouldNotWriteFile = 3,
    IdentityNotFound = 4,
    ProtocolError = 5,
    EngineError = 6,
    UnknownOperation = 7,
    PersistenceError = 8,
}

impl ResponseCode {
    /// Wire value
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Response to a control request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub code: i32,
    pub message: String,
    pub error: String,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// Successful response without payload
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Success.as_i32(),
            message: message.into(),
            error: String::new(),
            payload: Value::Null,
        }
    }

    /// Successful response carrying a payload
    pub fn with_payload<T: Serialize>(message: impl Into<String>, payload: &T) -> Self {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("failed to encode response payload: {}", e);
                Value::Null
            }
        };
        Self {
            payload,
            ..Self::success(message)
        }
    }

    /// Error response
    pub fn error(code: ResponseCode, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: message.into(),
            error: error.into(),
            payload: Value::Null,
        }
    }

    /// Whether the response code is SUCCESS
    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success.as_i32()
    }
}

/// Controller connection details exposed for an identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfigInfo {
    /// Controller API endpoint
    #[serde(rename = "ztAPI")]
    pub controller: String,
}

/// Externally visible (sanitized) identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityInfo {
    pub name: String,
    #[serde(rename = "FingerPrint")]
    pub fingerprint: Fingerprint,
    pub active: bool,
    pub config: IdentityConfigInfo,
    #[serde(default)]
    pub controller_version: String,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub metrics: Option<TransferMetrics>,
}

/// Tunnel interface addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunIpInfo {
    #[serde(rename = "Ip")]
    pub ip: String,
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "MTU")]
    pub mtu: u16,
    #[serde(rename = "DNS")]
    pub dns: String,
}

/// Full tunnel status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelStatus {
    pub active: bool,
    /// Milliseconds since the tunnel was last turned on
    pub duration: u64,
    pub identities: Vec<IdentityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_info: Option<TunIpInfo>,
    pub log_level: String,
}

/// Added/removed discriminator for identity and service events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Added,
    Removed,
}

/// Event pushed to event-channel subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Op", rename_all = "lowercase")]
pub enum Event {
    /// Full status snapshot
    Status {
        #[serde(rename = "Status")]
        status: TunnelStatus,
        #[serde(rename = "ApiVersion")]
        api_version: u32,
    },

    /// The service is shutting down
    Shutdown,

    /// An identity was added or removed
    Identity {
        #[serde(rename = "Action")]
        action: EventAction,
        #[serde(rename = "Id")]
        id: IdentityInfo,
    },

    /// A service appeared on or disappeared from an identity
    Service {
        #[serde(rename = "Action")]
        action: EventAction,
        #[serde(rename = "Fingerprint")]
        fingerprint: Fingerprint,
        #[serde(rename = "Service")]
        service: Service,
    },

    /// Periodic traffic counters
    Metrics {
        #[serde(rename = "Identities")]
        identities: Vec<IdentityInfo>,
    },
}

impl Event {
    /// Status snapshot event at the current API version
    pub fn status(status: TunnelStatus) -> Self {
        Event::Status {
            status,
            api_version: API_VERSION,
        }
    }

    /// Short name for logging
    pub fn op(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::Shutdown => "shutdown",
            Event::Identity { .. } => "identity",
            Event::Service { .. } => "service",
            Event::Metrics { .. } => "metrics",
        }
    }
}
