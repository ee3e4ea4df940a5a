//! Signaling wire protocol.
//!
//! Requests are JSON objects `{"id": n, "method": "...", "data": {...}}`.
//! Every request gets exactly one response carrying the same id. Room
//! events are pushed as notifications without an id.

use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection};
use crate::errors::SfuError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    /// Parse a text frame.
    ///
    /// On failure returns the request id if one could be recovered, so the
    /// error response can still be correlated.
    pub fn from_text(text: &str) -> Result<Self, (u64, SfuError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (0, SfuError::InvalidRequest(format!("malformed JSON: {e}"))))?;
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
        serde_json::from_value(value)
            .map_err(|e| (id, SfuError::InvalidRequest(format!("malformed request: {e}"))))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomData {
    pub room_id: String,
    #[serde(default)]
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransportData {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportData {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerData {
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeAckData {
    pub consumer_id: String,
}

/// A decoded client request.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    GetRouterCapabilities,
    JoinRoom(JoinRoomData),
    CreateTransport(CreateTransportData),
    ConnectTransport(ConnectTransportData),
    Produce(ProduceData),
    CloseProducer(CloseProducerData),
    /// Client is ready to receive on a consumer; resumes it.
    ConsumeAck(ConsumeAckData),
    LeaveRoom,
}

impl ClientRequest {
    /// Decode `data` according to `method`.
    pub fn parse(method: &str, data: Value) -> Result<Self, SfuError> {
        let request = match method {
            "get-router-capabilities" => ClientRequest::GetRouterCapabilities,
            "join-room" => {
                let data: JoinRoomData = decode(method, data)?;
                if data.room_id.trim().is_empty() {
                    return Err(SfuError::InvalidRequest(
                        "join-room requires a non-empty roomId".to_string(),
                    ));
                }
                ClientRequest::JoinRoom(data)
            }
            "create-transport" => ClientRequest::CreateTransport(decode(method, data)?),
            "connect-transport" => ClientRequest::ConnectTransport(decode(method, data)?),
            "produce" => ClientRequest::Produce(decode(method, data)?),
            "close-producer" => ClientRequest::CloseProducer(decode(method, data)?),
            "consume-ack" => ClientRequest::ConsumeAck(decode(method, data)?),
            "leave-room" => ClientRequest::LeaveRoom,
            other => {
                return Err(SfuError::InvalidRequest(format!("unknown method: {other}")));
            }
        };
        Ok(request)
    }

    /// Wire name, also used as the bounded `method` metric label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            ClientRequest::GetRouterCapabilities => "get-router-capabilities",
            ClientRequest::JoinRoom(_) => "join-room",
            ClientRequest::CreateTransport(_) => "create-transport",
            ClientRequest::ConnectTransport(_) => "connect-transport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::CloseProducer(_) => "close-producer",
            ClientRequest::ConsumeAck(_) => "consume-ack",
            ClientRequest::LeaveRoom => "leave-room",
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, SfuError> {
    serde_json::from_value(data)
        .map_err(|e| SfuError::InvalidRequest(format!("invalid {method} payload: {e}")))
}

/// Room-originated event pushed to a peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },

    /// A consumer was created for the receiving peer. `peer_id` is the
    /// producing peer.
    #[serde(rename_all = "camelCase")]
    NewConsumer {
        peer_id: String,
        producer_id: String,
        consumer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

impl ServerMessage {
    #[must_use]
    pub fn success(id: u64, data: Value) -> Self {
        ServerMessage::Response(Response {
            id,
            ok: true,
            data: Some(data),
            error: None,
        })
    }

    /// Error response with the client-safe message for `error`.
    #[must_use]
    pub fn failure(id: u64, error: &SfuError) -> Self {
        ServerMessage::Response(Response {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.error_code(),
                message: error.client_message(),
            }),
        })
    }

    pub fn to_json(&self) -> Result<String, SfuError> {
        serde_json::to_string(self)
            .map_err(|e| SfuError::Internal(format!("failed to encode frame: {e}")))
    }
}
