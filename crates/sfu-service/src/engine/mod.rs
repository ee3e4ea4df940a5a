//! Media engine capability.
//!
//! The coordinator never forwards packets itself. It drives an engine
//! through the object-safe traits in this module:
//!
//! ```text
//! MediaWorker
//! └── RoutingContext (one per process, shared by every room)
//!     └── TransportHandle (one per peer network path)
//!         ├── ProducerHandle
//!         └── ConsumerHandle
//! ```
//!
//! ICE and DTLS parameters are typed so they round-trip the browser
//! client's shapes unchanged. RTP parameters and capabilities are opaque
//! JSON pass-throughs.

pub mod bootstrap;
pub mod local;

use crate::errors::SfuError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use bootstrap::{EngineRuntime, MediaEngineBootstrap};

/// Opaque RTP send/receive parameters.
pub type RtpParameters = serde_json::Value;

/// Opaque RTP capabilities (codecs and header extensions).
pub type RtpCapabilities = serde_json::Value;

/// Direction of a transport relative to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Peer sends media to the engine.
    Send,
    /// Peer receives media from the engine.
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Whether a codec MIME type (e.g. `video/VP8`) belongs to this kind.
    #[must_use]
    pub fn matches_mime_type(&self, mime_type: &str) -> bool {
        mime_type
            .split_once('/')
            .is_some_and(|(prefix, _)| prefix.eq_ignore_ascii_case(self.as_str()))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A codec the router is able to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl RtpCodecCapability {
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn vp8() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn h264() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
            }),
        }
    }
}

/// Default router codec list (opus, VP8, H264).
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::opus(),
        RtpCodecCapability::vp8(),
        RtpCodecCapability::h264(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default = "default_dtls_role")]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

fn default_dtls_role() -> DtlsRole {
    DtlsRole::Auto
}

/// Negotiation parameters the remote side needs to set up a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Peer-facing options for a new transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub direction: TransportDirection,
    /// Owning peer, for engine-side logging only.
    pub peer_id: String,
}

/// A media-processing worker.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    /// Create a routing context able to route the given codecs.
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn RoutingContext>, SfuError>;

    /// Fires once when the worker dies. A dead worker never comes back.
    fn died(&self) -> CancellationToken;
}

/// Shared capability-negotiation context used by every room.
#[async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> &str;

    /// Capabilities a client needs to load its device.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Box<dyn TransportHandle>, SfuError>;
}

/// One network path between a peer and the engine.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> TransportDirection;

    fn parameters(&self) -> TransportParameters;

    /// Complete the DTLS handshake parameters. Fails with `Negotiation`
    /// when the engine rejects them.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), SfuError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Box<dyn ProducerHandle>, SfuError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Box<dyn ConsumerHandle>, SfuError>;

    async fn close(&self) -> Result<(), SfuError>;
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn close(&self) -> Result<(), SfuError>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Parameters the consuming client passes to its receive transport.
    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    /// Consumers start paused; the client resumes once its track is ready.
    async fn resume(&self) -> Result<(), SfuError>;

    async fn close(&self) -> Result<(), SfuError>;
}
