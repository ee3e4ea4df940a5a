//! Pre-configured fixtures for SFU testing.
//!
//! Provides:
//! - A running local media engine (optionally fault-injecting)
//! - Registries wired to it
//! - Client payloads (RTP parameters, DTLS parameters, capabilities)

use crate::scripted_engine::{FaultPlan, ScriptedRouting};

use serde_json::{json, Value};
use sfu_service::actors::{ActorMetrics, RegistryLimits, RoomRegistryActorHandle};
use sfu_service::engine::local::{LocalWorker, WorkerSettings};
use sfu_service::engine::{
    default_media_codecs, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, MediaWorker,
    RoutingContext,
};
use std::sync::Arc;

/// Default limits for test registries.
pub const TEST_LIMITS: RegistryLimits = RegistryLimits {
    max_rooms: 100,
    max_peers_per_room: 20,
};

/// Settings for a local worker on a small loopback port range.
#[must_use]
pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        rtc_min_port: 44000,
        rtc_max_port: 44999,
        listen_ip: "127.0.0.1".parse().unwrap(),
        announced_ip: None,
        log_level: "warn".to_string(),
    }
}

/// A running local engine and its routing context.
pub struct TestEngine {
    pub worker: LocalWorker,
    pub routing: Arc<dyn RoutingContext>,
    pub metrics: Arc<ActorMetrics>,
}

impl TestEngine {
    pub async fn start() -> Self {
        let worker = LocalWorker::spawn(worker_settings()).unwrap();
        let routing = worker.create_router(default_media_codecs()).await.unwrap();
        Self {
            worker,
            routing,
            metrics: ActorMetrics::new(),
        }
    }

    /// Start an engine whose operations follow `plan`.
    pub async fn start_scripted(plan: Arc<FaultPlan>) -> Self {
        let mut engine = Self::start().await;
        engine.routing = ScriptedRouting::wrap(engine.routing, plan);
        engine
    }

    #[must_use]
    pub fn registry(&self) -> RoomRegistryActorHandle {
        self.registry_with_limits(TEST_LIMITS)
    }

    #[must_use]
    pub fn registry_with_limits(&self, limits: RegistryLimits) -> RoomRegistryActorHandle {
        RoomRegistryActorHandle::new(
            format!("sfu-test-{}", uuid::Uuid::new_v4()),
            Arc::clone(&self.routing),
            limits,
            Arc::clone(&self.metrics),
        )
    }
}

/// Client RTP parameters for one stream of `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> Value {
    match kind {
        MediaKind::Audio => json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2
            }],
            "encodings": [{ "ssrc": 11111111 }]
        }),
        MediaKind::Video => json!({
            "mid": "1",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000
            }],
            "encodings": [{ "ssrc": 22222222 }]
        }),
    }
}

/// Client DTLS parameters as a browser would send them.
#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD"
                .to_string(),
        }],
    }
}

/// DTLS parameters the engine must reject.
#[must_use]
pub fn bad_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: Vec::new(),
    }
}

/// Device capabilities that can only receive audio.
#[must_use]
pub fn audio_only_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "preferredPayloadType": 100
        }],
        "headerExtensions": []
    })
}
