//! In-process media engine.
//!
//! Implements the engine capability without an external worker process:
//! it allocates RTC ports, generates ICE credentials and DTLS fingerprints,
//! and validates connect/produce/consume parameters against the router's
//! codec list. Used by the service binary and by tests.

use super::{
    ConsumerHandle, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, MediaWorker, ProducerHandle, RoutingContext, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportDirection, TransportHandle, TransportOptions,
    TransportParameters,
};
use crate::errors::SfuError;

use async_trait::async_trait;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// DTLS fingerprint algorithms accepted on connect.
const SUPPORTED_FINGERPRINT_ALGORITHMS: [&str; 5] =
    ["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

/// First dynamic RTP payload type assigned to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Host candidate priority for UDP.
const UDP_HOST_PRIORITY: u32 = 1_076_302_079;

/// Worker settings, passed through from configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub log_level: String,
}

/// Round-robin RTC port allocator over an inclusive range.
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    max: u16,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            next: min,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let span = u32::from(self.max - self.min) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if self.next >= self.max {
                self.min
            } else {
                self.next + 1
            };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

/// State shared by a worker and everything created from it.
struct WorkerShared {
    settings: WorkerSettings,
    died: CancellationToken,
    ports: Mutex<PortAllocator>,
    rng: SystemRandom,
}

impl WorkerShared {
    fn ensure_alive(&self) -> Result<(), SfuError> {
        if self.died.is_cancelled() {
            return Err(SfuError::EngineUnavailable("media worker died".to_string()));
        }
        Ok(())
    }

    fn random_bytes<const N: usize>(&self) -> Result<[u8; N], SfuError> {
        let mut bytes = [0u8; N];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| SfuError::Internal("system random source failed".to_string()))?;
        Ok(bytes)
    }

    fn announced_address(&self) -> IpAddr {
        self.settings
            .announced_ip
            .unwrap_or(self.settings.listen_ip)
    }
}

/// In-process media worker.
pub struct LocalWorker {
    id: String,
    shared: Arc<WorkerShared>,
}

impl LocalWorker {
    /// Start a worker over the configured port range.
    pub fn spawn(settings: WorkerSettings) -> Result<Self, SfuError> {
        if settings.rtc_min_port == 0 || settings.rtc_min_port > settings.rtc_max_port {
            return Err(SfuError::EngineUnavailable(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        debug!(
            target: "sfu.engine",
            worker_id = %id,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            listen_ip = %settings.listen_ip,
            log_level = %settings.log_level,
            "Media worker started"
        );

        let ports = PortAllocator::new(settings.rtc_min_port, settings.rtc_max_port);
        Ok(Self {
            id,
            shared: Arc::new(WorkerShared {
                settings,
                died: CancellationToken::new(),
                ports: Mutex::new(ports),
                rng: SystemRandom::new(),
            }),
        })
    }

    /// Terminate the worker. Fires the `died` signal.
    pub fn kill(&self) {
        warn!(target: "sfu.engine", worker_id = %self.id, "Media worker killed");
        self.shared.died.cancel();
    }
}

#[async_trait]
impl MediaWorker for LocalWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn RoutingContext>, SfuError> {
        self.shared.ensure_alive()?;
        if media_codecs.is_empty() {
            return Err(SfuError::InvalidRequest(
                "router requires at least one media codec".to_string(),
            ));
        }

        let router = LocalRouter {
            id: uuid::Uuid::new_v4().to_string(),
            worker: Arc::clone(&self.shared),
            codecs: media_codecs,
            producers: Arc::new(Mutex::new(HashMap::new())),
        };
        debug!(
            target: "sfu.engine",
            worker_id = %self.id,
            router_id = %router.id,
            codecs = router.codecs.len(),
            "Router created"
        );
        Ok(Arc::new(router))
    }

    fn died(&self) -> CancellationToken {
        self.shared.died.clone()
    }
}

/// Live producer as seen by its router.
#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

type ProducerTable = Arc<Mutex<HashMap<String, ProducerRecord>>>;

struct LocalRouter {
    id: String,
    worker: Arc<WorkerShared>,
    codecs: Vec<RtpCodecCapability>,
    producers: ProducerTable,
}

impl LocalRouter {
    fn ice_and_dtls(&self, port: u16) -> Result<TransportParameters, SfuError> {
        let ufrag = self.worker.random_bytes::<8>()?;
        let password = self.worker.random_bytes::<16>()?;
        let certificate_seed = self.worker.random_bytes::<32>()?;

        let fingerprint = digest::digest(&digest::SHA256, &certificate_seed)
            .as_ref()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        Ok(TransportParameters {
            ice_parameters: IceParameters {
                username_fragment: hex::encode(ufrag),
                password: hex::encode(password),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: UDP_HOST_PRIORITY,
                ip: self.worker.announced_address(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint,
                }],
            },
        })
    }
}

#[async_trait]
impl RoutingContext for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<serde_json::Value> = self
            .codecs
            .iter()
            .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| {
                let mut value = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": payload_type,
                });
                if let Some(fields) = value.as_object_mut() {
                    if let Some(channels) = codec.channels {
                        fields.insert("channels".to_string(), json!(channels));
                    }
                    if !codec.parameters.is_null() {
                        fields.insert("parameters".to_string(), codec.parameters.clone());
                    }
                }
                value
            })
            .collect();

        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Box<dyn TransportHandle>, SfuError> {
        self.worker.ensure_alive()?;

        let port = self.worker.ports.lock().await.allocate().ok_or_else(|| {
            SfuError::ResourceExhausted(format!(
                "no free RTC port in {}-{}",
                self.worker.settings.rtc_min_port, self.worker.settings.rtc_max_port
            ))
        })?;

        let parameters = match self.ice_and_dtls(port) {
            Ok(parameters) => parameters,
            Err(e) => {
                self.worker.ports.lock().await.release(port);
                return Err(e);
            }
        };

        let transport = LocalTransport {
            id: uuid::Uuid::new_v4().to_string(),
            direction: options.direction,
            port,
            parameters,
            worker: Arc::clone(&self.worker),
            codecs: self.codecs.clone(),
            producers: Arc::clone(&self.producers),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        debug!(
            target: "sfu.engine",
            router_id = %self.id,
            transport_id = %transport.id,
            peer_id = %options.peer_id,
            direction = %options.direction,
            port,
            "Transport created"
        );

        Ok(Box::new(transport))
    }
}

struct LocalTransport {
    id: String,
    direction: TransportDirection,
    port: u16,
    parameters: TransportParameters,
    worker: Arc<WorkerShared>,
    codecs: Vec<RtpCodecCapability>,
    producers: ProducerTable,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), SfuError> {
        self.worker.ensure_alive()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::Negotiation(format!(
                "transport {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// Codec MIME types listed in an RTP parameters/capabilities object, in order.
fn codec_mime_types(value: &serde_json::Value) -> Vec<&str> {
    value
        .get("codecs")
        .and_then(serde_json::Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(serde_json::Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl TransportHandle for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), SfuError> {
        self.ensure_open()?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(SfuError::Negotiation(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        for fingerprint in &dtls_parameters.fingerprints {
            let algorithm = fingerprint.algorithm.to_ascii_lowercase();
            if !SUPPORTED_FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(SfuError::Negotiation(format!(
                    "unsupported fingerprint algorithm {}",
                    fingerprint.algorithm
                )));
            }
            if fingerprint.value.is_empty() {
                return Err(SfuError::Negotiation("empty DTLS fingerprint".to_string()));
            }
        }

        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SfuError::Negotiation(format!(
                "transport {} already connected",
                self.id
            )));
        }

        debug!(target: "sfu.engine", transport_id = %self.id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Box<dyn ProducerHandle>, SfuError> {
        self.ensure_open()?;

        let mime_types = codec_mime_types(&rtp_parameters);
        let Some(first) = mime_types.first() else {
            return Err(SfuError::Negotiation(
                "rtpParameters must list at least one codec".to_string(),
            ));
        };
        if !kind.matches_mime_type(first) {
            return Err(SfuError::Negotiation(format!(
                "codec {first} does not match kind {kind}"
            )));
        }
        if !self.supports_mime_type(first) {
            return Err(SfuError::Negotiation(format!(
                "codec {first} not supported by router"
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.producers.lock().await.insert(
            id.clone(),
            ProducerRecord {
                kind,
                rtp_parameters,
            },
        );

        debug!(
            target: "sfu.engine",
            transport_id = %self.id,
            producer_id = %id,
            kind = %kind,
            "Producer created"
        );

        Ok(Box::new(LocalProducer {
            id,
            kind,
            producers: Arc::clone(&self.producers),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Box<dyn ConsumerHandle>, SfuError> {
        self.ensure_open()?;

        let producer = self
            .producers
            .lock()
            .await
            .get(producer_id)
            .cloned()
            .ok_or_else(|| SfuError::UnknownProducer(producer_id.to_string()))?;

        let producer_codec = codec_mime_types(&producer.rtp_parameters)
            .first()
            .map(|s| (*s).to_string())
            .unwrap_or_default();
        let can_consume = codec_mime_types(&rtp_capabilities)
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&producer_codec));
        if !can_consume {
            return Err(SfuError::Negotiation(format!(
                "capabilities cannot consume {producer_codec}"
            )));
        }

        let ssrc = u32::from_be_bytes(self.worker.random_bytes::<4>()?);
        let id = uuid::Uuid::new_v4().to_string();
        let rtp_parameters = json!({
            "codecs": producer.rtp_parameters.get("codecs").cloned().unwrap_or_else(|| json!([])),
            "headerExtensions": [],
            "encodings": [{ "ssrc": ssrc }],
            "rtcp": { "cname": producer_id, "reducedSize": true },
        });

        debug!(
            target: "sfu.engine",
            transport_id = %self.id,
            producer_id = %producer_id,
            consumer_id = %id,
            ssrc,
            "Consumer created"
        );

        Ok(Box::new(LocalConsumer {
            id,
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters,
            worker: Arc::clone(&self.worker),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), SfuError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.worker.ports.lock().await.release(self.port);
        debug!(
            target: "sfu.engine",
            transport_id = %self.id,
            port = self.port,
            "Transport closed"
        );
        Ok(())
    }
}

struct LocalProducer {
    id: String,
    kind: MediaKind,
    producers: ProducerTable,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for LocalProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<(), SfuError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.producers.lock().await.remove(&self.id);
        debug!(target: "sfu.engine", producer_id = %self.id, "Producer closed");
        Ok(())
    }
}

struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    worker: Arc<WorkerShared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerHandle for LocalConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), SfuError> {
        self.worker.ensure_alive()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::Negotiation(format!(
                "consumer {} is closed",
                self.id
            )));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SfuError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
