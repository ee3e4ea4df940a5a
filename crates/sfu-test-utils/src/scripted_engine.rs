//! Fault-injecting engine wrapper.
//!
//! `ScriptedRouting` wraps a real routing context (normally the local
//! engine) and consults a shared [`FaultPlan`] before every call, so tests
//! can make individual engine operations fail at chosen points or run slowly.
//! Every close is counted, including ones the plan makes fail.

use async_trait::async_trait;
use sfu_service::engine::{
    ConsumerHandle, DtlsParameters, MediaKind, ProducerHandle, RoutingContext, RtpCapabilities,
    RtpParameters, TransportDirection, TransportHandle, TransportOptions, TransportParameters,
};
use sfu_service::errors::SfuError;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Which engine operations should fail.
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_create_transport: AtomicBool,
    /// Milliseconds each transport creation takes.
    create_transport_delay_ms: AtomicU64,
    fail_connect: AtomicBool,
    fail_produce: AtomicBool,
    /// Peers whose consume calls fail.
    fail_consume_for: Mutex<HashSet<String>>,
    fail_close: AtomicBool,
    transports_closed: AtomicUsize,
    producers_closed: AtomicUsize,
    consumers_closed: AtomicUsize,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create_transport(&self, fail: bool) {
        self.fail_create_transport.store(fail, Ordering::SeqCst);
    }

    /// Make every transport creation take `delay` before reaching the engine.
    pub fn delay_create_transport(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_transport_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_produce(&self, fail: bool) {
        self.fail_produce.store(fail, Ordering::SeqCst);
    }

    /// Make consumer creation fail on `peer_id`'s transports.
    pub fn fail_consume_for(&self, peer_id: impl Into<String>) {
        self.consume_failures().insert(peer_id.into());
    }

    /// Make every close report failure (the resource is still closed).
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn transports_closed(&self) -> usize {
        self.transports_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn producers_closed(&self) -> usize {
        self.producers_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumers_closed(&self) -> usize {
        self.consumers_closed.load(Ordering::SeqCst)
    }

    fn consume_failures(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.fail_consume_for
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn close_result(&self, counter: &AtomicUsize, resource: &str) -> Result<(), SfuError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SfuError::Internal(format!("scripted {resource} close failure")));
        }
        Ok(())
    }
}

/// Routing context that applies a [`FaultPlan`].
pub struct ScriptedRouting {
    inner: Arc<dyn RoutingContext>,
    plan: Arc<FaultPlan>,
}

impl ScriptedRouting {
    #[must_use]
    pub fn wrap(inner: Arc<dyn RoutingContext>, plan: Arc<FaultPlan>) -> Arc<dyn RoutingContext> {
        Arc::new(Self { inner, plan })
    }
}

#[async_trait]
impl RoutingContext for ScriptedRouting {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Box<dyn TransportHandle>, SfuError> {
        let delay_ms = self.plan.create_transport_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.plan.fail_create_transport.load(Ordering::SeqCst) {
            return Err(SfuError::ResourceExhausted(
                "scripted transport failure".to_string(),
            ));
        }
        let peer_id = options.peer_id.clone();
        let inner = self.inner.create_transport(options).await?;
        Ok(Box::new(ScriptedTransport {
            inner,
            peer_id,
            plan: Arc::clone(&self.plan),
        }))
    }
}

struct ScriptedTransport {
    inner: Box<dyn TransportHandle>,
    peer_id: String,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl TransportHandle for ScriptedTransport {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn direction(&self) -> TransportDirection {
        self.inner.direction()
    }

    fn parameters(&self) -> TransportParameters {
        self.inner.parameters()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), SfuError> {
        if self.plan.fail_connect.load(Ordering::SeqCst) {
            return Err(SfuError::Negotiation("scripted connect failure".to_string()));
        }
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Box<dyn ProducerHandle>, SfuError> {
        if self.plan.fail_produce.load(Ordering::SeqCst) {
            return Err(SfuError::Negotiation("scripted produce failure".to_string()));
        }
        let inner = self.inner.produce(kind, rtp_parameters).await?;
        Ok(Box::new(ScriptedProducer {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Box<dyn ConsumerHandle>, SfuError> {
        if self.plan.consume_failures().contains(&self.peer_id) {
            return Err(SfuError::Negotiation("scripted consume failure".to_string()));
        }
        let inner = self.inner.consume(producer_id, rtp_capabilities).await?;
        Ok(Box::new(ScriptedConsumer {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    async fn close(&self) -> Result<(), SfuError> {
        self.inner.close().await?;
        self.plan
            .close_result(&self.plan.transports_closed, "transport")
    }
}

struct ScriptedProducer {
    inner: Box<dyn ProducerHandle>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl ProducerHandle for ScriptedProducer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    async fn close(&self) -> Result<(), SfuError> {
        self.inner.close().await?;
        self.plan.close_result(&self.plan.producers_closed, "producer")
    }
}

struct ScriptedConsumer {
    inner: Box<dyn ConsumerHandle>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl ConsumerHandle for ScriptedConsumer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn producer_id(&self) -> &str {
        self.inner.producer_id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.inner.rtp_parameters()
    }

    fn paused(&self) -> bool {
        self.inner.paused()
    }

    async fn resume(&self) -> Result<(), SfuError> {
        self.inner.resume().await
    }

    async fn close(&self) -> Result<(), SfuError> {
        self.inner.close().await?;
        self.plan.close_result(&self.plan.consumers_closed, "consumer")
    }
}
