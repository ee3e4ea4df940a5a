//! Media engine bootstrap.
//!
//! Brings up the process-wide routing context on top of a worker and
//! turns the worker's `died` signal into a process-fatal event. There is
//! no in-process recovery: once the worker is gone the process must exit
//! and be restarted by its supervisor.

use super::{default_media_codecs, MediaWorker, RoutingContext, RtpCodecCapability};
use crate::errors::SfuError;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Router settings for the shared routing context.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
        }
    }
}

/// A running media engine.
pub struct EngineRuntime {
    /// Shared routing context, read-only across rooms.
    pub routing: Arc<dyn RoutingContext>,
    /// Cancelled after the worker died and the failure was logged.
    pub fatal: CancellationToken,
    watchdog: JoinHandle<()>,
}

impl EngineRuntime {
    /// Whether the engine has suffered a fatal failure.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.fatal.is_cancelled()
    }

    /// Stop watching the worker (normal shutdown).
    pub fn stop_watchdog(&self) {
        self.watchdog.abort();
    }
}

pub struct MediaEngineBootstrap;

impl MediaEngineBootstrap {
    /// Create the shared routing context and start the death watchdog.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnavailable` if the worker is already dead or the
    /// router cannot be created.
    pub async fn initialize(
        worker: Arc<dyn MediaWorker>,
        settings: RouterSettings,
    ) -> Result<EngineRuntime, SfuError> {
        let died = worker.died();
        if died.is_cancelled() {
            return Err(SfuError::EngineUnavailable(format!(
                "worker {} is not running",
                worker.id()
            )));
        }

        let routing = worker
            .create_router(settings.media_codecs)
            .await
            .map_err(|e| match e {
                SfuError::EngineUnavailable(_) => e,
                other => SfuError::EngineUnavailable(format!("router creation failed: {other}")),
            })?;

        info!(
            target: "sfu.engine",
            worker_id = %worker.id(),
            router_id = %routing.id(),
            "Media engine initialized"
        );

        let fatal = CancellationToken::new();
        let watchdog = tokio::spawn(watch_worker(
            worker.id().to_string(),
            died,
            fatal.clone(),
        ));

        Ok(EngineRuntime {
            routing,
            fatal,
            watchdog,
        })
    }
}

async fn watch_worker(worker_id: String, died: CancellationToken, fatal: CancellationToken) {
    died.cancelled().await;
    error!(
        target: "sfu.engine",
        worker_id = %worker_id,
        "Media worker died - process must restart"
    );
    fatal.cancel();
}
