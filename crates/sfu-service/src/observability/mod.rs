//! Observability for the SFU service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded (see [`metrics`]).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_rooms_active` | Gauge | none |
//! | `sfu_peers_active` | Gauge | none |
//! | `sfu_producers_created_total` | Counter | `kind` |
//! | `sfu_consumers_created_total` | Counter | none |
//! | `sfu_cleanup_failures_total` | Counter | `resource` |
//! | `sfu_signaling_requests_total` | Counter | `method`, `outcome` |
//! | `sfu_signaling_latency_seconds` | Histogram | `method` |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `sfu_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
