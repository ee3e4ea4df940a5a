//! # SFU Test Utilities
//!
//! Shared test utilities for the Study Room SFU service.
//!
//! ## Modules
//!
//! - `recording_notifier` - `Notifier` that records every event for assertions
//! - `scripted_engine` - Routing context wrapper that injects engine failures
//! - `fixtures` - Engine, registry and payload fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = TestEngine::start().await;
//!     let registry = engine.registry();
//!
//!     let alice = RecordingNotifier::new();
//!     let room = registry.get_or_create("r1".to_string()).await.unwrap();
//!     room.add_peer("alice".to_string(), alice.clone(), None).await.unwrap();
//!
//!     assert!(alice.events().is_empty());
//! }
//! ```
//!
//! ## Fault Injection
//!
//! ```rust,ignore
//! let plan = FaultPlan::new();
//! let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
//!
//! plan.fail_consume_for("bob");
//! // produce still succeeds; bob is skipped and gets no new-consumer
//! ```

pub mod fixtures;
pub mod recording_notifier;
pub mod scripted_engine;

// Re-export commonly used items
pub use fixtures::*;
pub use recording_notifier::*;
pub use scripted_engine::*;
