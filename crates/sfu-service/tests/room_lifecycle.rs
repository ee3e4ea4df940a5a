//! Room lifecycle tests against the local media engine.
//!
//! Covers the room state machine end to end through the registry:
//! - Join/leave notifications and self-removal from the registry
//! - Producer fan-out and catch-up consumers (exactly once per peer)
//! - Cleanup cascades, including partial engine failures
//! - Negotiation failures leaving room state untouched

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sfu_service::actors::{RoomActorHandle, TransportDescriptor};
use sfu_service::engine::{MediaKind, TransportDirection};
use sfu_service::errors::SfuError;
use sfu_test_utils::{
    audio_only_capabilities, bad_dtls_parameters, dtls_parameters, rtp_parameters, FaultPlan,
    RecordingNotifier, TestEngine,
};

// ============================================================================
// Helpers
// ============================================================================

async fn join(room: &RoomActorHandle, peer_id: &str) -> Arc<RecordingNotifier> {
    let notifier = RecordingNotifier::new();
    room.add_peer(peer_id.to_string(), notifier.clone(), None)
        .await
        .unwrap();
    notifier
}

/// Create and connect a send transport.
async fn send_transport(room: &RoomActorHandle, peer_id: &str) -> String {
    let transport = room
        .create_transport(peer_id.to_string(), TransportDirection::Send)
        .await
        .unwrap();
    room.connect_transport(
        peer_id.to_string(),
        transport.transport_id.clone(),
        dtls_parameters(),
    )
    .await
    .unwrap();
    transport.transport_id
}

async fn recv_transport(room: &RoomActorHandle, peer_id: &str) -> TransportDescriptor {
    room.create_transport(peer_id.to_string(), TransportDirection::Recv)
        .await
        .unwrap()
}

async fn produce(room: &RoomActorHandle, peer_id: &str, transport_id: &str, kind: MediaKind) -> String {
    room.produce(
        peer_id.to_string(),
        transport_id.to_string(),
        kind,
        rtp_parameters(kind),
    )
    .await
    .unwrap()
}

async fn consumer_count(room: &RoomActorHandle, peer_id: &str) -> usize {
    let state = room.get_state().await.unwrap();
    state.peer(peer_id).map_or(0, |p| p.consumers.len())
}

// ============================================================================
// Join / leave / registry
// ============================================================================

#[tokio::test]
async fn test_two_peer_room_scenario() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("R1".to_string()).await.unwrap();

    // alice alone: room exists, nobody notified
    let alice = join(&room, "alice").await;
    assert_eq!(room.get_state().await.unwrap().peers.len(), 1);
    assert!(alice.events().is_empty());

    // bob joins: alice hears about it, bob hears nothing about himself
    let bob = join(&room, "bob").await;
    assert_eq!(alice.peers_joined(), vec!["bob".to_string()]);
    assert!(bob.peers_joined().is_empty());

    // alice produces video: bob gets exactly one consumer, alice none
    recv_transport(&room, "bob").await;
    let transport_id = send_transport(&room, "alice").await;
    let producer_id = produce(&room, "alice", &transport_id, MediaKind::Video).await;

    let consumers = bob.new_consumers();
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].producer_id, producer_id);
    assert_eq!(consumers[0].peer_id, "alice");
    assert!(alice.new_consumers().is_empty());

    // alice leaves: bob notified, room survives with bob
    assert!(room.remove_peer("alice".to_string()).await.unwrap());
    assert_eq!(bob.peers_left(), vec!["alice".to_string()]);
    assert!(registry.get("R1".to_string()).await.is_ok());
    assert_eq!(room.get_state().await.unwrap().peers.len(), 1);

    // bob leaves: room is gone from the registry
    assert!(room.remove_peer("bob".to_string()).await.unwrap());
    let result = registry.get("R1".to_string()).await;
    assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

    registry.cancel();
}

#[tokio::test]
async fn test_remove_peer_twice_is_noop() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;

    assert!(room.remove_peer("alice".to_string()).await.unwrap());
    assert!(!room.remove_peer("alice".to_string()).await.unwrap());
    assert_eq!(bob.peers_left().len(), 1);

    registry.cancel();
}

#[tokio::test]
async fn test_rejoin_after_eviction_gets_fresh_room() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();

    let room = registry.get_or_create("r1".to_string()).await.unwrap();
    join(&room, "alice").await;
    room.remove_peer("alice".to_string()).await.unwrap();

    // Lookups wait out the close check
    assert!(matches!(
        registry.get("r1".to_string()).await,
        Err(SfuError::RoomNotFound(_))
    ));

    // The evicted handle refuses new peers
    let stale = room
        .add_peer("bob".to_string(), RecordingNotifier::new(), None)
        .await;
    assert!(matches!(stale, Err(SfuError::RoomClosed(_))));

    let fresh = registry.get_or_create("r1".to_string()).await.unwrap();
    assert_ne!(fresh.instance_id(), room.instance_id());
    join(&fresh, "bob").await;
    assert_eq!(fresh.get_state().await.unwrap().peers.len(), 1);

    registry.cancel();
}

#[tokio::test]
async fn test_registry_counts_rooms_and_peers() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();

    let r1 = registry.get_or_create("r1".to_string()).await.unwrap();
    let r2 = registry.get_or_create("r2".to_string()).await.unwrap();
    join(&r1, "alice").await;
    join(&r1, "bob").await;
    join(&r2, "carol").await;

    let status = registry.get_status().await.unwrap();
    assert_eq!(status.room_count, 2);
    assert_eq!(status.peer_count, 3);

    r2.remove_peer("carol".to_string()).await.unwrap();
    assert!(registry.get("r2".to_string()).await.is_err());
    let status = registry.get_status().await.unwrap();
    assert_eq!(status.room_count, 1);
    assert_eq!(status.peer_count, 2);

    registry.cancel();
}

#[tokio::test]
async fn test_busy_room_does_not_stall_other_rooms() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();

    let r1 = registry.get_or_create("r1".to_string()).await.unwrap();
    join(&r1, "alice").await;
    plan.delay_create_transport(Duration::from_secs(3));

    // r1 empties and refills, then sits in a slow engine call while its
    // close check is still queued behind it
    let busy = async {
        let (removed, added, transport) = tokio::join!(
            r1.remove_peer("alice".to_string()),
            r1.add_peer("bob".to_string(), RecordingNotifier::new(), None),
            r1.create_transport("bob".to_string(), TransportDirection::Send),
        );
        removed.unwrap();
        added.unwrap();
        transport
    };
    let other = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        let r2 = registry.get_or_create("r2".to_string()).await;
        (r2, started.elapsed())
    };
    let (transport, (r2, elapsed)) = tokio::join!(busy, other);

    assert!(r2.is_ok());
    assert!(
        elapsed < Duration::from_secs(1),
        "r2 lookup waited {elapsed:?}"
    );
    assert!(transport.is_ok());

    // r1 still had bob when the check ran, so it stays registered
    let same = registry.get("r1".to_string()).await.unwrap();
    assert_eq!(same.instance_id(), r1.instance_id());

    registry.cancel();
}

// ============================================================================
// Fan-out and catch-up
// ============================================================================

#[tokio::test]
async fn test_fan_out_one_consumer_per_other_peer() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    let a = join(&room, "a").await;
    let b = join(&room, "b").await;
    let c = join(&room, "c").await;
    for peer in ["a", "b", "c"] {
        recv_transport(&room, peer).await;
    }

    let transport_id = send_transport(&room, "a").await;
    let producer_id = produce(&room, "a", &transport_id, MediaKind::Video).await;

    assert_eq!(b.new_consumers().len(), 1);
    assert_eq!(c.new_consumers().len(), 1);
    assert!(a.new_consumers().is_empty());
    assert_eq!(consumer_count(&room, "a").await, 0);
    assert_eq!(consumer_count(&room, "b").await, 1);
    assert_eq!(consumer_count(&room, "c").await, 1);

    let state = room.get_state().await.unwrap();
    assert_eq!(state.peer("b").unwrap().consumers[0].producer_id, producer_id);

    registry.cancel();
}

#[tokio::test]
async fn test_late_joiner_catches_up_on_existing_producers() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    join(&room, "carol").await;
    let alice_send = send_transport(&room, "alice").await;
    let carol_send = send_transport(&room, "carol").await;
    let mut existing = HashSet::new();
    existing.insert(produce(&room, "alice", &alice_send, MediaKind::Audio).await);
    existing.insert(produce(&room, "alice", &alice_send, MediaKind::Video).await);
    existing.insert(produce(&room, "carol", &carol_send, MediaKind::Audio).await);

    let bob = join(&room, "bob").await;
    let recv = recv_transport(&room, "bob").await;

    // One consumer per existing producer, returned to the caller
    let caught_up: HashSet<String> = recv
        .catch_up
        .iter()
        .filter_map(|n| match n {
            sfu_service::signaling::Notification::NewConsumer { producer_id, .. } => {
                Some(producer_id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(caught_up, existing);
    assert_eq!(consumer_count(&room, "bob").await, 3);
    assert!(bob.new_consumers().is_empty());

    // A second receive transport does not duplicate anything
    let second = recv_transport(&room, "bob").await;
    assert!(second.catch_up.is_empty());
    assert_eq!(consumer_count(&room, "bob").await, 3);

    // New producers arrive through normal fan-out, once
    produce(&room, "alice", &alice_send, MediaKind::Video).await;
    assert_eq!(bob.new_consumers().len(), 1);
    assert_eq!(consumer_count(&room, "bob").await, 4);

    registry.cancel();
}

#[tokio::test]
async fn test_peer_without_recv_transport_is_skipped_then_caught_up() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;

    let transport_id = send_transport(&room, "alice").await;
    produce(&room, "alice", &transport_id, MediaKind::Video).await;
    assert!(bob.new_consumers().is_empty());
    assert_eq!(consumer_count(&room, "bob").await, 0);

    let recv = recv_transport(&room, "bob").await;
    assert_eq!(recv.catch_up.len(), 1);
    assert_eq!(consumer_count(&room, "bob").await, 1);

    registry.cancel();
}

#[tokio::test]
async fn test_incompatible_peer_skipped_without_failing_produce() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = RecordingNotifier::new();
    room.add_peer(
        "bob".to_string(),
        bob.clone(),
        Some(audio_only_capabilities()),
    )
    .await
    .unwrap();
    let carol = join(&room, "carol").await;
    recv_transport(&room, "bob").await;
    recv_transport(&room, "carol").await;

    let transport_id = send_transport(&room, "alice").await;
    let result = room
        .produce(
            "alice".to_string(),
            transport_id,
            MediaKind::Video,
            rtp_parameters(MediaKind::Video),
        )
        .await;

    assert!(result.is_ok());
    assert!(bob.new_consumers().is_empty());
    assert_eq!(carol.new_consumers().len(), 1);

    registry.cancel();
}

#[tokio::test]
async fn test_scripted_consume_failure_skips_only_that_peer() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;
    let carol = join(&room, "carol").await;
    recv_transport(&room, "bob").await;
    recv_transport(&room, "carol").await;
    plan.fail_consume_for("bob");

    let transport_id = send_transport(&room, "alice").await;
    produce(&room, "alice", &transport_id, MediaKind::Audio).await;

    assert!(bob.new_consumers().is_empty());
    assert_eq!(carol.new_consumers().len(), 1);

    registry.cancel();
}

#[tokio::test]
async fn test_dead_connection_does_not_block_room() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;
    recv_transport(&room, "bob").await;
    bob.disconnect();

    let transport_id = send_transport(&room, "alice").await;
    produce(&room, "alice", &transport_id, MediaKind::Video).await;

    // Consumer exists even though the event could not be delivered
    assert_eq!(consumer_count(&room, "bob").await, 1);
    assert!(bob.new_consumers().is_empty());

    registry.cancel();
}

// ============================================================================
// Cleanup cascade
// ============================================================================

#[tokio::test]
async fn test_remove_peer_closes_everything_it_touches() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "a").await;
    let b = join(&room, "b").await;
    let c = join(&room, "c").await;
    for peer in ["a", "b", "c"] {
        recv_transport(&room, peer).await;
    }
    let a_send = send_transport(&room, "a").await;
    let b_send = send_transport(&room, "b").await;
    produce(&room, "a", &a_send, MediaKind::Video).await;
    produce(&room, "a", &a_send, MediaKind::Audio).await;
    produce(&room, "b", &b_send, MediaKind::Video).await;

    assert_eq!(consumer_count(&room, "a").await, 1);
    assert_eq!(consumer_count(&room, "b").await, 2);
    assert_eq!(consumer_count(&room, "c").await, 3);

    assert!(room.remove_peer("a".to_string()).await.unwrap());

    // a: 2 transports, 2 producers, 1 consumer; b and c: 2 consumers each
    assert_eq!(plan.transports_closed(), 2);
    assert_eq!(plan.producers_closed(), 2);
    assert_eq!(plan.consumers_closed(), 5);

    assert_eq!(consumer_count(&room, "b").await, 0);
    assert_eq!(consumer_count(&room, "c").await, 1);
    assert_eq!(b.consumers_closed().len(), 2);
    assert_eq!(c.consumers_closed().len(), 2);
    assert_eq!(b.peers_left(), vec!["a".to_string()]);

    let state = room.get_state().await.unwrap();
    assert!(state.peer("a").is_none());

    registry.cancel();
}

#[tokio::test]
async fn test_cleanup_continues_past_close_failures() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;
    recv_transport(&room, "alice").await;
    recv_transport(&room, "bob").await;
    let transport_id = send_transport(&room, "alice").await;
    produce(&room, "alice", &transport_id, MediaKind::Video).await;
    produce(&room, "alice", &transport_id, MediaKind::Audio).await;

    plan.fail_close(true);
    assert!(room.remove_peer("alice".to_string()).await.unwrap());

    // Every close was attempted even though each one reported failure
    assert_eq!(plan.transports_closed(), 2);
    assert_eq!(plan.producers_closed(), 2);
    assert_eq!(plan.consumers_closed(), 2);
    assert_eq!(bob.peers_left(), vec!["alice".to_string()]);
    assert_eq!(room.get_state().await.unwrap().peers.len(), 1);

    registry.cancel();
}

#[tokio::test]
async fn test_disconnect_mid_handshake() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    // Transport requested but never connected
    room.create_transport("alice".to_string(), TransportDirection::Send)
        .await
        .unwrap();

    assert!(room.remove_peer("alice".to_string()).await.unwrap());
    assert_eq!(plan.transports_closed(), 1);
    assert!(matches!(
        registry.get("r1".to_string()).await,
        Err(SfuError::RoomNotFound(_))
    ));

    registry.cancel();
}

#[tokio::test]
async fn test_close_producer_notifies_consumers() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;
    recv_transport(&room, "bob").await;
    let transport_id = send_transport(&room, "alice").await;
    let producer_id = produce(&room, "alice", &transport_id, MediaKind::Video).await;
    let consumer_id = bob.new_consumers()[0].consumer_id.clone();

    room.close_producer("alice".to_string(), producer_id.clone())
        .await
        .unwrap();

    assert_eq!(bob.consumers_closed(), vec![consumer_id]);
    assert_eq!(consumer_count(&room, "bob").await, 0);

    // Already closed
    let again = room
        .close_producer("alice".to_string(), producer_id)
        .await;
    assert!(matches!(again, Err(SfuError::UnknownProducer(_))));

    registry.cancel();
}

// ============================================================================
// Negotiation failures
// ============================================================================

#[tokio::test]
async fn test_rejected_dtls_leaves_transport_unusable() {
    let engine = TestEngine::start().await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let transport = room
        .create_transport("alice".to_string(), TransportDirection::Send)
        .await
        .unwrap();

    let result = room
        .connect_transport(
            "alice".to_string(),
            transport.transport_id.clone(),
            bad_dtls_parameters(),
        )
        .await;
    assert!(matches!(result, Err(SfuError::Negotiation(_))));

    let state = room.get_state().await.unwrap();
    assert!(!state.peer("alice").unwrap().transports[0].connected);

    let result = room
        .produce(
            "alice".to_string(),
            transport.transport_id,
            MediaKind::Video,
            rtp_parameters(MediaKind::Video),
        )
        .await;
    assert!(matches!(result, Err(SfuError::Negotiation(_))));

    registry.cancel();
}

#[tokio::test]
async fn test_rejected_produce_registers_nothing() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    let bob = join(&room, "bob").await;
    recv_transport(&room, "bob").await;
    let transport_id = send_transport(&room, "alice").await;

    plan.fail_produce(true);
    let result = room
        .produce(
            "alice".to_string(),
            transport_id.clone(),
            MediaKind::Video,
            rtp_parameters(MediaKind::Video),
        )
        .await;
    assert!(matches!(result, Err(SfuError::Negotiation(_))));

    let state = room.get_state().await.unwrap();
    assert!(state.peer("alice").unwrap().producers.is_empty());
    assert!(state.peer("bob").unwrap().consumers.is_empty());
    assert!(bob.new_consumers().is_empty());

    // Mismatched kind and codec is rejected by the engine itself
    plan.fail_produce(false);
    let result = room
        .produce(
            "alice".to_string(),
            transport_id,
            MediaKind::Audio,
            rtp_parameters(MediaKind::Video),
        )
        .await;
    assert!(matches!(result, Err(SfuError::Negotiation(_))));

    registry.cancel();
}

#[tokio::test]
async fn test_transport_creation_failure_reported() {
    let plan = FaultPlan::new();
    let engine = TestEngine::start_scripted(Arc::clone(&plan)).await;
    let registry = engine.registry();
    let room = registry.get_or_create("r1".to_string()).await.unwrap();

    join(&room, "alice").await;
    plan.fail_create_transport(true);

    let result = room
        .create_transport("alice".to_string(), TransportDirection::Recv)
        .await;
    assert!(matches!(result, Err(SfuError::ResourceExhausted(_))));

    // Peer stays in the call with zero transports
    let state = room.get_state().await.unwrap();
    assert!(state.peer("alice").unwrap().transports.is_empty());

    registry.cancel();
}
