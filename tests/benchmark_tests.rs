//! Performance benchmarks for the replication hot paths

use bincode::{deserialize, serialize};
use client::replica::ReplicaState;
use rand::seq::SliceRandom;
use rand::Rng;
use server::client_manager::ClientManager;
use server::AuthoritySession;
use shared::{
    ChangeNotification, FieldSelector, FieldValue, GridPos, Mutation, MutationRequest, Packet,
    ParticipantId, RequestSequencer, TileKind, TileMap,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Benchmarks applying health mutations with fan-out to many observers
#[test]
fn benchmark_mutation_fan_out() {
    let mut session = AuthoritySession::default();
    let mut subscriptions: Vec<_> = (1..=16)
        .map(|id| {
            let participant = ParticipantId(id);
            let subscription = session.register_observer(participant);
            session.join(participant);
            subscription
        })
        .collect();
    for subscription in &mut subscriptions {
        subscription.drain();
    }

    let target = session.spawn_health_entity(1_000_000.0);
    let mut sequencer = RequestSequencer::new(ParticipantId::AUTHORITY);

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let request = sequencer.request(FieldSelector::Health(target), Mutation::HealthDelta(-1.0));
        session.request_mutation(request).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Mutation fan-out: {} writes to {} observers in {:?} ({:.2} μs/write)",
        iterations,
        subscriptions.len(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    for subscription in &mut subscriptions {
        // Spawn notification plus one per write
        assert_eq!(subscription.drain().len(), iterations + 1);
    }
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks health propagation across a large structure
#[test]
fn benchmark_group_propagation() {
    let mut tiles = TileMap::new();
    let groups: Vec<_> = (0..50)
        .map(|i| tiles.add_building(GridPos::new(i * 10, 0)))
        .collect();

    let iterations = 10_000;
    let mut rng = rand::thread_rng();
    let start = Instant::now();

    for _ in 0..iterations {
        let group = groups[rng.gen_range(0..groups.len())];
        let _ = tiles.update_group_health(group, rng.gen_range(-5.0..5.0));
    }

    let duration = start.elapsed();
    println!(
        "Group propagation: {} updates in {:?} ({:.2} μs/update)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    for group in &groups {
        let record = tiles.group(*group).unwrap();
        for cell in &record.members {
            assert_eq!(tiles.tile_health(cell), Some(record.shared_health.current));
        }
    }
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks replica reconciliation of a long notification stream
#[test]
fn benchmark_replica_reconcile() {
    let notifications: Vec<ChangeNotification> = (1..=50_000u64)
        .map(|revision| ChangeNotification {
            field: FieldSelector::TimerCount,
            new_value: FieldValue::Int(revision as i64),
            originator: ParticipantId::AUTHORITY,
            revision,
        })
        .collect();

    let mut replica = ReplicaState::new();
    let start = Instant::now();

    for notification in notifications {
        replica.predict(FieldSelector::TimerCount, FieldValue::Int(-1));
        replica.reconcile(notification);
    }

    let duration = start.elapsed();
    println!("Replica reconcile: 50000 notifications in {:?}", duration);

    assert_eq!(replica.int(FieldSelector::TimerCount), Some(50_000));
    assert_eq!(replica.corrections(), 50_000);
    assert!(duration.as_millis() < 1000);
}

/// Stress tests receipt ordering with many interleaved participants
#[test]
fn stress_test_receipt_ordering() {
    let mut manager = ClientManager::new(32, Duration::from_secs(5));
    let ids: Vec<ParticipantId> = (0..32)
        .map(|i| {
            let addr: SocketAddr = format!("127.0.0.1:{}", 42000 + i).parse().unwrap();
            manager.add_client(addr).unwrap()
        })
        .collect();

    let mut incoming: Vec<MutationRequest> = Vec::new();
    for id in &ids {
        for sequence in 1..=50 {
            incoming.push(MutationRequest::new(
                *id,
                sequence,
                FieldSelector::ReadyCount,
                Mutation::Delta(0),
            ));
        }
    }
    incoming.shuffle(&mut rand::thread_rng());

    let start = Instant::now();
    for request in incoming {
        manager.add_request(request.requester, request);
    }
    let ordered = manager.get_chronological_requests();
    let duration = start.elapsed();

    println!("Receipt ordering: {} requests in {:?}", ordered.len(), duration);

    assert_eq!(ordered.len(), 32 * 50);
    for id in &ids {
        let sequences: Vec<u32> = ordered
            .iter()
            .filter(|(client, _)| client == id)
            .map(|(_, request)| request.sequence)
            .collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<u32>>());
    }
    assert!(duration.as_millis() < 500);
}

/// Benchmarks serializing a full snapshot
#[test]
fn benchmark_snapshot_serialization() {
    let mut session = AuthoritySession::default();
    for x in 0..200 {
        session.spawn_structure(TileKind::Fence, GridPos::new(x, 0));
    }
    let fields = session.snapshot();

    let iterations = 100;
    let start = Instant::now();

    for tick in 0..iterations {
        for packet in server::network::snapshot_packets(tick, fields.clone()) {
            let bytes = serialize(&packet).unwrap();
            assert!(bytes.len() < shared::MAX_DATAGRAM_SIZE);
            let _: Packet = deserialize(&bytes).unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "Snapshot serialization: {} snapshots of {} fields in {:?}",
        iterations,
        fields.len(),
        duration
    );
    assert!(duration.as_millis() < 5000);
}
