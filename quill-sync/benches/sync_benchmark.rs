use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use quill_sync::broadcast::BroadcastGroup;
use quill_sync::presence::{dedupe_peers, AwarenessEntry, AwarenessMap, AwarenessUpdate, CursorRange, PeerInfo, PresenceState};
use quill_sync::protocol::SyncMessage;
use quill_sync::DocumentReplica;
use std::sync::Arc;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical keystroke-sized update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(7), black_box(doc), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(7, Uuid::new_v4(), vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn awareness_states(count: u64) -> AwarenessMap {
    let mut map = AwarenessMap::new();
    let update = AwarenessUpdate {
        entries: (1..=count)
            .map(|i| {
                // A quarter of the connections are duplicate tabs
                let person = i % (count * 3 / 4).max(1);
                AwarenessEntry {
                    client_id: i,
                    clock: 1,
                    state: Some(PresenceState {
                        user: Some(PeerInfo::new(format!("user-{person}"), (person % 360) as u16)),
                        cursor: Some(CursorRange { anchor: i as u32, head: i as u32 }),
                    }),
                }
            })
            .collect(),
    };
    map.apply_update(&update);
    map
}

fn bench_awareness_encode(c: &mut Criterion) {
    let snapshot = awareness_states(20).snapshot();

    c.bench_function("awareness_encode_20_peers", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(black_box(1), Uuid::nil(), black_box(&snapshot)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_dedupe_peers(c: &mut Criterion) {
    let small = awareness_states(10);
    let large = awareness_states(200);

    c.bench_function("dedupe_10_states", |b| {
        b.iter(|| black_box(dedupe_peers(black_box(&small).iter(), Some(1))))
    });
    c.bench_function("dedupe_200_states", |b| {
        b.iter(|| black_box(dedupe_peers(black_box(&large).iter(), Some(1))))
    });
}

fn bench_local_edit(c: &mut Criterion) {
    c.bench_function("replica_type_100_chars", |b| {
        b.iter(|| {
            let (mut replica, mut outbound) = DocumentReplica::new();
            for i in 0..100u32 {
                replica.local_edit(i..i, "x").unwrap();
            }
            while let Ok(update) = outbound.try_recv() {
                black_box(update);
            }
        })
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let (mut source, mut outbound) = DocumentReplica::new();
    for i in 0..100u32 {
        source.local_edit(i..i, "y").unwrap();
    }
    let mut updates = Vec::new();
    while let Ok(update) = outbound.try_recv() {
        updates.push(update);
    }

    c.bench_function("replica_merge_100_updates", |b| {
        b.iter(|| {
            let (mut replica, _outbound) = DocumentReplica::new();
            for update in &updates {
                replica.apply_remote_update(black_box(update)).unwrap();
            }
            black_box(replica.content_len().unwrap());
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let _receivers: Vec<_> = rt.block_on(async {
        let mut rxs = Vec::new();
        for i in 0..10 {
            rxs.push(group.join(i).await);
        }
        rxs
    });
    let bytes = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_10_members", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(1, bytes.clone()));
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_dedupe_peers,
    bench_local_edit,
    bench_remote_merge,
    bench_broadcast_fanout,
);
criterion_main!(benches);
