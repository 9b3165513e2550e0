//! Benchmark for NotificationHub fan-out

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use schema_keeper::models::{NotificationEvent, NotificationKind};
use schema_keeper::routes::metrics::Metrics;
use schema_keeper::services::notifications::{NotificationChannel, NotificationHub, PushEvent};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn progress_event(user_id: &str) -> NotificationEvent {
    NotificationEvent::new(
        Uuid::new_v4(),
        NotificationKind::Progress,
        user_id,
        json!({"stage": "fetch_metadata", "percentage": 60, "message": "Fetching schema metadata"}),
    )
}

fn drain(channels: &mut [NotificationChannel]) {
    for channel in channels.iter_mut() {
        while channel.try_recv().is_some() {}
    }
}

fn bench_notify_user(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify_user");

    for channels_per_user in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(channels_per_user as u64));
        group.bench_function(format!("{}_channels", channels_per_user), |b| {
            let hub = NotificationHub::new(Arc::new(Metrics::new()));
            let mut channels: Vec<_> = (0..channels_per_user).map(|_| hub.register("u1")).collect();
            let event = progress_event("u1");
            b.iter(|| {
                black_box(hub.notify(black_box(&event)));
                drain(&mut channels);
            });
        });
    }

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("heartbeat_1000_users", |b| {
        let hub = NotificationHub::new(Arc::new(Metrics::new()));
        let mut channels: Vec<_> = (0..1000).map(|i| hub.register(&format!("user-{}", i))).collect();
        b.iter(|| {
            black_box(hub.broadcast(PushEvent::new("heartbeat", json!({}))));
            drain(&mut channels);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_notify_user, bench_broadcast);
criterion_main!(benches);
