//! Publishing core benchmarks
//!
//! Measures the hot paths of the subscription and publish machinery.
//!
//! Run with: cargo bench --bench publish_bench

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use spindle_core::address_space::{DataValue, Variant};
use spindle_core::publish::{PublishEngine, PublishRequest, RetentionPolicy};
use spindle_core::sampling::SamplingScheduler;
use spindle_core::session::SessionId;
use spindle_core::subscription::{
    MonitoredItemId, MonitoredItemNotification, Notification, Subscription, SubscriptionId,
    SubscriptionParams,
};

fn params() -> SubscriptionParams {
    SubscriptionParams {
        publishing_interval_ms: 100,
        lifetime_count: 1_000_000,
        max_keep_alive_count: 10,
        max_notifications_per_publish: 0,
        priority: 0,
    }
}

fn notification(t: i64) -> Notification {
    Notification::data_change(
        vec![MonitoredItemNotification {
            item: MonitoredItemId(1),
            value: DataValue::good(Variant::Int64(t), t),
        }],
        t,
    )
}

fn bench_subscription_tick(c: &mut Criterion) {
    c.bench_function("subscription_tick_publish", |b| {
        let mut sub = Subscription::new(SubscriptionId(1), params(), 1024, 16, 0);
        let mut now = 0i64;
        b.iter(|| {
            now += 100;
            sub.enqueue_notification(notification(now));
            black_box(sub.tick(now, true))
        });
    });
}

fn bench_engine_match(c: &mut Criterion) {
    c.bench_function("engine_match_64_subscriptions", |b| {
        let mut engine =
            PublishEngine::for_session(SessionId(1), RetentionPolicy::RetainForTransfer, 256);
        for id in 0..64u32 {
            let mut sub = Subscription::new(SubscriptionId(id), params(), 1024, 16, 0);
            sub.attach(SessionId(1), None);
            engine.adopt(sub);
        }
        let mut now = 0i64;
        let mut handle = 0u32;
        b.iter(|| {
            now += 100;
            for id in 0..64u32 {
                if let Some(sub) = engine.subscription_mut(SubscriptionId(id)) {
                    sub.enqueue_notification(notification(now));
                }
                handle += 1;
                engine.enqueue_request(
                    PublishRequest {
                        handle,
                        timeout_ms: 0,
                    },
                    now,
                );
            }
            black_box(engine.tick(now))
        });
    });
}

fn bench_scheduler_poll(c: &mut Criterion) {
    c.bench_function("scheduler_poll_1000_items", |b| {
        let mut scheduler = SamplingScheduler::new();
        for n in 0..1_000u32 {
            // 10 distinct intervals, 100 items each.
            let interval = i64::from(n % 10 + 1) * 50;
            scheduler.register(MonitoredItemId(n), interval, 0).unwrap();
        }
        let mut now = 0i64;
        b.iter(|| {
            now += 50;
            black_box(scheduler.poll(now))
        });
    });
}

criterion_group!(
    benches,
    bench_subscription_tick,
    bench_engine_match,
    bench_scheduler_poll,
);
criterion_main!(benches);
