use criterion::{criterion_group, criterion_main, Criterion};
use parley_sync::{
    Direction, EventBus, Filter, InboundEvent, MessageEntry, MessageId, ReadTracker,
    DeliveryReconciler, ScrollGeometry, ThreadContext, ThreadKey, TimelineStore,
};
use std::hint::black_box;

fn entry(id: u64) -> MessageEntry {
    let direction = if id % 3 == 0 { Direction::Outgoing } else { Direction::Incoming };
    MessageEntry::new(
        MessageId(id),
        ThreadKey::Chat(1),
        direction,
        "<div class=\"msg\">hello</div>",
    )
}

fn message_new(id: u64) -> InboundEvent {
    InboundEvent::MessageNew {
        chat_id: Some(1),
        other_username: None,
        message_id: Some(MessageId(id)),
        html: "<div class=\"msg\">hello</div>".into(),
        incoming: true,
        inbox_html: None,
        unread_total: Some(0),
    }
}

fn bench_timeline_append(c: &mut Criterion) {
    c.bench_function("timeline_append_1K", |b| {
        b.iter(|| {
            let mut store = TimelineStore::new();
            for id in 0..1000 {
                black_box(store.append(entry(id)));
            }
            black_box(store.len());
        })
    });
}

fn bench_timeline_duplicates(c: &mut Criterion) {
    let mut store = TimelineStore::new();
    for id in 0..1000 {
        store.append(entry(id));
    }

    c.bench_function("timeline_duplicate_1K", |b| {
        b.iter(|| {
            for id in 0..1000 {
                black_box(store.append(entry(black_box(id))));
            }
        })
    });
}

fn bench_read_boundary(c: &mut Criterion) {
    c.bench_function("timeline_read_boundary_1K", |b| {
        b.iter(|| {
            let mut store = TimelineStore::new();
            for id in 0..1000 {
                store.append(entry(id));
            }
            black_box(store.apply_read_boundary(MessageId(black_box(999))));
        })
    });
}

fn bench_reconciler_inbound(c: &mut Criterion) {
    let geometry = ScrollGeometry::new(1000.0, 400.0, 600.0);

    c.bench_function("reconciler_inbound_1K", |b| {
        b.iter(|| {
            let mut view =
                DeliveryReconciler::new(ThreadContext::chat(1, 2), 4.0, 10, "/messages/");
            view.open();
            for id in 0..1000 {
                black_box(view.handle_inbound(message_new(id), &geometry));
            }
        })
    });
}

fn bench_read_tracker(c: &mut Criterion) {
    c.bench_function("read_tracker_request_1K", |b| {
        b.iter(|| {
            let mut tracker = ReadTracker::default();
            for id in 0..1000 {
                if tracker.request(MessageId(id)).is_some() {
                    black_box(tracker.on_attempt(true));
                }
            }
        })
    });
}

fn bench_bus_fanout(c: &mut Criterion) {
    let bus = EventBus::new(2048);
    let mut subs: Vec<_> = (0..10).map(|_| bus.subscribe(Filter::all())).collect();

    c.bench_function("bus_publish_1K_x10", |b| {
        b.iter(|| {
            for id in 0..1000 {
                bus.publish_inbound(message_new(id));
            }
            for sub in &mut subs {
                while let Some(event) = sub.try_recv() {
                    black_box(event);
                }
            }
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = message_new(42).encode().unwrap();

    c.bench_function("frame_decode_message_new", |b| {
        b.iter(|| {
            black_box(InboundEvent::decode(black_box(&frame)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_timeline_append,
    bench_timeline_duplicates,
    bench_read_boundary,
    bench_reconciler_inbound,
    bench_read_tracker,
    bench_bus_fanout,
    bench_frame_decode,
);
criterion_main!(benches);
