use criterion::{criterion_group, criterion_main, Criterion};
use junction_collab::broadcast::{Frame, SessionRegistry};
use junction_collab::presence::{CursorBoard, CursorThrottle};
use junction_collab::protocol::{decode_payload, encode_payload, CursorPayload, WireMessage};
use junction_collab::replica::{LwwReplica, NodeStatus, Replica, YrsReplica};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn bench_payload_encode(c: &mut Criterion) {
    let delta = vec![7u8; 64];

    c.bench_function("payload_encode_64B", |b| {
        b.iter(|| black_box(encode_payload(black_box(&delta))))
    });
}

fn bench_payload_decode(c: &mut Criterion) {
    let text = encode_payload(&[7u8; 64]);

    c.bench_function("payload_decode_64B", |b| {
        b.iter(|| black_box(decode_payload(black_box(&text)).unwrap()))
    });
}

fn bench_cursor_frame(c: &mut Criterion) {
    c.bench_function("cursor_frame_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::cursor(black_box("User-1"), 2, black_box(100.0), black_box(200.0));
            black_box(msg.to_text().unwrap());
        })
    });

    let text = WireMessage::cursor("User-1", 2, 100.0, 200.0).to_text().unwrap();
    c.bench_function("cursor_frame_parse", |b| {
        b.iter(|| black_box(WireMessage::parse(black_box(&text)).unwrap()))
    });
}

fn bench_changes_frame_parse(c: &mut Criterion) {
    let mut replica = YrsReplica::initial();
    let delta = replica
        .set_status("Junction2", NodeStatus::Closed)
        .unwrap()
        .unwrap();
    let text = WireMessage::changes("User-1", &delta).to_text().unwrap();

    c.bench_function("changes_frame_parse_and_decode", |b| {
        b.iter(|| {
            let msg = WireMessage::parse(black_box(&text)).unwrap();
            black_box(msg.changes_bytes().unwrap());
        })
    });
}

fn bench_yrs_set_status(c: &mut Criterion) {
    let mut replica = YrsReplica::initial();
    let mut status = NodeStatus::Open;

    c.bench_function("yrs_set_status", |b| {
        b.iter(|| {
            status = status.toggled();
            black_box(replica.set_status("Junction1", status).unwrap());
        })
    });
}

fn bench_yrs_apply_delta(c: &mut Criterion) {
    let base = YrsReplica::initial().save().unwrap();
    let mut author = YrsReplica::empty();
    author.merge_snapshot(&base).unwrap();
    let delta = author
        .set_status("Junction3", NodeStatus::Closed)
        .unwrap()
        .unwrap();

    c.bench_function("yrs_apply_delta", |b| {
        b.iter(|| {
            let mut replica = YrsReplica::empty();
            replica.merge_snapshot(&base).unwrap();
            replica.apply_delta(black_box(&delta)).unwrap();
            black_box(replica.status("Junction3"));
        })
    });
}

fn bench_lww_set_status(c: &mut Criterion) {
    let mut replica = LwwReplica::initial();
    let mut status = NodeStatus::Open;

    c.bench_function("lww_set_status", |b| {
        b.iter(|| {
            status = status.toggled();
            black_box(replica.set_status("Junction1", status).unwrap());
        })
    });
}

fn bench_fan_out_100_sessions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = SessionRegistry::new();
    let mut receivers = Vec::new();
    let origin = rt.block_on(async {
        let (tx, rx) = mpsc::channel(1);
        receivers.push(rx);
        let origin = registry.register(tx).await;
        for _ in 0..100 {
            let (tx, rx) = mpsc::channel(1024);
            registry.register(tx).await;
            receivers.push(rx);
        }
        origin
    });
    let frame: Frame = Arc::from(
        WireMessage::cursor("User-1", 0, 1.0, 2.0)
            .to_text()
            .unwrap()
            .as_str(),
    );

    c.bench_function("fan_out_100_sessions", |b| {
        b.iter(|| {
            let result = rt.block_on(registry.broadcast_except(&origin, black_box(&frame)));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            black_box(result);
        })
    });
}

fn bench_cursor_throttle(c: &mut Criterion) {
    let mut throttle = CursorThrottle::new(Duration::from_millis(80));
    let now = Instant::now();

    c.bench_function("cursor_throttle_try_acquire", |b| {
        b.iter(|| black_box(throttle.try_acquire(black_box(now))))
    });
}

fn bench_cursor_board_tick(c: &mut Criterion) {
    let mut board = CursorBoard::new("local", Duration::from_secs(30));
    let now = Instant::now();
    for i in 0..20 {
        let payload = CursorPayload {
            profile: (i % 5) as u8,
            x: i as f64 * 10.0,
            y: i as f64 * 5.0,
        };
        board.apply(&format!("User-{i}"), &payload, now);
    }

    c.bench_function("cursor_board_advance_20", |b| {
        b.iter(|| {
            board.advance(black_box(0.016));
            black_box(board.render_data());
        })
    });
}

criterion_group!(
    benches,
    bench_payload_encode,
    bench_payload_decode,
    bench_cursor_frame,
    bench_changes_frame_parse,
    bench_yrs_set_status,
    bench_yrs_apply_delta,
    bench_lww_set_status,
    bench_fan_out_100_sessions,
    bench_cursor_throttle,
    bench_cursor_board_tick,
);

criterion_main!(benches);
