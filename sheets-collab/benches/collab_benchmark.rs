use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use sheets_collab::protocol::{
    CellPosition, CellUpdate, CursorMove, Envelope, Message, PresenceJoin, SyncResponse, UserSnapshot,
};
use sheets_collab::router::EventRouter;

fn cursor_frame(user: usize, row: u32) -> String {
    Envelope::new(
        "system",
        Message::CursorMove(CursorMove {
            row,
            column: 3,
            user_id: Some(format!("user-{user}")),
            email: None,
        }),
    )
    .encode()
    .unwrap()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut envelope = Envelope::new(
        "u1",
        Message::CellUpdate(CellUpdate {
            row: 12,
            column: 4,
            value: json!("=SUM(A1:A10)"),
            formula: Some("=SUM(A1:A10)".into()),
            user_id: None,
        }),
    );
    envelope.stamp();

    c.bench_function("envelope_encode_cell_update", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let frame = cursor_frame(1, 10);

    c.bench_function("envelope_decode_cursor", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_decode_sync_response_100_users(c: &mut Criterion) {
    let users = (0..100)
        .map(|i| UserSnapshot {
            user_id: format!("user-{i}"),
            email: format!("user-{i}@example.com"),
            cursor_position: Some(CellPosition::new(i, i % 26)),
            selection_range: None,
            last_activity: None,
        })
        .collect();
    let frame = Envelope::new(
        "system",
        Message::SyncResponse(SyncResponse {
            workbook_id: "wb".into(),
            worksheet_id: "ws".into(),
            active_users: users,
        }),
    )
    .encode()
    .unwrap();

    c.bench_function("envelope_decode_sync_100_users", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_route_cursor_storm(c: &mut Criterion) {
    let mut router = EventRouter::new("wb", "ws", 1024);
    for i in 0..50 {
        router.dispatch(Envelope::new(
            "system",
            Message::PresenceJoin(PresenceJoin {
                user_id: format!("user-{i}"),
                email: String::new(),
                connection_id: None,
                active_users: None,
            }),
        ));
    }
    let frames: Vec<String> = (0..1000).map(|i| cursor_frame(i % 50, (i % 200) as u32)).collect();

    c.bench_function("route_1000_cursor_frames_50_users", |b| {
        b.iter(|| {
            for frame in &frames {
                black_box(router.route_frame(frame).unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_decode_sync_response_100_users,
    bench_route_cursor_storm,
);

criterion_main!(benches);
