use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pi_mediaserver::dmx::ChannelGroup;
use pi_mediaserver::mock::frame_at;

fn bench_update(c: &mut Criterion) {
    let steady = frame_at(1, &[1, 0, 0, 255, 255, 128, 128, 128, 128, 0, 128, 128, 128]);
    let moving: Vec<_> = (0..=255u8)
        .map(|v| frame_at(1, &[1, 0, 0, v, 255, v, 128, 128, 128, 0, 128, v, 128]))
        .collect();

    c.bench_function("channel_group_steady", |b| {
        let mut group = ChannelGroup::new(1);
        b.iter(|| {
            group.update(black_box(&steady));
            black_box(group.has_relevant_change())
        })
    });

    c.bench_function("channel_group_fader", |b| {
        let mut group = ChannelGroup::new(1);
        let mut frames = moving.iter().cycle();
        b.iter(|| {
            if let Some(frame) = frames.next() {
                group.update(black_box(frame));
            }
            black_box(group.player_state())
        })
    });
}

criterion_group!(benches, bench_update);
criterion_main!(benches);
