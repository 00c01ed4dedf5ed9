//! Timeline assembly on long conversations.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chatreel::frames::{FrameAsset, FrameId};
use chatreel::timeline::{assemble, AssemblyConfig, AudioClip};

fn inputs(turns: usize) -> (Vec<Vec<FrameAsset>>, Vec<Option<AudioClip>>) {
    let groups = (0..turns)
        .map(|turn_index| {
            (0..5)
                .map(|step| FrameAsset {
                    id: FrameId(turn_index * 5 + step),
                    turn_index,
                    is_final_for_turn: step == 4,
                })
                .collect()
        })
        .collect();
    let voices = (0..turns)
        .map(|idx| {
            (idx % 7 != 3).then(|| AudioClip::voice(format!("line_{idx:03}.mp3"), 0.4 + (idx % 11) as f64 * 0.23))
        })
        .collect();
    (groups, voices)
}

fn bench_assemble(c: &mut Criterion) {
    let config = AssemblyConfig {
        fps: 24,
        transition_frames: 5,
        reveal_frame_duration: 1.0 / 24.0,
        default_hold: 1.0,
        inter_turn_pause: 0.2,
        tick_gain: 0.5,
    };
    let tick = AudioClip::tick("tick.mp4", 0.5);

    let mut group = c.benchmark_group("assemble_timeline");
    for turns in [20, 500] {
        let (groups, voices) = inputs(turns);
        group.bench_function(format!("{turns}_turns"), |b| {
            b.iter(|| {
                black_box(
                    assemble(&groups, &voices, Some(&tick), &config).expect("assemble"),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_assemble);
criterion_main!(benches);
