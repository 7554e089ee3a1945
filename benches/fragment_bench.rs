use std::time::Instant;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relaypunch::config::FragmentConfig;
use relaypunch::{DefragBoard, Fragmenter, PushResult, SenderKey, MemberId};

fn bench_fragment(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (512, "512_bytes"),
        (4 * 1024, "4_kb"),
        (64 * 1024, "64_kb"),
        (1024 * 1024, "1_mb"),
    ];

    let fragmenter = Fragmenter::new();
    let mut group = c.benchmark_group("fragment_split");

    for (size, name) in sizes {
        let payload = Bytes::from(vec![0xA5; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| fragmenter.split(black_box(payload.clone()), black_box(1400)))
        });
    }

    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let size = 64 * 1024;
    let fragmenter = Fragmenter::new();
    let payload = Bytes::from(vec![0x5A; size]);

    let mut group = c.benchmark_group("fragment_reassemble");
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("64_kb_reverse_order", |b| {
        b.iter_batched(
            || {
                let mut fragments = fragmenter.split(payload.clone(), 1400).unwrap();
                fragments.reverse();
                (DefragBoard::new(FragmentConfig::default()), fragments)
            },
            |(mut board, fragments)| {
                let now = Instant::now();
                let key = SenderKey::Member(MemberId(1));
                for fragment in &fragments {
                    if let PushResult::Complete(data) = board.push_datagram(fragment, key, now) {
                        black_box(data);
                    }
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_fragment, bench_reassemble);
criterion_main!(benches);
