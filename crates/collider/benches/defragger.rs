use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use collider::{Frame, StreamDefragger};

fn be32(h: &[u8]) -> i64 {
    u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as i64
}

fn wire(msg_size: usize, count: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity((msg_size + 4) * count);
    for i in 0..count {
        v.extend_from_slice(&((msg_size + 4) as u32).to_be_bytes());
        v.extend(std::iter::repeat((i % 256) as u8).take(msg_size));
    }
    v
}

fn count_frames(defrag: &mut StreamDefragger<fn(&[u8]) -> i64>, data: &[u8]) -> usize {
    let mut n = 0;
    let mut feed = defrag.feed(data);
    while let Some(frame) = feed.next() {
        if let Frame::Message(m) = frame {
            black_box(m);
            n += 1;
        }
    }
    n
}

fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("defragger");
    let data = wire(100, 1000);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for chunk in [64usize, 1500, 16 * 1024, data.len()] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut defrag = StreamDefragger::new(4, be32 as fn(&[u8]) -> i64);
                let mut n = 0;
                for span in data.chunks(chunk) {
                    n += count_frames(&mut defrag, black_box(span));
                }
                assert_eq!(n, 1000);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fragmentation);
criterion_main!(benches);
