//! Fragmenting and reassembling a 150 KB frame

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use locus_relay::media::FrameReassembler;
use locus_relay::protocol::{FrameFragmenter, MediaFlags};

fn bench_fragment(c: &mut Criterion) {
    let frame = Bytes::from(vec![0x5Au8; 150_000]);
    let fragmenter = FrameFragmenter::new("bench", 60_000).unwrap();

    let mut group = c.benchmark_group("frame_150k");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("fragment", |b| {
        b.iter(|| {
            fragmenter
                .fragment_datagrams(black_box(&frame), MediaFlags::default())
                .unwrap()
        })
    });

    group.bench_function("fragment_and_reassemble", |b| {
        let mut reassembler = FrameReassembler::new();
        b.iter(|| {
            let datagrams = fragmenter.fragment_datagrams(&frame, MediaFlags::default()).unwrap();
            let mut completed = None;
            for datagram in datagrams {
                completed = reassembler.push_datagram(datagram);
            }
            black_box(completed.unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_fragment);
criterion_main!(benches);
