//! Codec benchmarks for gitwire.
//!
//! Covers the hot paths of a fetch: pkt-line framing, delta encoding and
//! application, pack reading with delta resolution and index writing.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gitwire_object::GitObject;
use gitwire_protocol::pack::{apply_delta, create_delta, IndexVersion};
use gitwire_protocol::{PackBuilder, PackIndex, PackReader, PktLineReader, PktLineWriter};
use std::hint::black_box;

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// A copy of `data` with a few bytes changed every 4KB.
fn edit(data: &[u8]) -> Vec<u8> {
    let mut edited = data.to_vec();
    for i in (0..edited.len()).step_by(4096) {
        edited[i] = edited[i].wrapping_add(1);
    }
    edited
}

fn bench_pktline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pktline");
    let payload = generate_data(1000);
    let mut encoded = PktLineWriter::new(Vec::new());
    for _ in 0..1000 {
        encoded.write_data(&payload).unwrap();
    }
    encoded.flush_pkt().unwrap();
    let encoded = encoded.into_inner();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("write_1000", |b| {
        b.iter(|| {
            let mut writer = PktLineWriter::new(Vec::with_capacity(encoded.len()));
            for _ in 0..1000 {
                writer.write_data(black_box(&payload)).unwrap();
            }
            writer.flush_pkt().unwrap();
            black_box(writer.into_inner())
        })
    });

    group.bench_function("read_1000", |b| {
        b.iter(|| {
            let mut reader = PktLineReader::new(black_box(encoded.as_slice()));
            black_box(reader.read_until_flush().unwrap())
        })
    });

    group.finish();
}

fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");

    for size in [10_240, 102_400, 1_048_576].iter() {
        let base = generate_data(*size);
        let target = edit(&base);
        let delta = create_delta(&base, &target);
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("create", size), size, |b, _| {
            b.iter(|| black_box(create_delta(&base, &target)))
        });
        group.bench_with_input(BenchmarkId::new("apply", size), size, |b, _| {
            b.iter(|| black_box(apply_delta(&base, &delta).unwrap()))
        });
    }

    group.finish();
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");

    for count in [100, 1_000].iter() {
        let base = generate_data(8192);
        let mut builder = PackBuilder::new().with_deltas();
        for i in 0..*count {
            let mut data = base.clone();
            data.extend_from_slice(format!("revision {i}\n").as_bytes());
            builder.add(GitObject::blob(data));
        }
        let pack = builder.build().unwrap();
        group.throughput(Throughput::Bytes(pack.len() as u64));

        group.bench_with_input(BenchmarkId::new("read", count), count, |b, _| {
            b.iter(|| black_box(PackReader::new(pack.as_slice()).unwrap().read_all().unwrap()))
        });

        let (objects, checksum) = PackReader::new(pack.as_slice()).unwrap().read_all().unwrap();
        let index = PackIndex::from_objects(&objects, checksum).unwrap();
        group.bench_with_input(BenchmarkId::new("index_v2", count), count, |b, _| {
            b.iter(|| {
                let mut out = Vec::new();
                index.write(&mut out, IndexVersion::V2).unwrap();
                black_box(out)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pktline, bench_delta, bench_pack);

criterion_main!(benches);
