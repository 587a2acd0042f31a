use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::diff::{diff_lines, DiffOptions};
use tessera_core::merge_text;
use tessera_core::object::hash_object;
use tessera_core::ObjectKind;

/// `n` lines with every `stride`-th line rewritten under `tag`
fn document(n: usize, stride: usize, tag: &str) -> String {
    (0..n)
        .map(|i| {
            if stride > 0 && i % stride == 0 {
                format!("{} edit {}\n", tag, i)
            } else {
                format!("fn item_{}() -> usize {{ {} }}\n", i, i)
            }
        })
        .collect()
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_lines");

    for size in [100, 1000, 10000].iter() {
        let old = document(*size, 0, "");
        let new = document(*size, 50, "ours");
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| diff_lines(black_box(&old), black_box(&new), DiffOptions::default()));
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_text");

    for size in [100, 1000, 10000].iter() {
        let base = document(*size, 0, "");
        // Offset strides keep the two sides' edits apart
        let ours = document(*size, 40, "ours");
        let theirs: String = base
            .lines()
            .enumerate()
            .map(|(i, l)| if i % 40 == 20 { format!("theirs {}\n", i) } else { format!("{}\n", l) })
            .collect();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| merge_text(black_box(&base), black_box(&ours), black_box(&theirs)));
        });
    }

    group.finish();
}

fn bench_hash(c: &mut Criterion) {
    let data = vec![0xabu8; 1 << 20];
    let mut group = c.benchmark_group("hash_object");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("1MiB", |b| {
        b.iter(|| hash_object(ObjectKind::Blob, black_box(&data)));
    });
    group.finish();
}

criterion_group!(benches, bench_diff, bench_merge, bench_hash);
criterion_main!(benches);
