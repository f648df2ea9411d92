//! Performance benchmarks for the key codec and filter matching.
//!
//! Run with: `cargo bench --bench codec`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Encode | <1µs | One allocation per key |
//! | Decode | <2µs | Includes unescaping |
//! | Filtered scan | Linear in rule count | Post-filter over scanned keys |

use criterion::{
    black_box, criterion_group, criterion_main,
    BenchmarkId, Criterion, Throughput,
};

use rbac_policy_adapter::{BatchFilter, Filter, KeyCodec, RuleRecord, RULE_TABLE_NAME};

fn make_rule(i: usize) -> RuleRecord {
    RuleRecord::new(
        "p",
        [
            format!("user{}", i),
            format!("/api/v1/resource/{}", i % 97),
            "read".to_string(),
        ],
    )
    .unwrap()
}

fn bench_encode(c: &mut Criterion) {
    let codec = KeyCodec::new("/rbac", RULE_TABLE_NAME);
    let rule = make_rule(42);

    c.bench_function("encode", |b| b.iter(|| codec.encode(black_box(&rule))));
}

fn bench_decode(c: &mut Criterion) {
    let codec = KeyCodec::new("/rbac", RULE_TABLE_NAME);
    let key = codec.encode(&make_rule(42));

    c.bench_function("decode", |b| b.iter(|| codec.decode(black_box(&key))));
}

fn bench_batch_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_filter");

    for size in [100usize, 1_000, 10_000] {
        let rules: Vec<RuleRecord> = (0..size).map(make_rule).collect();
        let filter = BatchFilter::new(vec![
            Filter::new().with_ptype(["p"]).with_value(0, ["user7", "user70"]),
            Filter::new().with_value(2, ["write"]),
        ]);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rules, |b, rules| {
            b.iter(|| rules.iter().filter(|r| filter.matches(r)).count())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_batch_filter);
criterion_main!(benches);
