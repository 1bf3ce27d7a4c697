//! Classifier Performance Benchmarks
//!
//! Classification runs on every request before anything touches a database, so it has to stay
//! cheap for short statements and linear for long ones.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use querygate::classifier::{classify, strip_literals_and_comments};

const SHORT_READ: &str = "SELECT id, name FROM users WHERE active = 1 ORDER BY id";
const CTE_WRITE: &str = "WITH stale AS (SELECT id FROM sessions WHERE expires_at < now()) \
                         DELETE FROM sessions WHERE id IN (SELECT id FROM stale)";
const LITERAL_HEAVY: &str = "SELECT 'drop table users; delete everything' AS note, \
                             \"update\" FROM audit -- insert here\n WHERE msg <> 'truncate'";

fn bench_classify_shapes(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    for (name, sql) in [("short_read", SHORT_READ), ("cte_write", CTE_WRITE), ("literal_heavy", LITERAL_HEAVY)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), sql, |b, sql| {
            b.iter(|| classify(black_box(sql), false));
        });
    }
    group.finish();
}

fn bench_classify_long_statement(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_long");
    for columns in [10usize, 100, 1000] {
        let list: Vec<String> = (0..columns).map(|i| format!("'value {i}' AS c{i}")).collect();
        let sql = format!("SELECT {} FROM wide_table", list.join(", "));
        group.bench_with_input(BenchmarkId::from_parameter(columns), &sql, |b, sql| {
            b.iter(|| classify(black_box(sql), false));
        });
    }
    group.finish();
}

fn bench_strip_literals(c: &mut Criterion) {
    c.bench_function("strip_literals_and_comments", |b| {
        b.iter(|| strip_literals_and_comments(black_box(LITERAL_HEAVY)));
    });
}

criterion_group!(benches, bench_classify_shapes, bench_classify_long_statement, bench_strip_literals);
criterion_main!(benches);
