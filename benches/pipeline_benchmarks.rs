use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use resume_orchestrator::models::NewTask;
use resume_orchestrator::orchestration::{parse_report, BackoffCalculator, TextChunker};
use resume_orchestrator::store::{InMemoryTaskStore, TaskStore};
use std::time::Duration;
use uuid::Uuid;

const REPORT: &str = r##"{
    "score": 81,
    "matched": [{"skill": "Rust", "evidence": [{"source": "resume", "excerpt": "Five years of Rust", "chunk_index": 0}]}],
    "missing": [{"skill": "Kubernetes", "evidence": [{"source": "job", "excerpt": "Operate Kubernetes", "chunk_index": null}]}],
    "weak": [],
    "change_log": ["Led with Rust experience"],
    "preview_markdown": "# Jane Doe\n\nSenior Rust engineer"
}"##;

fn benchmark_chunking(c: &mut Criterion) {
    let chunker = TextChunker::default();
    let mut group = c.benchmark_group("chunking");
    for words in [500usize, 5_000, 50_000] {
        let text = "distributed systems engineer ".repeat(words / 3);
        group.bench_with_input(BenchmarkId::from_parameter(words), &text, |b, text| {
            b.iter(|| chunker.split(black_box(text)))
        });
    }
    group.finish();
}

fn benchmark_report_validation(c: &mut Criterion) {
    c.bench_function("parse_report", |b| b.iter(|| parse_report(black_box(REPORT))));
}

fn benchmark_backoff(c: &mut Criterion) {
    let calculator = BackoffCalculator::default();
    c.bench_function("backoff_calculate", |b| {
        b.iter(|| calculator.calculate(black_box(4), None))
    });
}

fn benchmark_memory_claim(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    c.bench_function("memory_claim_batch_of_10_from_1000", |b| {
        b.iter_batched(
            || {
                let store = InMemoryTaskStore::new();
                runtime.block_on(async {
                    for _ in 0..1000 {
                        store
                            .enqueue(&NewTask::embed_job(Uuid::new_v4(), Uuid::new_v4()))
                            .await
                            .expect("enqueue");
                    }
                });
                store
            },
            |store| {
                runtime.block_on(async {
                    store
                        .claim("bench", 10, Duration::from_secs(30))
                        .await
                        .expect("claim")
                })
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    benchmark_chunking,
    benchmark_report_validation,
    benchmark_backoff,
    benchmark_memory_claim
);
criterion_main!(benches);
