/// Benchmarks for the hot paths hit on every keystroke:
/// - parsing tool output into a response
/// - tokenizing the configured executable
/// - acquiring and releasing a worker lease
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sniff_pool::worker::{split_command_line, ReportKind, Response, WorkerPool};

fn diagnostic_output(count: usize) -> String {
    let diagnostics: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"code":"PSR12.Sniff.{i}","message":"finding {i}","range":{{"start":{{"line":{i},"character":0}},"end":{{"line":{i},"character":4}}}},"severity":{}}}"#,
                i % 2
            )
        })
        .collect();
    let actions: Vec<String> = (0..count)
        .step_by(2)
        .map(|i| format!(r#"{{"title":"Fix {i}","kind":"quickfix","diagnostic":{i}}}"#))
        .collect();
    format!(
        "PHP Deprecated: banner\n{{\"files\":[{{\"filename\":\"a.php\",\"diagnostics\":[{}],\"codeActions\":[{}]}}]}}",
        diagnostics.join(","),
        actions.join(",")
    )
}

fn bench_parse_diagnostics(c: &mut Criterion) {
    let mut group = c.benchmark_group("ParseDiagnostics");

    for count in [1usize, 50, 500] {
        let output = diagnostic_output(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &output, |b, output| {
            b.iter(|| {
                let response = Response::parse(ReportKind::Diagnostic, None, black_box(output));
                black_box(response)
            });
        });
    }

    group.finish();
}

fn bench_split_command_line(c: &mut Criterion) {
    c.bench_function("split_command_line", |b| {
        b.iter(|| {
            let tokens = split_command_line(black_box(
                r#""C:\Program Files\php\php.exe" -d memory_limit=1G 'vendor/bin/phpcs'"#,
            ));
            black_box(tokens)
        });
    });
}

fn bench_lease_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = WorkerPool::new(4);

    c.bench_function("lease_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let lease = pool.wait_for_available("bench", None).await;
            black_box(lease)
        });
    });
}

criterion_group!(
    benches,
    bench_parse_diagnostics,
    bench_split_command_line,
    bench_lease_cycle
);
criterion_main!(benches);
