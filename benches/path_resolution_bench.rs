// benches/path_resolution_bench.rs
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sandbox_engine::Workspace;

fn bench_path_resolution(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::open(dir.path().join("ws")).unwrap();
    std::fs::create_dir_all(workspace.root().join("src/runtime/deep")).unwrap();
    std::fs::write(workspace.root().join("src/runtime/deep/mod.rs"), b"// bench").unwrap();

    c.bench_function("clean_relative_path", |b| {
        b.iter(|| Workspace::clean(black_box("src/./runtime/deep/mod.rs")))
    });

    c.bench_function("resolve_existing_file", |b| {
        b.iter(|| workspace.resolve(black_box("src/runtime/deep/mod.rs")))
    });

    c.bench_function("resolve_new_file", |b| {
        b.iter(|| workspace.resolve(black_box("src/runtime/deep/new/file.rs")))
    });

    c.bench_function("reject_parent_segment", |b| {
        b.iter(|| workspace.resolve(black_box("src/../../etc/passwd")))
    });
}

criterion_group!(benches, bench_path_resolution);
criterion_main!(benches);
