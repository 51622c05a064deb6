//! compile many benches
#[macro_use]
extern crate criterion;

use criterion::Criterion;
use protolink::{Compiler, MemoryResolver};

const FILES: usize = 64;

fn compile_many_benchmark(c: &mut Criterion) {
    let resolver = build_resolver(FILES);
    let roots: Vec<String> = (0..FILES).map(|i| format!("file_{i}.proto")).collect();

    let mut group = c.benchmark_group("compile many");
    group.sample_size(10);

    group.bench_function("sequential", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap()).iter(|| {
            let resolver = resolver.clone();
            let roots = roots.clone();
            async move {
                let compiler = Compiler::builder(resolver).max_parallelism(1).build();
                compiler.compile(roots).await.unwrap().assert_success();
            }
        });
    });

    group.bench_function("concurrently", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap()).iter(|| {
            let resolver = resolver.clone();
            let roots = roots.clone();
            async move {
                let compiler = Compiler::builder(resolver).build();
                compiler.compile(roots).await.unwrap().assert_success();
            }
        });
    });
}

/// `n` files, each importing a shared `common.proto` and referencing its
/// message, so linking exercises the symbol table on every file.
fn build_resolver(n: usize) -> MemoryResolver {
    let mut resolver = MemoryResolver::default();
    resolver.insert(
        "common.proto",
        "syntax = \"proto3\";\npackage common;\nmessage Shared { string id = 1; }\n",
    );
    for i in 0..n {
        resolver.insert(
            format!("file_{i}.proto"),
            format!(
                "syntax = \"proto3\";\npackage file_{i};\nimport \"common.proto\";\n\
                 message M{i} {{\n  common.Shared shared = 1;\n  string name = 2;\n}}\n"
            ),
        );
    }
    resolver
}

criterion_group!(benches, compile_many_benchmark);
criterion_main!(benches);
