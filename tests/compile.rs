//! End-to-end compilation scenarios driven through the public [`Compiler`]
//! API.

use prost_types::field_descriptor_proto::Type;
use protolink::{
    CollectingReporter, Compiler, DescriptorKind, Error, File, Handler, Hooks, IncludeResolver,
    MemoryResolver, ResolveError, Resolver, SymbolTable,
};
use std::sync::{Arc, Mutex};

/// Trimmed-down stand-in for the well-known descriptor file, enough to extend
/// `google.protobuf.FieldOptions`.
const DESCRIPTOR_FIXTURE: &str = r#"
syntax = "proto2";
package google.protobuf;

message FieldOptions {
  optional bool deprecated = 3;
  extensions 1000 to max;
}
"#;

fn handler() -> Handler {
    Handler::new(Arc::new(CollectingReporter::default()))
}

#[tokio::test]
async fn single_file_no_imports() {
    let resolver = MemoryResolver::default().with_file(
        "a.proto",
        r#"
        syntax = "proto3";
        package t1;
        message M { string s = 1; }
        "#,
    );
    let compiler = Compiler::builder(resolver).retain_results(true).build();

    let out = compiler.compile(["a.proto"]).await.unwrap();
    out.assert_success();
    assert_eq!(out.files.len(), 1);

    let file = out.files.find_file_by_path("a.proto").unwrap();
    assert_eq!(file.package(), "t1");
    assert_eq!(
        file.find_descriptor("t1.M").unwrap().kind(),
        &DescriptorKind::Message
    );
    assert_eq!(
        file.find_descriptor("t1.M.s").unwrap().kind(),
        &DescriptorKind::Field { number: 1 }
    );

    let field = &file.proto().message_type[0].field[0];
    assert_eq!(field.r#type, Some(Type::String as i32));
    assert_eq!(field.number, Some(1));

    // the symbol table contains exactly t1, t1.M and t1.M.s, and no extensions
    let snapshot = compiler.symbol_table().unwrap().snapshot();
    let names: Vec<&str> = snapshot.symbols.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(names, ["t1", "t1.M", "t1.M.s"]);
    assert!(snapshot.extensions.is_empty());
}

fn chain_resolver() -> MemoryResolver {
    let mut resolver = MemoryResolver::default();
    resolver.insert(
        "t1.proto",
        "syntax = \"proto3\";\npackage t1;\nmessage M1 { string s = 1; }\n",
    );
    for k in 2..=5u32 {
        let prev = k - 1;
        resolver.insert(
            format!("t{k}.proto"),
            format!(
                "syntax = \"proto3\";\npackage t{k};\nimport \"t{prev}.proto\";\n\
                 message M{k} {{ t{prev}.M{prev} m = 1; }}\n"
            ),
        );
    }
    resolver
}

#[tokio::test]
async fn linear_import_chain() {
    let compiler = Compiler::builder(chain_resolver())
        .retain_results(true)
        .include_dependencies_in_results(true)
        .build();

    let out = compiler.compile(["t5.proto"]).await.unwrap();
    out.assert_success();
    assert_eq!(out.files.len(), 5);

    let table = compiler.symbol_table().unwrap();
    for k in 1..=5 {
        assert!(table.lookup(&format!("t{k}")).unwrap().is_package(), "package t{k} missing");
    }

    // every cross-file reference resolved to fully-qualified form
    let t5 = out.files.find_file_by_path("t5.proto").unwrap();
    assert_eq!(t5.proto().message_type[0].field[0].type_name(), ".t4.M4");
}

#[tokio::test]
async fn import_then_delete_restores_the_symbol_table() {
    let compiler = Compiler::builder(chain_resolver())
        .include_dependencies_in_results(true)
        .build();
    let out = compiler.compile(["t5.proto"]).await.unwrap();
    out.assert_success();

    let files: Vec<File> = (1..=5)
        .map(|k| out.files.find_file_by_path(&format!("t{k}.proto")).unwrap().clone())
        .collect();

    let h = handler();
    let table = SymbolTable::new();
    let empty = table.snapshot();

    for _ in 0..100 {
        // importing the chain head pulls everything in transitively
        table.import(&files[4], &h).unwrap();
        assert!(table.lookup("t1.M1").is_some());
        table.delete(&files[4]);
        assert_eq!(table.snapshot(), empty);

        // import each file explicitly, delete leaf-first
        for file in &files {
            table.import(file, &h).unwrap();
        }
        for file in files.iter().rev() {
            table.delete(file);
        }
        assert_eq!(table.snapshot(), empty);

        // and root-first: t1.proto deleted last leaves the table empty
        for file in &files {
            table.import(file, &h).unwrap();
        }
        for file in &files {
            table.delete(file);
        }
        assert_eq!(table.snapshot(), empty);
    }
    assert_eq!(h.error_count(), 0);
}

#[tokio::test]
async fn import_cycle_is_reported_from_the_requested_file() {
    let resolver = MemoryResolver::default()
        .with_file("x.proto", "syntax = \"proto3\";\nimport \"y.proto\";\nmessage X {}\n")
        .with_file("y.proto", "syntax = \"proto3\";\nimport \"x.proto\";\nmessage Y {}\n");
    let compiler = Compiler::builder(resolver).build();

    let out = compiler.compile(["x.proto"]).await.unwrap();
    let err = out.first_error.expect("an import cycle must fail the compile");
    assert!(matches!(err, Error::ImportCycle { .. }));
    assert!(
        err.to_string().contains("\"x.proto\" -> \"y.proto\" -> \"x.proto\""),
        "unexpected cycle rendering: {err}"
    );
    assert!(out.files.is_empty());
}

#[tokio::test]
async fn self_import_is_a_trivial_cycle() {
    let resolver = MemoryResolver::default()
        .with_file("s.proto", "syntax = \"proto3\";\nimport \"s.proto\";\nmessage S {}\n");
    let compiler = Compiler::builder(resolver).build();

    let out = compiler.compile(["s.proto"]).await.unwrap();
    match out.first_error.expect("self-import must fail") {
        Error::ImportCycle { chain, .. } => {
            assert_eq!(chain.len(), 2);
            assert!(chain.iter().all(|p| *p == "s.proto"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_extension_numbers_across_unrelated_files() {
    let resolver = MemoryResolver::default()
        .with_file("google/protobuf/descriptor.proto", DESCRIPTOR_FIXTURE)
        .with_file(
            "e1.proto",
            "syntax = \"proto2\";\npackage e1;\nimport \"google/protobuf/descriptor.proto\";\n\
             extend google.protobuf.FieldOptions { optional string foo = 10001; }\n",
        )
        .with_file(
            "e2.proto",
            "syntax = \"proto2\";\npackage e2;\nimport \"google/protobuf/descriptor.proto\";\n\
             extend google.protobuf.FieldOptions { optional string bar = 10001; }\n",
        );
    let compiler = Compiler::builder(resolver).build();

    let out = compiler.compile(["e1.proto", "e2.proto"]).await.unwrap();
    let err = out.first_error.expect("the duplicate tag must be reported");
    match &err {
        Error::ExtensionCollision { extendee, number, span, existing, .. } => {
            assert_eq!(extendee, "google.protobuf.FieldOptions");
            assert_eq!(*number, 10001);
            // both spans are named, one per file
            let mut involved =
                vec![existing.file.as_str(), span.as_ref().unwrap().file.as_str()];
            involved.sort();
            assert_eq!(involved, ["e1.proto", "e2.proto"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // whichever file linked first won the registration; the other is partial
    assert_eq!(out.files.len(), 1);
    assert_eq!(out.partial.len(), 1);
    let winner = out.files.get(0).unwrap();
    assert!(winner
        .find_extension_by_number("google.protobuf.FieldOptions", 10001)
        .is_some());
}

#[tokio::test]
async fn package_vs_symbol_collision_is_fatal() {
    let resolver = MemoryResolver::default()
        .with_file("google/protobuf/descriptor.proto", DESCRIPTOR_FIXTURE)
        .with_file("p.proto", "syntax = \"proto3\";\npackage foo.bar;\nmessage P {}\n")
        .with_file(
            "q.proto",
            "syntax = \"proto2\";\nimport \"google/protobuf/descriptor.proto\";\n\
             extend google.protobuf.FieldOptions { optional string foo = 10002; }\n",
        );
    let compiler = Compiler::builder(resolver).build();

    let out = compiler.compile(["p.proto", "q.proto"]).await.unwrap();
    let err = out.first_error.expect("the collision on `foo` must be reported");
    match &err {
        Error::PackageCollision { name, .. } => assert_eq!(name, "foo"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_recoverable());

    // the first file to link wins; the second fails before producing a file
    assert_eq!(out.files.len(), 1);
    assert_eq!(out.unlinked.len(), 1);
}

#[tokio::test]
async fn invalidate_and_recompile_fires_hooks_in_order() {
    let events: Arc<Mutex<Vec<String>>> = Arc::default();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.proto"),
        "syntax = \"proto3\";\npackage t1;\nmessage M { string s = 1; }\n",
    )
    .unwrap();

    let hooks = {
        let pre_inv = Arc::clone(&events);
        let post_inv = Arc::clone(&events);
        let pre = Arc::clone(&events);
        let post = Arc::clone(&events);
        Hooks::new()
            .on_pre_invalidate(move |path| {
                pre_inv.lock().unwrap().push(format!("pre_invalidate:{path}"));
            })
            .on_post_invalidate(move |path, previous, will_recompile| {
                post_inv.lock().unwrap().push(format!(
                    "post_invalidate:{path}:{}:{will_recompile}",
                    previous.is_some()
                ));
            })
            .on_pre_compile(move |path| {
                pre.lock().unwrap().push(format!("pre_compile:{path}"));
            })
            .on_post_compile(move |path, _outcome| {
                post.lock().unwrap().push(format!("post_compile:{path}"));
            })
    };

    let compiler = Compiler::builder(IncludeResolver::new(dir.path()))
        .retain_results(true)
        .hooks(hooks)
        .build();

    compiler.compile(["a.proto"]).await.unwrap().assert_success();
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["pre_compile:a.proto", "post_compile:a.proto"]
    );

    // mutate the source externally and recompile
    std::fs::write(
        dir.path().join("a.proto"),
        "syntax = \"proto3\";\npackage t1;\nmessage M { string s = 1; string t = 2; }\n",
    )
    .unwrap();
    events.lock().unwrap().clear();

    let out = compiler.compile(["a.proto"]).await.unwrap();
    out.assert_success();
    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            "pre_invalidate:a.proto",
            "post_invalidate:a.proto:true:true",
            "pre_compile:a.proto",
            "post_compile:a.proto",
        ]
    );

    let file = out.files.find_file_by_path("a.proto").unwrap();
    assert!(file.find_descriptor("t1.M.t").is_some(), "edit must be visible after recompile");
}

/// A resolver whose contents can be mutated between compiles.
#[derive(Clone, Default)]
struct SharedResolver(Arc<Mutex<MemoryResolver>>);

impl Resolver for SharedResolver {
    fn find_file_by_path(
        &self,
        path: &protolink::UnresolvedPath,
        import_context: Option<&protolink::ParseResult>,
    ) -> Result<protolink::SearchResult, ResolveError> {
        self.0.lock().unwrap().find_file_by_path(path, import_context)
    }
}

#[tokio::test]
async fn vanished_files_invalidate_without_recompiling() {
    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let resolver = SharedResolver::default();
    resolver
        .0
        .lock()
        .unwrap()
        .insert("a.proto", "syntax = \"proto3\";\npackage t1;\nmessage M {}\n");

    let hooks = {
        let post_inv = Arc::clone(&events);
        let pre = Arc::clone(&events);
        Hooks::new()
            .on_post_invalidate(move |path, _previous, will_recompile| {
                post_inv.lock().unwrap().push(format!("post_invalidate:{path}:{will_recompile}"));
            })
            .on_pre_compile(move |path| {
                pre.lock().unwrap().push(format!("pre_compile:{path}"));
            })
    };

    let compiler = Compiler::builder(resolver.clone())
        .retain_results(true)
        .hooks(hooks)
        .build();
    compiler.compile(["a.proto"]).await.unwrap().assert_success();

    // the file disappears from the resolver's universe
    resolver.0.lock().unwrap().remove("a.proto");
    events.lock().unwrap().clear();

    let out = compiler.compile(["a.proto"]).await.unwrap();
    assert!(matches!(out.first_error, Some(Error::FailedToResolve { .. })));
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["post_invalidate:a.proto:false"],
        "no recompile may happen for a vanished file"
    );
}

#[tokio::test]
async fn shared_dependencies_compile_exactly_once() {
    // diamond: root -> left, right; left -> base; right -> base
    let resolver = MemoryResolver::default()
        .with_file("base.proto", "syntax = \"proto3\";\npackage base;\nmessage B { string s = 1; }\n")
        .with_file(
            "left.proto",
            "syntax = \"proto3\";\npackage left;\nimport \"base.proto\";\n\
             message L { base.B b = 1; }\n",
        )
        .with_file(
            "right.proto",
            "syntax = \"proto3\";\npackage right;\nimport \"base.proto\";\n\
             message R { base.B b = 1; }\n",
        )
        .with_file(
            "root.proto",
            "syntax = \"proto3\";\npackage root;\nimport \"left.proto\";\nimport \"right.proto\";\n\
             message T { left.L l = 1; right.R r = 2; }\n",
        );

    let compiled: Arc<Mutex<Vec<String>>> = Arc::default();
    let hooks = {
        let compiled = Arc::clone(&compiled);
        Hooks::new().on_pre_compile(move |path| {
            compiled.lock().unwrap().push(path.to_string());
        })
    };

    let compiler = Compiler::builder(resolver)
        .include_dependencies_in_results(true)
        .hooks(hooks)
        .build();
    let out = compiler.compile(["root.proto"]).await.unwrap();
    out.assert_success();
    assert_eq!(out.files.len(), 4);

    // at most one task ran per resolved path
    let mut ran = compiled.lock().unwrap().clone();
    ran.sort();
    assert_eq!(ran, ["base.proto", "left.proto", "right.proto", "root.proto"]);

    // the closure is reflexive and ordered: requested files first
    assert_eq!(out.files.get(0).unwrap().path(), "root.proto");
}

#[tokio::test]
async fn unresolvable_imports_link_against_placeholders() {
    let resolver = MemoryResolver::default().with_file(
        "a.proto",
        "syntax = \"proto3\";\npackage a;\nimport \"missing.proto\";\nmessage A { string s = 1; }\n",
    );
    let reporter = Arc::new(CollectingReporter::default());
    let compiler = Compiler::builder(resolver).shared_reporter(reporter.clone()).build();

    let out = compiler.compile(["a.proto"]).await.unwrap();
    match out.first_error.as_ref().expect("the missing import must be reported") {
        Error::FailedToResolve { path, span } => {
            assert_eq!(path, &"missing.proto");
            // pinned to the import statement in the importing file
            assert_eq!(span.as_ref().unwrap().file, "a.proto");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // the file still linked partially, with a placeholder dependency
    assert_eq!(out.partial.len(), 1);
    let partial = &out.partial[0];
    assert!(partial.file().dependencies()[0].is_placeholder());
    assert!(partial.file().find_descriptor("a.A").is_some());
    assert_eq!(reporter.errors().len(), 1);
}

#[tokio::test]
async fn unused_imports_warn_on_explicit_files() {
    let resolver = MemoryResolver::default()
        .with_file("used.proto", "syntax = \"proto3\";\npackage u;\nmessage U {}\n")
        .with_file("unused.proto", "syntax = \"proto3\";\npackage n;\nmessage N {}\n")
        .with_file(
            "root.proto",
            "syntax = \"proto3\";\nimport \"used.proto\";\nimport \"unused.proto\";\n\
             message R { u.U u = 1; }\n",
        );
    let reporter = Arc::new(CollectingReporter::default());
    let compiler = Compiler::builder(resolver).shared_reporter(reporter.clone()).build();

    compiler.compile(["root.proto"]).await.unwrap().assert_success();

    let warnings = reporter.warnings();
    assert_eq!(warnings.len(), 1);
    match &warnings[0] {
        Error::UnusedImport { path, .. } => assert_eq!(path, &"unused.proto"),
        other => panic!("unexpected warning: {other:?}"),
    }
}

#[tokio::test]
async fn source_info_is_attached_on_request() {
    let source = "syntax = \"proto3\";\npackage t;\nmessage M { string s = 1; }\n";

    let with = Compiler::builder(MemoryResolver::default().with_file("a.proto", source))
        .source_info_mode(protolink::SourceInfoMode::STANDARD)
        .build();
    let out = with.compile(["a.proto"]).await.unwrap();
    out.assert_success();
    let file = out.files.get(0).unwrap();
    assert!(file.proto().source_code_info.is_some());

    let without = Compiler::builder(MemoryResolver::default().with_file("a.proto", source)).build();
    let out = without.compile(["a.proto"]).await.unwrap();
    out.assert_success();
    assert!(out.files.get(0).unwrap().proto().source_code_info.is_none());
}

#[tokio::test]
async fn asts_are_dropped_unless_retention_is_requested() {
    let source = "syntax = \"proto3\";\npackage t;\nmessage M {}\n";
    let seen: Arc<Mutex<Vec<bool>>> = Arc::default();

    for retain in [false, true] {
        let seen_hook = Arc::clone(&seen);
        let hooks = Hooks::new().on_post_compile(move |_path, outcome| {
            let has_ast = outcome.linked().and_then(|linked| linked.ast()).is_some();
            seen_hook.lock().unwrap().push(has_ast);
        });
        let compiler =
            Compiler::builder(MemoryResolver::default().with_file("a.proto", source))
                .retain_asts(retain)
                .hooks(hooks)
                .build();
        compiler.compile(["a.proto"]).await.unwrap().assert_success();
    }

    assert_eq!(seen.lock().unwrap().as_slice(), [false, true]);
}

#[tokio::test]
async fn panicking_resolvers_fail_the_file_not_the_process() {
    struct Bomb;
    impl Resolver for Bomb {
        fn find_file_by_path(
            &self,
            path: &protolink::UnresolvedPath,
            _import_context: Option<&protolink::ParseResult>,
        ) -> Result<protolink::SearchResult, ResolveError> {
            panic!("resolver exploded on {path}");
        }
    }

    let compiler = Compiler::builder(Bomb).build();
    let out = compiler.compile(["a.proto"]).await.unwrap();
    match out.first_error.expect("the panic must surface as an error") {
        Error::Panic { message, .. } => assert!(message.contains("resolver exploded")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn files_compile_under_a_width_one_pool() {
    // a pool of one worker must still make progress through dependency waits
    let compiler = Compiler::builder(chain_resolver())
        .max_parallelism(1)
        .include_dependencies_in_results(true)
        .build();
    let out = compiler.compile(["t5.proto"]).await.unwrap();
    out.assert_success();
    assert_eq!(out.files.len(), 5);
}

#[tokio::test]
async fn cycles_do_not_deadlock_a_width_one_pool() {
    let resolver = MemoryResolver::default()
        .with_file("x.proto", "syntax = \"proto3\";\nimport \"y.proto\";\n")
        .with_file("y.proto", "syntax = \"proto3\";\nimport \"z.proto\";\n")
        .with_file("z.proto", "syntax = \"proto3\";\nimport \"x.proto\";\n");
    let compiler = Compiler::builder(resolver).max_parallelism(1).build();

    let out = compiler.compile(["x.proto"]).await.unwrap();
    let err = out.first_error.expect("the three-file cycle must be reported");
    assert!(matches!(err, Error::ImportCycle { .. }));
    let rendered = err.to_string();
    for name in ["x.proto", "y.proto", "z.proto"] {
        assert!(rendered.contains(name), "{name} missing from: {rendered}");
    }
}
