use criterion::{criterion_group, criterion_main, Criterion};
use trellis_core::tasks::{ActivateTree, EnsureNode, ProvisionAccess};
use trellis_core::{
    run_migration, AccessRule, MemoryStore, NodePath, NodeRoleRegistry, TaskCatalog, Version,
};

fn mk_catalog(pages: usize) -> TaskCatalog {
    let mut builder = TaskCatalog::builder("bench", "2.0").release("0.1");
    for index in 0..pages {
        let version = format!("1.{}", index % 10);
        let path = format!("/site/section-{}/page-{index}", index % 10);
        builder = builder.task(
            &version,
            EnsureNode::new(format!("page-{index}"), "create page", "website", &path, "mgnl:page"),
        );
    }
    let rules = (0..pages)
        .filter_map(|index| NodePath::parse(&format!("/apps/app-{}", index % 10)).ok())
        .map(|resource| AccessRule::allow(resource, "editor"))
        .collect::<Vec<_>>();
    builder = builder
        .task("2.0", ProvisionAccess::new("access", "app access", rules))
        .task(
            "2.0",
            ActivateTree::new("activate", "activate pages", "website", "/", Some("mgnl:page")),
        );
    match builder.build() {
        Ok(catalog) => catalog,
        Err(err) => panic!("benchmark catalog failed to build: {err}"),
    }
}

fn bench_clean_install(c: &mut Criterion) {
    let catalog = mk_catalog(500);

    c.bench_function("clean_install_500_pages", |b| {
        b.iter(|| {
            let mut store = MemoryStore::new();
            let result = run_migration(None, &catalog, &mut store, &NodeRoleRegistry);
            if !result.is_committed() {
                panic!("clean install benchmark failed: {:?}", result.error);
            }
        });
    });
}

fn bench_rerun(c: &mut Criterion) {
    let catalog = mk_catalog(500);
    let mut store = MemoryStore::new();
    let first = run_migration(None, &catalog, &mut store, &NodeRoleRegistry);
    if !first.is_committed() {
        panic!("benchmark fixture install failed: {:?}", first.error);
    }

    c.bench_function("idempotent_rerun_500_pages", |b| {
        b.iter(|| {
            let result =
                run_migration(Some(Version::new(0, 1, 0)), &catalog, &mut store, &NodeRoleRegistry);
            if !result.is_committed() {
                panic!("rerun benchmark failed: {:?}", result.error);
            }
        });
    });
}

criterion_group!(engine_benches, bench_clean_install, bench_rerun);
criterion_main!(engine_benches);
