use criterion::{Criterion, criterion_group, criterion_main};
use doc_store::InMemoryDocumentStore;
use migrator::{ChangeStep, MigrationUnit, Migrator, MigratorConfig, StaticSource};

fn source(units: usize, steps: usize) -> StaticSource {
    (0..units).fold(StaticSource::new(), |source, u| {
        let unit = (0..steps).fold(
            MigrationUnit::new(format!("unit_{u:03}"), format!("{u:03}")),
            |unit, s| {
                unit.step(
                    ChangeStep::standalone(format!("{u:03}-{s:03}"), "bench", format!("{s:03}"), || {
                        async { Ok(()) }
                    })
                    .rollback_command(r#"{"ping": 1}"#),
                )
            },
        );
        source.unit(unit)
    })
}

fn bench_first_run(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("migrator/first_run_10x10", |b| {
        b.iter(|| {
            rt.block_on(async {
                Migrator::new(MigratorConfig::new("bench"))
                    .with_source(source(10, 10))
                    .with_store(InMemoryDocumentStore::new())
                    .execute()
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_rerun_all_skipped(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryDocumentStore::new();
    let engine = Migrator::new(MigratorConfig::new("bench"))
        .with_source(source(10, 10))
        .with_store(store);

    // Populate history once
    rt.block_on(async {
        engine.execute().await.unwrap();
    });

    c.bench_function("migrator/rerun_10x10_skipped", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.execute().await.unwrap();
            });
        });
    });
}

fn bench_shrinkage_rollback(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("migrator/rollback_removed_unit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryDocumentStore::new();
                Migrator::new(MigratorConfig::new("bench"))
                    .with_source(source(2, 10))
                    .with_store(store.clone())
                    .execute()
                    .await
                    .unwrap();
                Migrator::new(MigratorConfig::new("bench"))
                    .with_source(source(1, 10))
                    .with_store(store)
                    .execute()
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_first_run,
    bench_rerun_all_skipped,
    bench_shrinkage_rollback
);
criterion_main!(benches);
