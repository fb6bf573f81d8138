use std::sync::Arc;

use async_trait::async_trait;
use bundlegraph_bundler::{LocalIdGenerator, SequentialIdGenerator, WarningKind};
use bundlegraph_core::{design_registry, Bundle, BundleError, InstId, MigrationSettings, Value};
use bundlegraph_migrate::{
    builtin_migrations, BundleStore, DependencyLoader, FileBundleStore, MemoryBundleStore,
    Migration, MigrationRegistry, MigrationRunner, PackageSet, ProjectLoader, UnbundledContext,
    UnbundledMigration,
};
use serde_json::json;
use tempfile::TempDir;

const SITE: &str = "site-main";
const PACKAGE: &str = "pkg-ui";

fn site_v0() -> Bundle {
    Bundle::from_json(include_str!("fixtures/site_v0.json")).unwrap()
}

fn package_v0() -> Bundle {
    Bundle::from_json(include_str!("fixtures/pkg_ui_v0.json")).unwrap()
}

fn runner_with(migrations: MigrationRegistry) -> Arc<MigrationRunner> {
    Arc::new(MigrationRunner::with_id_generator(
        Arc::new(migrations),
        Arc::new(design_registry().unwrap()),
        Arc::new(|| Box::new(SequentialIdGenerator::new()) as Box<dyn LocalIdGenerator>),
    ))
}

fn runner() -> Arc<MigrationRunner> {
    runner_with(builtin_migrations().unwrap())
}

fn seeded_store() -> Arc<MemoryBundleStore> {
    let store = Arc::new(MemoryBundleStore::new());
    store.put(SITE, site_v0());
    store.put(PACKAGE, package_v0());
    store
}

async fn migrated_packages(runner: &Arc<MigrationRunner>) -> PackageSet {
    let loader = DependencyLoader::new(seeded_store(), Arc::clone(runner));
    loader.resolve(SITE, &site_v0()).await.unwrap()
}

fn record<'a>(bundle: &'a Bundle, iid: &str) -> &'a bundlegraph_core::BundledInst {
    bundle.map.get(iid).unwrap()
}

fn component_names(project: &bundlegraph_migrate::OpenedProject) -> Vec<String> {
    let graph = project.bundler().graph();
    graph
        .field(project.root, "components")
        .and_then(Value::as_list)
        .unwrap()
        .iter()
        .filter_map(Value::as_ref_id)
        .map(|c| graph.field(c, "name").and_then(Value::as_str).unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_full_chain_upgrades_legacy_site() {
    let runner = runner();
    let packages = migrated_packages(&runner).await;
    assert_eq!(packages.ids(), [PACKAGE]);
    assert_eq!(packages.get(PACKAGE).unwrap().version, "5-unique-component-names");

    let outcome = runner.migrate(SITE, &site_v0(), &packages, None).await.unwrap();
    assert_eq!(outcome.from_version, 0);
    assert_eq!(outcome.to_version, 5);
    assert_eq!(outcome.applied.len(), 5);

    let bundle = &outcome.bundle;
    assert_eq!(bundle.version, "5-unique-component-names");
    assert_eq!(bundle.deps, [PACKAGE]);
    assert_eq!(record(bundle, "n1").fields["tag"], json!("div"));
    assert!(!record(bundle, "n1").fields.contains_key("tagName"));
    assert_eq!(record(bundle, "a1").fields["kind"], json!("prop"));
    assert_eq!(record(bundle, "a2").fields["kind"], json!("state"));
    assert_eq!(record(bundle, "e1").type_name, "CustomCode");
    assert_eq!(record(bundle, "c1").fields["name"], json!("Button 2"));
    assert_eq!(record(bundle, "c2").fields["name"], json!("Button 3"));
    assert_eq!(
        record(bundle, "n2").fields["component"],
        json!({ "ref": "p2", "uuid": PACKAGE })
    );
}

#[tokio::test]
async fn test_stepwise_migration_matches_direct() {
    let runner = runner();
    let packages = migrated_packages(&runner).await;

    let direct = runner.migrate(SITE, &site_v0(), &packages, None).await.unwrap();
    let halfway = runner.migrate(SITE, &site_v0(), &packages, Some(3)).await.unwrap();
    assert_eq!(halfway.bundle.version, "3-param-kind");
    assert_eq!(record(&halfway.bundle, "e1").type_name, "CodeExpr");

    let rest = runner.migrate(SITE, &halfway.bundle, &packages, None).await.unwrap();
    assert_eq!(rest.from_version, 3);
    assert_eq!(rest.applied.len(), 2);
    assert_eq!(rest.bundle, direct.bundle);
}

#[tokio::test]
async fn test_reapplying_is_noop() {
    let runner = runner();
    let packages = migrated_packages(&runner).await;
    let once = runner.migrate(SITE, &site_v0(), &packages, None).await.unwrap();
    let twice = runner.migrate(SITE, &once.bundle, &packages, None).await.unwrap();
    assert!(twice.is_noop());
    assert_eq!(twice.bundle, once.bundle);
}

#[tokio::test]
async fn test_open_migrates_and_persists() {
    let store = seeded_store();
    let loader = ProjectLoader::new(store.clone(), runner());

    let project = loader.open(SITE).await.unwrap();
    assert!(project.migrated);
    assert_eq!(project.revision, 2);
    assert_eq!(project.version, "5-unique-component-names");
    assert!(project.warnings.is_empty());
    assert_eq!(component_names(&project), ["Button 2", "Button 3"]);

    let history = store.history(SITE);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].data, site_v0());
    assert_eq!(history[1].data.version, "5-unique-component-names");

    // Packages are migrated in memory only.
    assert_eq!(store.history(PACKAGE).len(), 1);

    let reopened = loader.open(SITE).await.unwrap();
    assert!(!reopened.migrated);
    assert_eq!(reopened.revision, 2);
}

#[tokio::test]
async fn test_save_writes_next_revision() {
    let store = seeded_store();
    let loader = ProjectLoader::new(store.clone(), runner());
    let mut project = loader.open(SITE).await.unwrap();

    let first: InstId = project
        .bundler()
        .graph()
        .field(project.root, "components")
        .and_then(Value::as_list)
        .and_then(|list| list.first())
        .and_then(Value::as_ref_id)
        .unwrap();
    project
        .bundler_mut()
        .graph_mut()
        .set_field(first, "name", Value::from("Primary button"))
        .unwrap();

    let saved = loader.save(&mut project).await.unwrap();
    assert_eq!(project.revision, 3);
    assert_eq!(project.session().stats().reserialized, 1);
    assert_eq!(record(&saved, "c1").fields["name"], json!("Primary button"));

    let stored = store.load_raw_bundle(SITE).await.unwrap().unwrap();
    assert_eq!(stored.revision, 3);
    assert_eq!(stored.data, saved);
}

#[tokio::test]
async fn test_failed_migration_leaves_store_untouched() {
    fn explode(_: &mut Bundle) -> anyhow::Result<()> {
        anyhow::bail!("corrupt template")
    }
    fn baseline(_: &mut Bundle) -> anyhow::Result<()> {
        Ok(())
    }

    let store = Arc::new(MemoryBundleStore::new());
    store.put(SITE, Bundle::new("", "root"));
    let migrations = MigrationRegistry::new(vec![
        Migration::bundled(1, "baseline", "", baseline),
        Migration::bundled(2, "explode", "", explode),
    ])
    .unwrap();
    let loader = ProjectLoader::new(store.clone(), runner_with(migrations));

    let err = loader.open(SITE).await.unwrap_err();
    match err {
        BundleError::Migration(failure) => {
            assert_eq!(failure.migration, "2-explode");
            assert_eq!(failure.entity_id, SITE);
            assert_eq!(failure.original, Bundle::new("", "root"));
            assert!(failure.to_string().contains("corrupt template"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.history(SITE).len(), 1);
}

/// A current-shape site with one component and no packages.
fn standalone_site() -> Bundle {
    Bundle::from_json(
        &json!({
            "version": "",
            "root": "s",
            "map": {
                "s": {
                    "type": "Site",
                    "components": [{ "ref": "c" }],
                    "projectDependencies": [],
                    "styleTokens": []
                },
                "c": {
                    "type": "Component",
                    "uuid": "uuid-button",
                    "name": "Button",
                    "params": [],
                    "tplTree": { "ref": "n" },
                    "variants": []
                },
                "n": {
                    "type": "TplTag",
                    "tag": "div",
                    "children": [],
                    "vsettings": []
                }
            },
            "deps": []
        })
        .to_string(),
    )
    .unwrap()
}

struct DropComponentsThenFail;

#[async_trait]
impl UnbundledMigration for DropComponentsThenFail {
    async fn migrate(&self, ctx: &mut UnbundledContext<'_>) -> anyhow::Result<()> {
        let root = ctx.root;
        ctx.bundler
            .graph_mut()
            .set_field(root, "components", Value::List(vec![]))?;
        anyhow::bail!("template cannot be rewritten")
    }
}

struct ClearComponentNames;

#[async_trait]
impl UnbundledMigration for ClearComponentNames {
    async fn migrate(&self, ctx: &mut UnbundledContext<'_>) -> anyhow::Result<()> {
        let root = ctx.root;
        let graph = ctx.bundler.graph_mut();
        let components: Vec<InstId> = graph
            .field(root, "components")
            .and_then(Value::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_ref_id)
            .collect();
        for component in components {
            graph.set_field(component, "name", Value::Null)?;
        }
        Ok(())
    }
}

fn baseline(_: &mut Bundle) -> anyhow::Result<()> {
    Ok(())
}

async fn open_with_unbundled_step(step: Arc<dyn UnbundledMigration>, name: &'static str) -> BundleError {
    let store = Arc::new(MemoryBundleStore::new());
    store.put(SITE, standalone_site());
    let migrations = MigrationRegistry::new(vec![
        Migration::bundled(1, "baseline", "", baseline),
        Migration::unbundled(2, name, "", step),
    ])
    .unwrap();
    let loader = ProjectLoader::new(store.clone(), runner_with(migrations));

    let err = loader.open(SITE).await.unwrap_err();
    assert_eq!(store.history(SITE).len(), 1);
    assert_eq!(store.history(SITE)[0].data, standalone_site());
    err
}

#[tokio::test]
async fn test_failing_unbundled_step_discards_graph_edits() {
    let err = open_with_unbundled_step(Arc::new(DropComponentsThenFail), "drop-components").await;
    match err {
        BundleError::Migration(failure) => {
            assert_eq!(failure.migration, "2-drop-components");
            assert_eq!(failure.entity_id, SITE);
            assert_eq!(failure.original, standalone_site());
            assert!(failure.to_string().contains("template cannot be rewritten"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unbundled_step_that_breaks_rebundle_fails() {
    let err = open_with_unbundled_step(Arc::new(ClearComponentNames), "clear-names").await;
    match err {
        BundleError::Migration(failure) => {
            assert_eq!(failure.migration, "2-clear-names");
            assert_eq!(failure.original, standalone_site());
            assert!(matches!(
                failure.cause.downcast_ref::<BundleError>(),
                Some(BundleError::FieldType { field, .. }) if field == "name"
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failing_package_blocks_open() {
    let store = seeded_store();
    let mut broken = package_v0();
    broken
        .map
        .get_mut("p3")
        .unwrap()
        .fields
        .insert("tag".into(), json!("a"));
    store.put(PACKAGE, broken);

    let loader = ProjectLoader::new(store.clone(), runner());
    let err = loader.open(SITE).await.unwrap_err();
    match err {
        BundleError::Migration(failure) => {
            assert_eq!(failure.migration, "2-rename-tag-field");
            assert_eq!(failure.entity_id, PACKAGE);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.history(SITE).len(), 1);
}

#[tokio::test]
async fn test_cyclic_packages_are_rejected() {
    let store = seeded_store();
    let mut package = package_v0();
    package.deps = vec![SITE.to_string()];
    store.put(PACKAGE, package);

    let loader = ProjectLoader::new(store, runner());
    let err = loader.open(SITE).await.unwrap_err();
    match err {
        BundleError::CyclicDependency { cycle } => assert_eq!(cycle, [SITE, PACKAGE, SITE]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_package_is_reported() {
    let store = Arc::new(MemoryBundleStore::new());
    store.put(SITE, site_v0());
    let loader = ProjectLoader::new(store, runner());
    let err = loader.open(SITE).await.unwrap_err();
    assert!(matches!(err, BundleError::MissingDependency(id) if id == PACKAGE));
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let loader = ProjectLoader::new(Arc::new(MemoryBundleStore::new()), runner());
    let err = loader.open("nowhere").await.unwrap_err();
    assert!(matches!(err, BundleError::NotFound(id) if id == "nowhere"));
}

#[tokio::test]
async fn test_future_version_is_unsupported() {
    let store = seeded_store();
    let mut site = site_v0();
    site.version = "9-from-the-future".into();
    store.put(SITE, site);

    let loader = ProjectLoader::new(store, runner());
    let err = loader.open(SITE).await.unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedVersion { latest: 5, .. }));
}

#[tokio::test]
async fn test_unreachable_records_warn_unless_strict() {
    // Unbundled steps re-bundle from the root, so start from a current bundle.
    let runner = runner();
    let packages = migrated_packages(&runner).await;
    let mut site = runner.migrate(SITE, &site_v0(), &packages, None).await.unwrap().bundle;
    let store = seeded_store();
    site.map.insert(
        "orphan".into(),
        bundlegraph_core::BundledInst::new("Variant")
            .with_field("uuid", json!("v-old"))
            .with_field("name", json!("old")),
    );
    store.put(SITE, site);

    let lenient = ProjectLoader::new(store.clone(), Arc::clone(&runner));
    let project = lenient.open(SITE).await.unwrap();
    assert!(project
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::Unreachable && w.address.local_id == "orphan"));
    assert!(!project.migrated);
    assert_eq!(project.revision, 2);

    let strict = ProjectLoader::new(store.clone(), runner).with_settings(MigrationSettings {
        fail_on_warnings: true,
        ..MigrationSettings::default()
    });
    let err = strict.open(SITE).await.unwrap_err();
    assert!(matches!(err, BundleError::InvalidOperation(_)));
    assert_eq!(store.history(SITE).len(), 2);
}

#[tokio::test]
async fn test_file_store_backs_project_loader() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileBundleStore::new(dir.path()));
    store.save_raw_bundle(SITE, &site_v0(), 1).await.unwrap();
    store.save_raw_bundle(PACKAGE, &package_v0(), 1).await.unwrap();

    let loader = ProjectLoader::new(store.clone(), runner());
    let project = loader.open(SITE).await.unwrap();
    assert_eq!(project.revision, 2);

    let on_disk = std::fs::read_to_string(dir.path().join("site-main.json")).unwrap();
    assert!(on_disk.contains("5-unique-component-names"));
    assert!(on_disk.contains("\"revision\": 2"));
}
