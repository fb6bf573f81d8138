use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use bundlegraph_bundler::{generator_for, Bundler, LocalIdGenerator, ShortIdGenerator};
use bundlegraph_core::{
    Bundle, BundleError, BundlerSettings, MigrationFailure, ModelRegistry, Result,
};

use crate::loader::PackageSet;
use crate::migration::{
    parse_version, Migration, MigrationRecord, MigrationRegistry, MigrationStep, UnbundledContext,
};

/// Builds the local-id generator of every session the runner opens.
pub type IdGeneratorFactory = Arc<dyn Fn() -> Box<dyn LocalIdGenerator> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub bundle: Bundle,
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<MigrationRecord>,
}

impl MigrationOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies pending migrations to stored bundles.
pub struct MigrationRunner {
    migrations: Arc<MigrationRegistry>,
    models: Arc<ModelRegistry>,
    id_factory: IdGeneratorFactory,
}

impl fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("latest", &self.migrations.latest_tag())
            .field("types", &self.models.len())
            .finish()
    }
}

impl MigrationRunner {
    pub fn new(migrations: Arc<MigrationRegistry>, models: Arc<ModelRegistry>) -> Self {
        Self::with_id_generator(
            migrations,
            models,
            Arc::new(|| Box::new(ShortIdGenerator::default()) as Box<dyn LocalIdGenerator>),
        )
    }

    pub fn with_id_generator(
        migrations: Arc<MigrationRegistry>,
        models: Arc<ModelRegistry>,
        id_factory: IdGeneratorFactory,
    ) -> Self {
        Self {
            migrations,
            models,
            id_factory,
        }
    }

    pub fn from_settings(
        migrations: Arc<MigrationRegistry>,
        models: Arc<ModelRegistry>,
        settings: &BundlerSettings,
    ) -> Self {
        let settings = settings.clone();
        Self::with_id_generator(migrations, models, Arc::new(move || generator_for(&settings)))
    }

    pub fn migrations(&self) -> &Arc<MigrationRegistry> {
        &self.migrations
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// A fresh, empty bundling session.
    pub fn session(&self) -> Bundler {
        Bundler::with_id_generator(Arc::clone(&self.models), (self.id_factory)())
    }

    /// Migrates `bundle` to `target`, or to the latest version when `None`.
    ///
    /// Steps run on a private copy, each stamping its tag into the copy's
    /// version. If any step fails the error carries the untouched input and
    /// nothing of the partial run is returned.
    pub async fn migrate(
        &self,
        entity_id: &str,
        bundle: &Bundle,
        deps: &PackageSet,
        target: Option<u32>,
    ) -> Result<MigrationOutcome> {
        let latest = self.migrations.latest_version();
        let from = match parse_version(&bundle.version) {
            Some(v) if v <= latest => v,
            _ => {
                return Err(BundleError::UnsupportedVersion {
                    found: bundle.version.clone(),
                    latest,
                })
            }
        };
        let target = target.unwrap_or(latest);
        if target > latest {
            return Err(BundleError::InvalidOperation(format!(
                "target version {target} is newer than the latest migration ({latest})"
            )));
        }

        let mut outcome = MigrationOutcome {
            bundle: bundle.clone(),
            from_version: from,
            to_version: from.max(target),
            applied: Vec::new(),
        };
        if from >= target {
            debug!(entity_id, version = %bundle.version, "bundle is up to date");
            return Ok(outcome);
        }

        for migration in self.migrations.pending(from, target) {
            if let Err(cause) = self.apply(migration, entity_id, &mut outcome.bundle, deps).await {
                error!(
                    migration = %migration.tag(),
                    entity_id,
                    error = %cause,
                    "migration failed"
                );
                return Err(MigrationFailure {
                    migration: migration.tag(),
                    entity_id: entity_id.to_string(),
                    cause,
                    original: bundle.clone(),
                }
                .into());
            }
            outcome.bundle.version = migration.tag();
            outcome.applied.push(MigrationRecord::for_migration(migration));
            debug!(migration = %migration.tag(), entity_id, kind = %migration.kind(), "applied migration");
        }

        info!(
            entity_id,
            from = from,
            to = target,
            steps = outcome.applied.len(),
            "migrated bundle"
        );
        Ok(outcome)
    }

    async fn apply(
        &self,
        migration: &Migration,
        entity_id: &str,
        working: &mut Bundle,
        deps: &PackageSet,
    ) -> anyhow::Result<()> {
        match &migration.step {
            MigrationStep::Bundled(transform) => transform(working),
            MigrationStep::Unbundled(step) => {
                let mut bundler = self.session();
                let dependency_roots = deps.load_into(&mut bundler)?;
                let root = bundler.unbundle(working, entity_id)?;
                {
                    let mut ctx = UnbundledContext {
                        bundler: &mut bundler,
                        root,
                        entity_id,
                        dependency_roots,
                    };
                    step.migrate(&mut ctx).await?;
                }
                *working = bundler.bundle(root, entity_id, &migration.tag())?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlegraph_bundler::SequentialIdGenerator;
    use bundlegraph_core::{design_registry, BundledInst};
    use serde_json::json;

    fn add_marker(bundle: &mut Bundle) -> anyhow::Result<()> {
        for record in bundle.map.values_mut() {
            if record.type_name == "StyleToken" {
                record.fields.insert("value".into(), json!("migrated"));
            }
        }
        Ok(())
    }

    fn explode(_: &mut Bundle) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    fn runner(migrations: Vec<Migration>) -> MigrationRunner {
        MigrationRunner::with_id_generator(
            Arc::new(MigrationRegistry::new(migrations).unwrap()),
            Arc::new(design_registry().unwrap()),
            Arc::new(|| Box::new(SequentialIdGenerator::new()) as Box<dyn LocalIdGenerator>),
        )
    }

    fn token_bundle(version: &str) -> Bundle {
        let mut bundle = Bundle::new(version, "t");
        bundle.map.insert(
            "t".into(),
            BundledInst::new("StyleToken")
                .with_field("uuid", json!("tok"))
                .with_field("name", json!("brand"))
                .with_field("value", json!("#fff")),
        );
        bundle
    }

    #[tokio::test]
    async fn stamps_each_step() {
        let runner = runner(vec![
            Migration::bundled(1, "first", "", add_marker),
            Migration::bundled(2, "second", "", add_marker),
        ]);
        let outcome = runner
            .migrate("tok", &token_bundle(""), &PackageSet::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.bundle.version, "2-second");
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.bundle.map["t"].fields["value"], json!("migrated"));
    }

    #[tokio::test]
    async fn failure_returns_original() {
        let runner = runner(vec![
            Migration::bundled(1, "first", "", add_marker),
            Migration::bundled(2, "explode", "", explode),
        ]);
        let input = token_bundle("");
        let err = runner
            .migrate("tok", &input, &PackageSet::new(), None)
            .await
            .unwrap_err();
        match err {
            BundleError::Migration(failure) => {
                assert_eq!(failure.migration, "2-explode");
                assert_eq!(failure.entity_id, "tok");
                assert_eq!(failure.original, input);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_versions_from_the_future() {
        let runner = runner(vec![Migration::bundled(1, "first", "", add_marker)]);
        let err = runner
            .migrate("tok", &token_bundle("7-later"), &PackageSet::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedVersion { latest: 1, .. }));
    }

    #[tokio::test]
    async fn current_bundle_is_untouched() {
        let runner = runner(vec![Migration::bundled(1, "first", "", explode)]);
        let input = token_bundle("1-first");
        let outcome = runner
            .migrate("tok", &input, &PackageSet::new(), None)
            .await
            .unwrap();
        assert!(outcome.is_noop());
        assert_eq!(outcome.bundle, input);
    }
}
