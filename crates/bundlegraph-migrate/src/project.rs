use std::sync::Arc;

use tracing::info;

use bundlegraph_bundler::{Bundler, FastBundler, IntegrityChecker, Warning};
use bundlegraph_core::{Bundle, BundleError, BundleId, InstId, MigrationSettings, Result};

use crate::loader::{DependencyLoader, PackageSet};
use crate::runner::MigrationRunner;
use crate::store::BundleStore;

/// A project opened for editing: its live graph plus the packages it
/// imports, all in one session.
#[derive(Debug)]
pub struct OpenedProject {
    pub entity_id: BundleId,
    /// Storage revision the session was loaded from or last saved as.
    pub revision: u64,
    pub root: InstId,
    pub version: String,
    /// Whether opening ran any migration.
    pub migrated: bool,
    pub packages: PackageSet,
    pub warnings: Vec<Warning>,
    session: FastBundler,
}

impl OpenedProject {
    pub fn bundler(&self) -> &Bundler {
        self.session.bundler()
    }

    pub fn bundler_mut(&mut self) -> &mut Bundler {
        self.session.bundler_mut()
    }

    pub fn session(&self) -> &FastBundler {
        &self.session
    }
}

/// Loads projects from storage through the migration pipeline and saves
/// them back.
pub struct ProjectLoader {
    store: Arc<dyn BundleStore>,
    runner: Arc<MigrationRunner>,
    loader: DependencyLoader,
    checker: IntegrityChecker,
    settings: MigrationSettings,
}

impl ProjectLoader {
    pub fn new(store: Arc<dyn BundleStore>, runner: Arc<MigrationRunner>) -> Self {
        Self {
            loader: DependencyLoader::new(Arc::clone(&store), Arc::clone(&runner)),
            checker: IntegrityChecker::new(Arc::clone(runner.models())),
            store,
            runner,
            settings: MigrationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: MigrationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn runner(&self) -> &Arc<MigrationRunner> {
        &self.runner
    }

    /// Loads `entity_id`, brings it and its dependencies to the latest
    /// version and unbundles everything into a new session. Storage is only
    /// written once every step has succeeded.
    pub async fn open(&self, entity_id: &str) -> Result<OpenedProject> {
        let stored = self
            .store
            .load_raw_bundle(entity_id)
            .await?
            .ok_or_else(|| BundleError::NotFound(entity_id.to_string()))?;

        let packages = self.loader.resolve(entity_id, &stored.data).await?;
        let outcome = self
            .runner
            .migrate(entity_id, &stored.data, &packages, None)
            .await?;

        let warnings = if self.settings.verify_integrity {
            let report = self.checker.check(entity_id, &outcome.bundle, &packages)?;
            if self.settings.fail_on_warnings && !report.warnings.is_empty() {
                return Err(BundleError::InvalidOperation(format!(
                    "`{entity_id}` has {} integrity warning(s)",
                    report.warnings.len()
                )));
            }
            report.warnings
        } else {
            Vec::new()
        };

        let mut session = FastBundler::new(self.runner.session());
        packages.load_into(session.bundler_mut())?;
        let root = session.unbundle(&outcome.bundle, entity_id)?;

        let migrated = !outcome.is_noop();
        let mut revision = stored.revision;
        if migrated && self.settings.persist_migrated {
            revision += 1;
            self.store
                .save_raw_bundle(entity_id, &outcome.bundle, revision)
                .await?;
            info!(entity_id, revision, version = %outcome.bundle.version, "persisted migrated bundle");
        }

        Ok(OpenedProject {
            entity_id: entity_id.to_string(),
            revision,
            root,
            version: outcome.bundle.version,
            migrated,
            packages,
            warnings,
            session,
        })
    }

    /// Bundles the project, checks it and stores it as the next revision.
    pub async fn save(&self, project: &mut OpenedProject) -> Result<Bundle> {
        let bundle = project
            .session
            .bundle(project.root, &project.entity_id, &project.version)?;
        let report = self
            .checker
            .check(&project.entity_id, &bundle, project.session.bundler())?;

        let next = project.revision + 1;
        self.store
            .save_raw_bundle(&project.entity_id, &bundle, next)
            .await?;
        project.revision = next;
        project.warnings = report.warnings;
        info!(entity_id = %project.entity_id, revision = next, "saved project");
        Ok(bundle)
    }
}
