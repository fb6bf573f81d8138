use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use bundlegraph_bundler::{Bundler, DependencyIndex};
use bundlegraph_core::{Address, Bundle, BundleError, BundleId, InstId, ModelRegistry, Result};

use crate::runner::MigrationRunner;
use crate::store::BundleStore;

/// Migrated dependency bundles in load order: every package comes after the
/// packages it depends on.
#[derive(Debug, Clone, Default)]
pub struct PackageSet {
    order: Vec<BundleId>,
    bundles: BTreeMap<BundleId, Bundle>,
}

impl PackageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bundle_id: impl Into<BundleId>, bundle: Bundle) {
        let bundle_id = bundle_id.into();
        if !self.bundles.contains_key(&bundle_id) {
            self.order.push(bundle_id.clone());
        }
        self.bundles.insert(bundle_id, bundle);
    }

    pub fn get(&self, bundle_id: &str) -> Option<&Bundle> {
        self.bundles.get(bundle_id)
    }

    pub fn contains(&self, bundle_id: &str) -> bool {
        self.bundles.contains_key(bundle_id)
    }

    pub fn ids(&self) -> &[BundleId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BundleId, &Bundle)> {
        self.order
            .iter()
            .filter_map(|id| self.bundles.get(id).map(|b| (id, b)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Unbundles every package into `bundler` in load order and returns
    /// each package's root. Packages the session already holds are reused.
    pub fn load_into(&self, bundler: &mut Bundler) -> Result<Vec<(BundleId, InstId)>> {
        let mut roots = Vec::with_capacity(self.order.len());
        for (bundle_id, bundle) in self.iter() {
            let root = match bundler.root_of(bundle_id) {
                Some(root) => root,
                None => bundler.unbundle(bundle, bundle_id)?,
            };
            roots.push((bundle_id.clone(), root));
        }
        Ok(roots)
    }
}

impl DependencyIndex for PackageSet {
    fn has_bundle(&self, bundle_id: &str) -> bool {
        self.contains(bundle_id)
    }

    fn type_at(&self, address: &Address) -> Option<String> {
        self.bundles.type_at(address)
    }
}

/// Bundle ids a stored bundle depends on: its declared `deps` plus every
/// bundle its references point into.
pub fn dependencies_of(bundle: &Bundle, models: &ModelRegistry) -> BTreeSet<BundleId> {
    let mut deps: BTreeSet<BundleId> = bundle.deps.iter().cloned().collect();
    deps.extend(bundle.referenced_dependencies(models));
    deps
}

struct Frame {
    bundle_id: BundleId,
    remaining: Vec<BundleId>,
}

/// Fetches and migrates the transitive dependencies of a bundle.
#[derive(Clone)]
pub struct DependencyLoader {
    store: Arc<dyn BundleStore>,
    runner: Arc<MigrationRunner>,
}

impl DependencyLoader {
    pub fn new(store: Arc<dyn BundleStore>, runner: Arc<MigrationRunner>) -> Self {
        Self { store, runner }
    }

    /// Resolves every dependency of `primary`, depth first. A package is
    /// migrated only once all of its own dependencies are, so the returned
    /// set is already in load order.
    pub async fn resolve(&self, primary_id: &str, primary: &Bundle) -> Result<PackageSet> {
        let models = Arc::clone(self.runner.models());
        let mut packages = PackageSet::new();
        let mut raw: BTreeMap<BundleId, Bundle> = BTreeMap::new();
        let mut stack = vec![Frame {
            bundle_id: primary_id.to_string(),
            remaining: pending(primary, &models),
        }];

        loop {
            let next = match stack.last_mut() {
                Some(frame) => frame.remaining.pop(),
                None => break,
            };

            match next {
                Some(dep) => {
                    if packages.contains(&dep) {
                        continue;
                    }
                    if let Some(pos) = stack.iter().position(|f| f.bundle_id == dep) {
                        let mut cycle: Vec<BundleId> =
                            stack[pos..].iter().map(|f| f.bundle_id.clone()).collect();
                        cycle.push(dep);
                        return Err(BundleError::CyclicDependency { cycle });
                    }

                    debug!(dependency = %dep, "fetching dependency");
                    let stored = self
                        .store
                        .load_raw_bundle(&dep)
                        .await?
                        .ok_or_else(|| BundleError::MissingDependency(dep.clone()))?;
                    stack.push(Frame {
                        bundle_id: dep.clone(),
                        remaining: pending(&stored.data, &models),
                    });
                    raw.insert(dep, stored.data);
                }
                None => {
                    let Some(done) = stack.pop() else { break };
                    if stack.is_empty() {
                        break;
                    }
                    let Some(bundle) = raw.remove(&done.bundle_id) else {
                        continue;
                    };
                    let outcome = self
                        .runner
                        .migrate(&done.bundle_id, &bundle, &packages, None)
                        .await?;
                    packages.insert(done.bundle_id, outcome.bundle);
                }
            }
        }

        info!(
            entity_id = primary_id,
            packages = packages.len(),
            "resolved dependencies"
        );
        Ok(packages)
    }

    /// Resolves the dependencies of `primary` and unbundles them into
    /// `bundler`, ready for the primary unbundle.
    pub async fn load_into(
        &self,
        primary_id: &str,
        primary: &Bundle,
        bundler: &mut Bundler,
    ) -> Result<PackageSet> {
        let packages = self.resolve(primary_id, primary).await?;
        packages.load_into(bundler)?;
        Ok(packages)
    }
}

/// Dependencies in pop order: ascending bundle id.
fn pending(bundle: &Bundle, models: &ModelRegistry) -> Vec<BundleId> {
    dependencies_of(bundle, models).into_iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationRegistry;
    use crate::store::MemoryBundleStore;
    use bundlegraph_core::design_registry;

    fn loader(store: Arc<MemoryBundleStore>) -> DependencyLoader {
        let runner = MigrationRunner::new(
            Arc::new(MigrationRegistry::default()),
            Arc::new(design_registry().unwrap()),
        );
        DependencyLoader::new(store, Arc::new(runner))
    }

    fn with_deps(deps: &[&str]) -> Bundle {
        let mut bundle = Bundle::new("", "root");
        bundle.deps = deps.iter().map(|d| d.to_string()).collect();
        bundle
    }

    #[tokio::test]
    async fn loads_dependencies_first() {
        let store = Arc::new(MemoryBundleStore::new());
        store.put("a", with_deps(&["b", "c"]));
        store.put("b", with_deps(&["c"]));
        store.put("c", with_deps(&[]));

        let packages = loader(store)
            .resolve("main", &with_deps(&["a"]))
            .await
            .unwrap();
        assert_eq!(packages.ids(), ["c", "b", "a"]);
    }

    #[tokio::test]
    async fn reports_cycles() {
        let store = Arc::new(MemoryBundleStore::new());
        store.put("a", with_deps(&["b"]));
        store.put("b", with_deps(&["a"]));

        let err = loader(store)
            .resolve("main", &with_deps(&["a"]))
            .await
            .unwrap_err();
        match err {
            BundleError::CyclicDependency { cycle } => assert_eq!(cycle, ["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reports_missing_packages() {
        let store = Arc::new(MemoryBundleStore::new());
        let err = loader(store)
            .resolve("main", &with_deps(&["ghost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::MissingDependency(id) if id == "ghost"));
    }
}
