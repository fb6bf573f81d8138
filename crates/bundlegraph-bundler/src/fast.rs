use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use bundlegraph_core::{Bundle, BundleId, InstId, LocalId, Result};

use crate::bundler::{Bundler, Serialized};

#[derive(Debug, Clone)]
struct CachedRecord {
    revision: u64,
    local_id: LocalId,
    out: Serialized,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastBundleStats {
    pub reused: usize,
    pub reserialized: usize,
    pub pruned: usize,
}

/// Incremental bundler.
///
/// Remembers the serialized record of every instance it has written,
/// together with the instance revision at that time. Later calls reuse the
/// record of any instance whose revision has not moved and only
/// re-serialize the rest. The output is identical to what
/// [`Bundler::bundle`] produces for the same graph.
#[derive(Debug)]
pub struct FastBundler {
    bundler: Bundler,
    bundle_id: Option<BundleId>,
    records: FxHashMap<InstId, CachedRecord>,
    stats: FastBundleStats,
}

impl FastBundler {
    pub fn new(bundler: Bundler) -> Self {
        Self {
            bundler,
            bundle_id: None,
            records: FxHashMap::default(),
            stats: FastBundleStats::default(),
        }
    }

    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    pub fn bundler_mut(&mut self) -> &mut Bundler {
        &mut self.bundler
    }

    pub fn into_inner(self) -> Bundler {
        self.bundler
    }

    /// Counters from the most recent [`bundle`](Self::bundle) call.
    pub fn stats(&self) -> FastBundleStats {
        self.stats
    }

    pub fn cached_records(&self) -> usize {
        self.records.len()
    }

    /// Forgets the cached record of one instance.
    pub fn invalidate(&mut self, inst: InstId) {
        self.records.remove(&inst);
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.bundle_id = None;
    }

    /// Unbundles through the inner session, then primes the record cache
    /// with the loaded graph so the first save only touches what changed.
    pub fn unbundle(&mut self, bundle: &Bundle, bundle_id: &str) -> Result<InstId> {
        let root = self.bundler.unbundle(bundle, bundle_id)?;
        if let Err(err) = self.bundle(root, bundle_id, &bundle.version) {
            debug!(bundle_id, error = %err, "loaded graph does not bundle cleanly; cache left cold");
            self.records.clear();
        }
        Ok(root)
    }

    pub fn bundle(&mut self, root: InstId, bundle_id: &str, version: &str) -> Result<Bundle> {
        if self.bundle_id.as_deref() != Some(bundle_id) {
            self.records.clear();
            self.bundle_id = Some(bundle_id.to_string());
        }

        let mut stats = FastBundleStats::default();
        let mut seen = FxHashSet::default();
        let records = &mut self.records;
        let bundle = self.bundler.walk(root, bundle_id, version, |bundler, inst, local_id| {
            seen.insert(inst);
            let revision = bundler.graph().revision(inst).unwrap_or_default();
            if let Some(cached) = records.get(&inst) {
                if cached.revision == revision && cached.local_id == *local_id {
                    stats.reused += 1;
                    return Ok(cached.out.clone());
                }
            }
            let out = bundler.serialize(inst, bundle_id, local_id)?;
            stats.reserialized += 1;
            records.insert(
                inst,
                CachedRecord {
                    revision,
                    local_id: local_id.clone(),
                    out: out.clone(),
                },
            );
            Ok(out)
        })?;

        let before = self.records.len();
        self.records.retain(|inst, _| seen.contains(inst));
        stats.pruned = before - self.records.len();
        self.stats = stats;

        debug!(
            bundle_id,
            reused = stats.reused,
            reserialized = stats.reserialized,
            pruned = stats.pruned,
            "incremental bundle"
        );
        Ok(bundle)
    }
}
