use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use bundlegraph_core::{Address, BundleError, BundleId, InstId, LocalId, Result};

/// Address to instance table for one bundler session.
///
/// Every instance the session has bundled or materialized is bound to
/// exactly one address, and the binding never changes for the lifetime of
/// the cache.
#[derive(Debug, Default, Clone)]
pub struct IdentityCache {
    by_address: FxHashMap<Address, InstId>,
    by_instance: FxHashMap<InstId, Address>,
    owned: BTreeMap<BundleId, BTreeSet<LocalId>>,
    roots: BTreeMap<BundleId, LocalId>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<InstId> {
        self.by_address.get(address).copied()
    }

    pub fn address_of(&self, inst: InstId) -> Option<&Address> {
        self.by_instance.get(&inst)
    }

    pub fn contains_local(&self, bundle_id: &str, local_id: &str) -> bool {
        self.owned
            .get(bundle_id)
            .is_some_and(|ids| ids.contains(local_id))
    }

    pub fn register(&mut self, address: Address, inst: InstId) -> Result<()> {
        if let Some(existing) = self.by_instance.get(&inst) {
            if *existing == address {
                return Ok(());
            }
            return Err(BundleError::InvalidOperation(format!(
                "instance {inst} is already bound to {existing}, cannot rebind to {address}"
            )));
        }
        if let Some(existing) = self.by_address.get(&address) {
            return Err(BundleError::InvalidOperation(format!(
                "address {address} is already bound to instance {existing}"
            )));
        }
        self.owned
            .entry(address.bundle_id.clone())
            .or_default()
            .insert(address.local_id.clone());
        self.by_instance.insert(inst, address.clone());
        self.by_address.insert(address, inst);
        Ok(())
    }

    pub fn set_root(&mut self, bundle_id: impl Into<BundleId>, local_id: impl Into<LocalId>) {
        self.roots.insert(bundle_id.into(), local_id.into());
    }

    pub fn root_of(&self, bundle_id: &str) -> Option<InstId> {
        let local_id = self.roots.get(bundle_id)?;
        self.get(&Address::new(bundle_id, local_id.clone()))
    }

    /// Bundles this session has loaded or produced, in id order.
    pub fn bundles(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    pub fn local_ids_of(&self, bundle_id: &str) -> impl Iterator<Item = &str> {
        self.owned
            .get(bundle_id)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    /// Copy of this cache with every binding of `bundle_id` removed.
    pub fn without_bundle(&self, bundle_id: &str) -> Self {
        let mut copy = self.clone();
        copy.by_address.retain(|addr, _| addr.bundle_id != bundle_id);
        copy.by_instance.retain(|_, addr| addr.bundle_id != bundle_id);
        copy.owned.remove(bundle_id);
        copy.roots.remove(bundle_id);
        copy
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
