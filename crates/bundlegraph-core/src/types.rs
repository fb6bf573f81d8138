use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally stable identifier of the entity whose contents make up one bundle.
pub type BundleId = String;

/// Identifier unique only within one bundle's map.
pub type LocalId = String;

/// Position of one instance within one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub bundle_id: BundleId,
    pub local_id: LocalId,
}

impl Address {
    pub fn new(bundle_id: impl Into<BundleId>, local_id: impl Into<LocalId>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bundle_id, self.local_id)
    }
}
