//! The serialized bundle format.
//!
//! Every map in a [`Bundle`] is ordered, so serializing the same bundle
//! always yields the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::registry::{FieldKind, ModelRegistry};
use crate::types::{Address, BundleId, LocalId};

pub type JsonValue = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub version: String,
    pub root: LocalId,
    pub map: BTreeMap<LocalId, BundledInst>,
    #[serde(default)]
    pub deps: Vec<BundleId>,
}

/// One serialized instance: its type tag plus its field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundledInst {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl BundledInst {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// References held by this record, in declared field order. Records of
    /// unregistered types have none.
    pub fn refs(&self, registry: &ModelRegistry) -> Vec<RefSite> {
        let mut out = Vec::new();
        if let Some(fields) = registry.fields_of(&self.type_name) {
            for field in fields.iter().filter(|f| f.kind.holds_refs()) {
                if let Some(value) = self.fields.get(&field.name) {
                    collect_refs(&field.kind, value, &field.name, &mut out);
                }
            }
        }
        out
    }
}

/// A reference as encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WireRef {
    Local(LocalId),
    External {
        bundle_id: BundleId,
        local_id: LocalId,
    },
}

impl WireRef {
    /// Accepts `{"ref": id}` and `{"ref": id, "uuid": bundle}` and nothing else.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let local_id = obj.get("ref")?.as_str()?.to_string();
        match obj.get("uuid") {
            None if obj.len() == 1 => Some(Self::Local(local_id)),
            Some(bundle) if obj.len() == 2 => Some(Self::External {
                bundle_id: bundle.as_str()?.to_string(),
                local_id,
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Local(local_id) => json!({ "ref": local_id }),
            Self::External {
                bundle_id,
                local_id,
            } => json!({ "ref": local_id, "uuid": bundle_id }),
        }
    }

    /// Address this reference points at when it appears in bundle `owner`.
    pub fn resolve(&self, owner: &str) -> Address {
        match self {
            Self::Local(local_id) => Address::new(owner, local_id.clone()),
            Self::External {
                bundle_id,
                local_id,
            } => Address::new(bundle_id.clone(), local_id.clone()),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External { .. })
    }
}

/// A reference found inside a record, with the field path it sits at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSite {
    pub field: String,
    pub target: WireRef,
    pub weak: bool,
}

fn collect_refs(kind: &FieldKind, value: &JsonValue, path: &str, out: &mut Vec<RefSite>) {
    match (kind, value) {
        (FieldKind::Ref(spec), _) => {
            if let Some(target) = WireRef::parse(value) {
                out.push(RefSite {
                    field: path.to_string(),
                    target,
                    weak: spec.weak,
                });
            }
        }
        (FieldKind::List(inner), JsonValue::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                collect_refs(inner, item, &format!("{path}[{i}]"), out);
            }
        }
        (FieldKind::Map(inner), JsonValue::Object(entries)) => {
            for (key, item) in entries {
                collect_refs(inner, item, &format!("{path}.{key}"), out);
            }
        }
        _ => {}
    }
}

impl Bundle {
    pub fn new(version: impl Into<String>, root: impl Into<LocalId>) -> Self {
        Self {
            version: version.into(),
            root: root.into(),
            map: BTreeMap::new(),
            deps: Vec::new(),
        }
    }

    pub fn root_record(&self) -> Option<&BundledInst> {
        self.map.get(&self.root)
    }

    /// Every cross-bundle reference, keyed by the local id of the record
    /// holding it.
    pub fn cross_references(&self, registry: &ModelRegistry) -> Vec<(LocalId, RefSite)> {
        self.map
            .iter()
            .flat_map(|(iid, record)| {
                record
                    .refs(registry)
                    .into_iter()
                    .filter(|site| site.target.is_external())
                    .map(move |site| (iid.clone(), site))
            })
            .collect()
    }

    /// Distinct bundle ids targeted by cross-bundle references.
    pub fn referenced_dependencies(&self, registry: &ModelRegistry) -> BTreeSet<BundleId> {
        self.cross_references(registry)
            .into_iter()
            .filter_map(|(_, site)| match site.target {
                WireRef::External { bundle_id, .. } => Some(bundle_id),
                WireRef::Local(_) => None,
            })
            .collect()
    }

    /// Local ids reachable from the root through in-bundle references.
    pub fn reachable(&self, registry: &ModelRegistry) -> BTreeSet<LocalId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(iid) = stack.pop() {
            let Some(record) = self.map.get(&iid) else {
                continue;
            };
            if !seen.insert(iid) {
                continue;
            }
            for site in record.refs(registry) {
                if let WireRef::Local(target) = site.target {
                    if !seen.contains(&target) {
                        stack.push(target);
                    }
                }
            }
        }
        seen
    }

    /// Drops records not reachable from the root and returns their ids.
    pub fn remove_unreachable(&mut self, registry: &ModelRegistry) -> Vec<LocalId> {
        let keep = self.reachable(registry);
        let removed: Vec<LocalId> = self
            .map
            .keys()
            .filter(|iid| !keep.contains(*iid))
            .cloned()
            .collect();
        for iid in &removed {
            self.map.remove(iid);
        }
        removed
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 of the canonical encoding, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}
