use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use bundlegraph_core::{
    Address, Bundle, BundleId, FieldKind, IntegrityError, JsonValue, LocalId, ModelRegistry,
    Result, Violation, ViolationKind, WireRef,
};

use crate::bundler::Bundler;

/// Read-only view of the dependency bundles a checked bundle may point into.
pub trait DependencyIndex {
    fn has_bundle(&self, bundle_id: &str) -> bool;
    /// Type tag of the record at `address`, if it exists.
    fn type_at(&self, address: &Address) -> Option<String>;
}

/// For bundles that have no dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencies;

impl DependencyIndex for NoDependencies {
    fn has_bundle(&self, _bundle_id: &str) -> bool {
        false
    }

    fn type_at(&self, _address: &Address) -> Option<String> {
        None
    }
}

impl DependencyIndex for Bundler {
    fn has_bundle(&self, bundle_id: &str) -> bool {
        self.root_of(bundle_id).is_some()
    }

    fn type_at(&self, address: &Address) -> Option<String> {
        let inst = self.instance_at(address)?;
        self.graph().type_of(inst).map(str::to_string)
    }
}

impl DependencyIndex for BTreeMap<BundleId, Bundle> {
    fn has_bundle(&self, bundle_id: &str) -> bool {
        self.contains_key(bundle_id)
    }

    fn type_at(&self, address: &Address) -> Option<String> {
        self.get(&address.bundle_id)?
            .map
            .get(&address.local_id)
            .map(|r| r.type_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    /// Not reachable from the root.
    Unreachable,
    /// Only weak references point at the record, so nothing owns it.
    WeakOnly,
    /// A strong reference into another bundle, which this bundle cannot own.
    StrongCrossBundle { field: String, target: Address },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub address: Address,
    pub kind: WarningKind,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::Unreachable => write!(f, "{}: unreachable from root", self.address),
            WarningKind::WeakOnly => write!(f, "{}: referenced only weakly", self.address),
            WarningKind::StrongCrossBundle { field, target } => write!(
                f,
                "{} field `{}`: strong reference into dependency `{}`",
                self.address, field, target
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub bundle_id: BundleId,
    pub records: usize,
    pub reachable: usize,
    pub warnings: Vec<Warning>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &Address> {
        self.warnings
            .iter()
            .filter(|w| w.kind == WarningKind::Unreachable)
            .map(|w| &w.address)
    }
}

/// Validates bundles before they are trusted: registered types, required
/// fields, value shapes and reference targets are fatal; unreachable and
/// weakly-owned records are warnings.
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    registry: Arc<ModelRegistry>,
}

impl IntegrityChecker {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn check(&self, bundle_id: &str, bundle: &Bundle, deps: &dyn DependencyIndex) -> Result<IntegrityReport> {
        let reachable = bundle.reachable(&self.registry);
        let mut pass = Pass {
            registry: &self.registry,
            bundle_id,
            bundle,
            deps,
            declared: bundle.deps.iter().map(String::as_str).collect(),
            reachable: &reachable,
            violations: Vec::new(),
            warnings: Vec::new(),
            inbound: BTreeMap::new(),
        };

        if !bundle.map.contains_key(&bundle.root) {
            pass.violations.push(Violation {
                address: Address::new(bundle_id, bundle.root.clone()),
                field: None,
                kind: ViolationKind::MissingRoot,
            });
        }

        for (iid, record) in &bundle.map {
            let address = Address::new(bundle_id, iid.clone());
            let Some(desc) = self.registry.get(&record.type_name) else {
                pass.violate(&address, None, ViolationKind::UnknownType {
                    type_name: record.type_name.clone(),
                });
                continue;
            };
            if desc.is_abstract {
                pass.violate(&address, None, ViolationKind::AbstractType {
                    type_name: record.type_name.clone(),
                });
                continue;
            }
            for field in &desc.fields {
                match record.fields.get(&field.name) {
                    None | Some(JsonValue::Null) => {
                        if field.required {
                            pass.violate(
                                &address,
                                Some(field.name.as_str()),
                                ViolationKind::MissingRequiredField,
                            );
                        }
                    }
                    Some(value) => pass.check_value(&address, &field.kind, value, &field.name),
                }
            }
            for name in record.fields.keys().filter(|k| desc.field(k).is_none()) {
                pass.violate(&address, Some(name.as_str()), ViolationKind::UnknownField);
            }
        }

        for iid in bundle.map.keys() {
            let address = Address::new(bundle_id, iid.clone());
            if !reachable.contains(iid) {
                pass.warnings.push(Warning {
                    address,
                    kind: WarningKind::Unreachable,
                });
            } else if *iid != bundle.root {
                let (strong, weak) = pass.inbound.get(iid).copied().unwrap_or_default();
                if strong == 0 && weak > 0 {
                    pass.warnings.push(Warning {
                        address,
                        kind: WarningKind::WeakOnly,
                    });
                }
            }
        }

        for warning in &pass.warnings {
            warn!(bundle_id, "integrity warning: {}", warning);
        }

        if !pass.violations.is_empty() {
            debug!(
                bundle_id,
                violations = pass.violations.len(),
                "integrity check failed"
            );
            return Err(IntegrityError {
                bundle_id: bundle_id.to_string(),
                violations: pass.violations,
            }
            .into());
        }

        Ok(IntegrityReport {
            bundle_id: bundle_id.to_string(),
            records: bundle.map.len(),
            reachable: reachable.len(),
            warnings: pass.warnings,
        })
    }
}

struct Pass<'a> {
    registry: &'a ModelRegistry,
    bundle_id: &'a str,
    bundle: &'a Bundle,
    deps: &'a dyn DependencyIndex,
    declared: BTreeSet<&'a str>,
    reachable: &'a BTreeSet<LocalId>,
    violations: Vec<Violation>,
    warnings: Vec<Warning>,
    /// Strong and weak in-bundle reference counts per record, counting
    /// only references held by reachable records.
    inbound: BTreeMap<LocalId, (usize, usize)>,
}

impl Pass<'_> {
    fn violate(&mut self, address: &Address, field: Option<&str>, kind: ViolationKind) {
        self.violations.push(Violation {
            address: address.clone(),
            field: field.map(str::to_string),
            kind,
        });
    }

    fn shape_error(&mut self, address: &Address, path: &str, kind: &FieldKind, found: &str) {
        self.violate(
            address,
            Some(path),
            ViolationKind::FieldType {
                expected: kind.to_string(),
                found: found.to_string(),
            },
        );
    }

    fn check_value(&mut self, address: &Address, kind: &FieldKind, value: &JsonValue, path: &str) {
        match (kind, value) {
            (FieldKind::String, JsonValue::String(_))
            | (FieldKind::Number, JsonValue::Number(_))
            | (FieldKind::Bool, JsonValue::Bool(_))
            | (FieldKind::Any, _) => {}
            (FieldKind::Ref(spec), value) => match WireRef::parse(value) {
                Some(target) => self.check_ref(address, &spec.target, spec.weak, &target, path),
                None => self.shape_error(address, path, kind, shape(value)),
            },
            (FieldKind::List(inner), JsonValue::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_value(address, inner, item, &format!("{path}[{i}]"));
                }
            }
            (FieldKind::Map(inner), JsonValue::Object(entries)) => {
                for (key, item) in entries {
                    self.check_value(address, inner, item, &format!("{path}.{key}"));
                }
            }
            (kind, value) => self.shape_error(address, path, kind, shape(value)),
        }
    }

    fn check_ref(&mut self, address: &Address, expected: &str, weak: bool, target: &WireRef, path: &str) {
        let target_addr = target.resolve(self.bundle_id);
        let target_type = match target {
            WireRef::Local(local_id) => {
                let Some(record) = self.bundle.map.get(local_id) else {
                    self.violate(address, Some(path), ViolationKind::DanglingReference {
                        target: target_addr,
                    });
                    return;
                };
                if self.reachable.contains(&address.local_id) {
                    let counts = self.inbound.entry(local_id.clone()).or_default();
                    if weak {
                        counts.1 += 1;
                    } else {
                        counts.0 += 1;
                    }
                }
                record.type_name.clone()
            }
            WireRef::External { bundle_id, .. } => {
                if !self.declared.contains(bundle_id.as_str()) {
                    self.violate(address, Some(path), ViolationKind::UndeclaredDependency {
                        bundle_id: bundle_id.clone(),
                    });
                    return;
                }
                let found = if self.deps.has_bundle(bundle_id) {
                    self.deps.type_at(&target_addr)
                } else {
                    None
                };
                let Some(type_name) = found else {
                    self.violate(address, Some(path), ViolationKind::DanglingReference {
                        target: target_addr,
                    });
                    return;
                };
                if !weak {
                    self.warnings.push(Warning {
                        address: address.clone(),
                        kind: WarningKind::StrongCrossBundle {
                            field: path.to_string(),
                            target: target_addr.clone(),
                        },
                    });
                }
                type_name
            }
        };

        // Unknown target types are reported on the target record itself.
        if self.registry.get(&target_type).is_some() && !self.registry.is_subtype(&target_type, expected) {
            self.violate(
                address,
                Some(path),
                ViolationKind::FieldType {
                    expected: format!("ref<{expected}>"),
                    found: format!("ref<{target_type}>"),
                },
            );
        }
    }
}

fn shape(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlegraph_core::{BundleError, BundledInst, TypeDef};
    use serde_json::json;

    fn checker() -> IntegrityChecker {
        IntegrityChecker::new(Arc::new(
            ModelRegistry::builder()
                .with(
                    TypeDef::new("Page")
                        .required("title", FieldKind::String)
                        .required("blocks", FieldKind::list(FieldKind::reference("Block")))
                        .optional("pinned", FieldKind::weak_ref("Block")),
                )
                .with(TypeDef::new("Block").required("text", FieldKind::String))
                .build()
                .unwrap(),
        ))
    }

    fn page(blocks: JsonValue) -> BundledInst {
        BundledInst::new("Page")
            .with_field("title", json!("home"))
            .with_field("blocks", blocks)
    }

    fn block(text: &str) -> BundledInst {
        BundledInst::new("Block").with_field("text", json!(text))
    }

    fn violations(result: Result<IntegrityReport>) -> Vec<Violation> {
        match result {
            Err(BundleError::Integrity(err)) => err.violations,
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn clean_bundle_passes() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert("p".into(), page(json!([{"ref": "b"}])));
        bundle.map.insert("b".into(), block("hello"));
        let report = checker().check("doc", &bundle, &NoDependencies).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.reachable, 2);
    }

    #[test]
    fn missing_required_field_is_named() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert(
            "p".into(),
            BundledInst::new("Page").with_field("blocks", json!([])),
        );
        let found = violations(checker().check("doc", &bundle, &NoDependencies));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, Address::new("doc", "p"));
        assert_eq!(found[0].field.as_deref(), Some("title"));
        assert_eq!(found[0].kind, ViolationKind::MissingRequiredField);
    }

    #[test]
    fn dangling_reference_names_the_missing_id() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert("p".into(), page(json!([{"ref": "nope"}])));
        let found = violations(checker().check("doc", &bundle, &NoDependencies));
        assert_eq!(
            found[0].kind,
            ViolationKind::DanglingReference {
                target: Address::new("doc", "nope")
            }
        );
        assert_eq!(found[0].field.as_deref(), Some("blocks[0]"));
    }

    #[test]
    fn every_problem_is_reported_at_once() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert(
            "p".into(),
            page(json!([{"ref": "b"}])).with_field("color", json!("red")),
        );
        bundle.map.insert("b".into(), BundledInst::new("Block").with_field("text", json!(3)));
        bundle.map.insert("x".into(), BundledInst::new("Foo"));
        let found = violations(checker().check("doc", &bundle, &NoDependencies));
        let kinds: Vec<_> = found.iter().map(|v| v.kind.clone()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds.contains(&ViolationKind::UnknownField));
        assert!(kinds.contains(&ViolationKind::UnknownType {
            type_name: "Foo".into()
        }));
        assert!(kinds.contains(&ViolationKind::FieldType {
            expected: "string".into(),
            found: "number".into()
        }));
    }

    #[test]
    fn unreachable_and_weak_only_records_warn() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert(
            "p".into(),
            page(json!([])).with_field("pinned", json!({"ref": "w"})),
        );
        bundle.map.insert("w".into(), block("weak"));
        bundle.map.insert("orphan".into(), block("lost"));
        let report = checker().check("doc", &bundle, &NoDependencies).unwrap();
        let unreachable: Vec<_> = report.unreachable().cloned().collect();
        assert_eq!(unreachable, vec![Address::new("doc", "orphan")]);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::WeakOnly && w.address.local_id == "w"));
    }

    #[test]
    fn strong_refs_from_orphans_do_not_own_records() {
        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert(
            "p".into(),
            page(json!([])).with_field("pinned", json!({"ref": "w"})),
        );
        bundle.map.insert("w".into(), block("weak"));
        bundle.map.insert("o".into(), page(json!([{"ref": "w"}])));
        let report = checker().check("doc", &bundle, &NoDependencies).unwrap();
        assert_eq!(report.unreachable().cloned().collect::<Vec<_>>(), vec![Address::new("doc", "o")]);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::WeakOnly && w.address.local_id == "w"));
    }

    #[test]
    fn cross_bundle_refs_resolve_against_dependencies() {
        let mut pkg = Bundle::new("v", "pb");
        pkg.map.insert("pb".into(), block("shared"));
        let deps: BTreeMap<BundleId, Bundle> = [("pkg".to_string(), pkg)].into_iter().collect();

        let mut bundle = Bundle::new("v", "p");
        bundle.map.insert(
            "p".into(),
            page(json!([])).with_field("pinned", json!({"ref": "pb", "uuid": "pkg"})),
        );
        bundle.deps = vec!["pkg".into()];
        assert!(checker().check("doc", &bundle, &deps).is_ok());

        let missing = violations(checker().check("doc", &bundle, &NoDependencies));
        assert!(matches!(missing[0].kind, ViolationKind::DanglingReference { .. }));

        bundle.deps.clear();
        let undeclared = violations(checker().check("doc", &bundle, &deps));
        assert_eq!(
            undeclared[0].kind,
            ViolationKind::UndeclaredDependency {
                bundle_id: "pkg".into()
            }
        );
    }

    #[test]
    fn missing_root_is_fatal() {
        let bundle = Bundle::new("v", "gone");
        let found = violations(checker().check("doc", &bundle, &NoDependencies));
        assert_eq!(found[0].kind, ViolationKind::MissingRoot);
    }
}
