use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde_json::Map as JsonMap;
use tracing::{debug, warn};

use bundlegraph_core::{
    Address, Bundle, BundleError, BundleId, BundledInst, BundlerSettings, FieldDescriptor,
    FieldKind, InstId, JsonValue, LocalId, ModelRegistry, ObjectGraph, RefSpec, Result, Value,
    WireRef,
};

use crate::identity::IdentityCache;
use crate::ids::{generator_for, LocalIdGenerator, ShortIdGenerator};

/// Bundle id used for exported subgraphs and for addresses reported while
/// importing them.
pub const CLIPBOARD_SCOPE: &str = "clipboard";

const MAX_ID_DRAWS: usize = 1024;

/// One instance's serialized form plus what the walk needs to continue.
#[derive(Debug, Clone)]
pub(crate) struct Serialized {
    pub record: BundledInst,
    /// Same-bundle reference targets, in encounter order.
    pub children: Vec<InstId>,
    pub deps: BTreeSet<BundleId>,
}

/// A bundling session: one live graph plus the identity cache binding its
/// instances to bundle addresses.
pub struct Bundler {
    registry: Arc<ModelRegistry>,
    graph: ObjectGraph,
    cache: IdentityCache,
    ids: Box<dyn LocalIdGenerator>,
}

impl fmt::Debug for Bundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundler")
            .field("instances", &self.graph.len())
            .field("addresses", &self.cache.len())
            .finish()
    }
}

impl Bundler {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_id_generator(registry, Box::new(ShortIdGenerator::default()))
    }

    pub fn with_id_generator(registry: Arc<ModelRegistry>, ids: Box<dyn LocalIdGenerator>) -> Self {
        Self {
            registry,
            graph: ObjectGraph::new(),
            cache: IdentityCache::new(),
            ids,
        }
    }

    pub fn from_settings(registry: Arc<ModelRegistry>, settings: &BundlerSettings) -> Self {
        Self::with_id_generator(registry, generator_for(settings))
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.graph
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn address_of(&self, inst: InstId) -> Option<&Address> {
        self.cache.address_of(inst)
    }

    pub fn instance_at(&self, address: &Address) -> Option<InstId> {
        self.cache.get(address)
    }

    pub fn root_of(&self, bundle_id: &str) -> Option<InstId> {
        self.cache.root_of(bundle_id)
    }

    pub fn loaded_bundles(&self) -> Vec<BundleId> {
        self.cache.bundles().map(str::to_string).collect()
    }

    pub fn local_ids_of(&self, bundle_id: &str) -> Vec<LocalId> {
        self.cache.local_ids_of(bundle_id).map(str::to_string).collect()
    }

    /// Serializes everything reachable from `root` that this bundle owns.
    /// Instances owned by other bundles become cross-bundle references and
    /// their bundles are listed in `deps`.
    pub fn bundle(&mut self, root: InstId, bundle_id: &str, version: &str) -> Result<Bundle> {
        self.walk(root, bundle_id, version, |bundler, inst, local_id| {
            bundler.serialize(inst, bundle_id, local_id)
        })
    }

    /// Bundles the subgraph under `root` for copying into another document.
    ///
    /// The copy holds what `root` owns: instances reached through strong
    /// references or required weak ones. Other weak references into the
    /// source document are dropped. Instances of other loaded bundles stay
    /// cross-bundle references.
    pub fn export(&mut self, root: InstId, version: &str) -> Result<Bundle> {
        let scope = self.owned_closure(root);
        let scratch = match self.cache.address_of(root) {
            Some(addr) => self.cache.without_bundle(&addr.bundle_id),
            None => self.cache.clone(),
        };
        let saved = std::mem::replace(&mut self.cache, scratch);
        let result = self.walk(root, CLIPBOARD_SCOPE, version, |bundler, inst, local_id| {
            bundler.serialize_in(inst, CLIPBOARD_SCOPE, local_id, Some(&scope))
        });
        self.cache = saved;
        result
    }

    fn owned_closure(&self, root: InstId) -> FxHashSet<InstId> {
        let mut scope = FxHashSet::default();
        let mut stack = vec![root];
        while let Some(inst) = stack.pop() {
            if !scope.insert(inst) {
                continue;
            }
            let Some(instance) = self.graph.get(inst) else {
                continue;
            };
            let Some(desc) = self.registry.get(&instance.type_name) else {
                continue;
            };
            for field in &desc.fields {
                if let Some(value) = instance.field(&field.name) {
                    owned_refs(&field.kind, value, field.required, &mut stack);
                }
            }
        }
        scope
    }

    pub(crate) fn walk<F>(&mut self, root: InstId, bundle_id: &str, version: &str, mut visit: F) -> Result<Bundle>
    where
        F: FnMut(&mut Self, InstId, &LocalId) -> Result<Serialized>,
    {
        let root_id = assign_local_id(&mut self.cache, &mut self.ids, &self.graph, root, bundle_id)?
            .ok_or_else(|| {
                BundleError::InvalidOperation(format!(
                    "root {root} belongs to another bundle and cannot be bundled as `{bundle_id}`"
                ))
            })?;

        let mut bundle = Bundle::new(version, root_id.clone());
        let mut deps = BTreeSet::new();
        let mut visited = FxHashSet::default();
        let mut stack = vec![root];

        while let Some(inst) = stack.pop() {
            if !visited.insert(inst) {
                continue;
            }
            let local_id = self
                .cache
                .address_of(inst)
                .map(|a| a.local_id.clone())
                .ok_or_else(|| {
                    BundleError::InvalidOperation(format!("instance {inst} has no address"))
                })?;
            let out = visit(self, inst, &local_id)?;
            deps.extend(out.deps);
            stack.extend(out.children.iter().rev().filter(|c| !visited.contains(*c)));
            bundle.map.insert(local_id, out.record);
        }

        bundle.deps = deps.into_iter().collect();
        self.cache.set_root(bundle_id, root_id);
        debug!(
            bundle_id,
            records = bundle.map.len(),
            deps = bundle.deps.len(),
            "bundled graph"
        );
        Ok(bundle)
    }

    pub(crate) fn serialize(&mut self, inst: InstId, bundle_id: &str, local_id: &LocalId) -> Result<Serialized> {
        self.serialize_in(inst, bundle_id, local_id, None)
    }

    /// With a `scope`, weak references to unaddressed instances outside it
    /// are left out of the record.
    fn serialize_in(
        &mut self,
        inst: InstId,
        bundle_id: &str,
        local_id: &LocalId,
        scope: Option<&FxHashSet<InstId>>,
    ) -> Result<Serialized> {
        let instance = self
            .graph
            .get(inst)
            .ok_or_else(|| BundleError::InvalidOperation(format!("unknown instance {inst}")))?;
        let desc = self.registry.require_concrete(&instance.type_name)?;
        let address = Address::new(bundle_id, local_id.clone());
        if let Some(extra) = instance.fields().keys().find(|k| desc.field(k).is_none()) {
            return Err(BundleError::schema(
                &desc.name,
                format!("undeclared field `{extra}` set on {address}"),
            ));
        }

        let mut encoder = Encoder {
            registry: &self.registry,
            graph: &self.graph,
            cache: &mut self.cache,
            ids: &mut self.ids,
            bundle_id,
            address,
            scope,
            children: Vec::new(),
            deps: BTreeSet::new(),
        };
        let mut record = BundledInst::new(desc.name.clone());
        for field in &desc.fields {
            let value = encoder.encode_field(field, instance.field(&field.name))?;
            record.fields.insert(field.name.clone(), value);
        }
        Ok(Serialized {
            record,
            children: encoder.children,
            deps: encoder.deps,
        })
    }

    /// Materializes `bundle` under `bundle_id` and returns its root.
    ///
    /// Records whose address this session already knows reuse the cached
    /// instance; the rest get fresh instances. Nothing is modified unless
    /// every record decodes.
    pub fn unbundle(&mut self, bundle: &Bundle, bundle_id: &str) -> Result<InstId> {
        let map = self.materialize(bundle, bundle_id, true)?;
        root_in(&map, bundle, bundle_id)
    }

    /// Like [`unbundle`](Self::unbundle) but returns every materialized
    /// instance by local id.
    pub fn unbundle_to_map(&mut self, bundle: &Bundle, bundle_id: &str) -> Result<BTreeMap<LocalId, InstId>> {
        self.materialize(bundle, bundle_id, true)
    }

    /// Materializes `bundle` as brand-new instances that are not bound to
    /// any address. Cross-bundle references resolve against bundles
    /// already loaded in this session.
    pub fn import(&mut self, bundle: &Bundle) -> Result<InstId> {
        let map = self.materialize(bundle, CLIPBOARD_SCOPE, false)?;
        root_in(&map, bundle, CLIPBOARD_SCOPE)
    }

    fn materialize(&mut self, bundle: &Bundle, bundle_id: &str, bind: bool) -> Result<BTreeMap<LocalId, InstId>> {
        if !bundle.map.contains_key(&bundle.root) {
            let root = Address::new(bundle_id, bundle.root.clone());
            return Err(BundleError::DanglingReference {
                address: root.clone(),
                field: "root".into(),
                target: root,
            });
        }

        let registry = Arc::clone(&self.registry);
        let mut reused = BTreeMap::new();
        for (iid, record) in &bundle.map {
            registry.require_concrete(&record.type_name)?;
            if !bind {
                continue;
            }
            let address = Address::new(bundle_id, iid.clone());
            if let Some(inst) = self.cache.get(&address) {
                let cached_type = self.graph.type_of(inst).unwrap_or_default();
                if cached_type != record.type_name {
                    return Err(BundleError::schema(
                        &record.type_name,
                        format!("{address} is already loaded as `{cached_type}`"),
                    ));
                }
                reused.insert(iid.clone(), inst);
            }
        }

        let checkpoint = self.graph.checkpoint();
        let mut shells = BTreeMap::new();
        let mut fresh = Vec::new();
        for (iid, record) in &bundle.map {
            let inst = match reused.get(iid) {
                Some(inst) => *inst,
                None => {
                    let inst = self.graph.create(record.type_name.clone());
                    fresh.push((iid.clone(), inst));
                    inst
                }
            };
            shells.insert(iid.clone(), inst);
        }

        let computed = match self.decode_records(&registry, bundle, bundle_id, &shells) {
            Ok(computed) => computed,
            Err(err) => {
                self.graph.rollback(checkpoint);
                return Err(err);
            }
        };

        for (inst, fields) in computed {
            self.graph.set_fields(inst, fields)?;
        }
        if bind {
            for (iid, inst) in fresh.iter() {
                self.cache.register(Address::new(bundle_id, iid.clone()), *inst)?;
            }
            self.cache.set_root(bundle_id, bundle.root.clone());
        }
        debug!(
            bundle_id,
            records = shells.len(),
            fresh = fresh.len(),
            reused = reused.len(),
            "unbundled graph"
        );
        Ok(shells)
    }

    fn decode_records(
        &self,
        registry: &ModelRegistry,
        bundle: &Bundle,
        bundle_id: &str,
        shells: &BTreeMap<LocalId, InstId>,
    ) -> Result<Vec<(InstId, BTreeMap<String, Value>)>> {
        let mut computed = Vec::with_capacity(bundle.map.len());
        for (iid, record) in &bundle.map {
            let desc = registry.require_concrete(&record.type_name)?;
            let decoder = Decoder {
                registry,
                graph: &self.graph,
                cache: &self.cache,
                shells,
                bundle_id,
                address: Address::new(bundle_id, iid.clone()),
            };
            for name in record.fields.keys().filter(|k| desc.field(k).is_none()) {
                warn!(address = %decoder.address, field = %name, "dropping undeclared field");
            }
            let mut fields = BTreeMap::new();
            for field in &desc.fields {
                match record.fields.get(&field.name) {
                    None | Some(JsonValue::Null) => {}
                    Some(raw) => {
                        let value = decoder.decode(&field.kind, raw, &field.name)?;
                        fields.insert(field.name.clone(), value);
                    }
                }
            }
            computed.push((shells[iid], fields));
        }
        Ok(computed)
    }
}

fn root_in(map: &BTreeMap<LocalId, InstId>, bundle: &Bundle, bundle_id: &str) -> Result<InstId> {
    map.get(&bundle.root).copied().ok_or_else(|| {
        let root = Address::new(bundle_id, bundle.root.clone());
        BundleError::DanglingReference {
            address: root.clone(),
            field: "root".into(),
            target: root,
        }
    })
}

/// The local id of `inst` within `bundle_id`, drawing and binding a fresh
/// one if the instance has no address yet. `None` means another bundle
/// owns the instance.
fn assign_local_id(
    cache: &mut IdentityCache,
    ids: &mut Box<dyn LocalIdGenerator>,
    graph: &ObjectGraph,
    inst: InstId,
    bundle_id: &str,
) -> Result<Option<LocalId>> {
    match cache.address_of(inst) {
        Some(addr) if addr.bundle_id == bundle_id => return Ok(Some(addr.local_id.clone())),
        Some(_) => return Ok(None),
        None => {}
    }
    if graph.get(inst).is_none() {
        return Err(BundleError::InvalidOperation(format!("unknown instance {inst}")));
    }
    for _ in 0..MAX_ID_DRAWS {
        let candidate = ids.next_id();
        if !cache.contains_local(bundle_id, &candidate) {
            cache.register(Address::new(bundle_id, candidate.clone()), inst)?;
            return Ok(Some(candidate));
        }
    }
    Err(BundleError::InvalidOperation(format!(
        "local id generator produced only taken ids for `{bundle_id}`"
    )))
}

struct Encoder<'a> {
    registry: &'a ModelRegistry,
    graph: &'a ObjectGraph,
    cache: &'a mut IdentityCache,
    ids: &'a mut Box<dyn LocalIdGenerator>,
    bundle_id: &'a str,
    address: Address,
    scope: Option<&'a FxHashSet<InstId>>,
    children: Vec<InstId>,
    deps: BTreeSet<BundleId>,
}

impl Encoder<'_> {
    fn encode_field(&mut self, field: &FieldDescriptor, value: Option<&Value>) -> Result<JsonValue> {
        match value {
            None | Some(Value::Null) if field.required => Err(BundleError::field_type(
                self.address.clone(),
                &field.name,
                field.kind.to_string(),
                "null",
            )),
            None | Some(Value::Null) => Ok(JsonValue::Null),
            Some(value) => self.encode(&field.kind, value, &field.name),
        }
    }

    fn encode(&mut self, kind: &FieldKind, value: &Value, path: &str) -> Result<JsonValue> {
        match (kind, value) {
            (FieldKind::String, Value::String(s)) => Ok(JsonValue::String(s.clone())),
            (FieldKind::Number, Value::Number(n)) => Ok(JsonValue::Number(n.clone())),
            (FieldKind::Bool, Value::Bool(b)) => Ok(JsonValue::Bool(*b)),
            (FieldKind::Any, value) => {
                any_to_json(value).ok_or_else(|| self.mismatch(path, kind, value.shape()))
            }
            (FieldKind::Ref(_), value) if self.out_of_scope(kind, value) => Ok(JsonValue::Null),
            (FieldKind::Ref(spec), Value::Ref(target)) => self.encode_ref(spec, *target, path),
            (FieldKind::List(inner), Value::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    if self.out_of_scope(inner, item) {
                        continue;
                    }
                    out.push(self.encode(inner, item, &format!("{path}[{i}]"))?);
                }
                Ok(JsonValue::Array(out))
            }
            (FieldKind::Map(inner), Value::Map(entries)) => {
                let mut out = JsonMap::new();
                for (key, item) in entries {
                    if self.out_of_scope(inner, item) {
                        continue;
                    }
                    out.insert(key.clone(), self.encode(inner, item, &format!("{path}.{key}"))?);
                }
                Ok(JsonValue::Object(out))
            }
            (kind, value) => Err(self.mismatch(path, kind, value.shape())),
        }
    }

    fn out_of_scope(&self, kind: &FieldKind, value: &Value) -> bool {
        match (kind, value, self.scope) {
            (FieldKind::Ref(spec), Value::Ref(target), Some(scope)) => {
                spec.weak && !scope.contains(target) && self.cache.address_of(*target).is_none()
            }
            _ => false,
        }
    }

    fn encode_ref(&mut self, spec: &RefSpec, target: InstId, path: &str) -> Result<JsonValue> {
        let target_type = self
            .graph
            .type_of(target)
            .ok_or_else(|| BundleError::InvalidOperation(format!("unknown instance {target}")))?;
        if !self.registry.is_subtype(target_type, &spec.target) {
            return Err(BundleError::field_type(
                self.address.clone(),
                path,
                format!("ref<{}>", spec.target),
                format!("ref<{target_type}>"),
            ));
        }
        match assign_local_id(self.cache, self.ids, self.graph, target, self.bundle_id)? {
            Some(local_id) => {
                self.children.push(target);
                Ok(WireRef::Local(local_id).to_json())
            }
            None => {
                let owner = self.cache.address_of(target).cloned().ok_or_else(|| {
                    BundleError::InvalidOperation(format!("instance {target} has no address"))
                })?;
                self.deps.insert(owner.bundle_id.clone());
                Ok(WireRef::External {
                    bundle_id: owner.bundle_id,
                    local_id: owner.local_id,
                }
                .to_json())
            }
        }
    }

    fn mismatch(&self, path: &str, kind: &FieldKind, found: &str) -> BundleError {
        BundleError::field_type(self.address.clone(), path, kind.to_string(), found)
    }
}

/// References that make their target part of an exported copy.
fn owned_refs(kind: &FieldKind, value: &Value, required: bool, out: &mut Vec<InstId>) {
    match (kind, value) {
        (FieldKind::Ref(spec), Value::Ref(target)) if !spec.weak || required => out.push(*target),
        (FieldKind::List(inner), Value::List(items)) => {
            items.iter().for_each(|item| owned_refs(inner, item, false, out))
        }
        (FieldKind::Map(inner), Value::Map(entries)) => {
            entries.values().for_each(|item| owned_refs(inner, item, false, out))
        }
        _ => {}
    }
}

fn any_to_json(value: &Value) -> Option<JsonValue> {
    Some(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => JsonValue::Number(n.clone()),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Json(j) => j.clone(),
        Value::Ref(_) => return None,
        Value::List(items) => JsonValue::Array(items.iter().map(any_to_json).collect::<Option<_>>()?),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(k, v)| any_to_json(v).map(|j| (k.clone(), j)))
                .collect::<Option<_>>()?,
        ),
    })
}

fn json_shape(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

struct Decoder<'a> {
    registry: &'a ModelRegistry,
    graph: &'a ObjectGraph,
    cache: &'a IdentityCache,
    shells: &'a BTreeMap<LocalId, InstId>,
    bundle_id: &'a str,
    address: Address,
}

impl Decoder<'_> {
    fn decode(&self, kind: &FieldKind, raw: &JsonValue, path: &str) -> Result<Value> {
        match (kind, raw) {
            (FieldKind::String, JsonValue::String(s)) => Ok(Value::String(s.clone())),
            (FieldKind::Number, JsonValue::Number(n)) => Ok(Value::Number(n.clone())),
            (FieldKind::Bool, JsonValue::Bool(b)) => Ok(Value::Bool(*b)),
            (FieldKind::Any, raw) => Ok(Value::from(raw.clone())),
            (FieldKind::Ref(spec), raw) => match WireRef::parse(raw) {
                Some(wire_ref) => self.decode_ref(spec, &wire_ref, path),
                None => Err(self.mismatch(path, kind, raw)),
            },
            (FieldKind::List(inner), JsonValue::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.decode(inner, item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            (FieldKind::Map(inner), JsonValue::Object(entries)) => entries
                .iter()
                .map(|(key, item)| {
                    self.decode(inner, item, &format!("{path}.{key}"))
                        .map(|v| (key.clone(), v))
                })
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Value::Map),
            (kind, raw) => Err(self.mismatch(path, kind, raw)),
        }
    }

    fn decode_ref(&self, spec: &RefSpec, wire_ref: &WireRef, path: &str) -> Result<Value> {
        let target_addr = wire_ref.resolve(self.bundle_id);
        let target = match wire_ref {
            WireRef::Local(local_id) => self.shells.get(local_id).copied(),
            WireRef::External { .. } => self.cache.get(&target_addr),
        };
        let target = target.ok_or_else(|| BundleError::DanglingReference {
            address: self.address.clone(),
            field: path.to_string(),
            target: target_addr.clone(),
        })?;
        let target_type = self.graph.type_of(target).unwrap_or_default();
        if !self.registry.is_subtype(target_type, &spec.target) {
            return Err(BundleError::field_type(
                self.address.clone(),
                path,
                format!("ref<{}>", spec.target),
                format!("ref<{target_type}>"),
            ));
        }
        Ok(Value::Ref(target))
    }

    fn mismatch(&self, path: &str, kind: &FieldKind, raw: &JsonValue) -> BundleError {
        BundleError::field_type(self.address.clone(), path, kind.to_string(), json_shape(raw))
    }
}
