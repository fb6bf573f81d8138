//! The live, possibly cyclic, object graph that bundles are produced from
//! and materialized into.
//!
//! Instances live in an arena and refer to each other through [`InstId`]
//! handles, so cycles need no shared ownership.

use std::collections::{BTreeMap, HashMap};

use serde_json::Number;
use uuid::Uuid;

use crate::error::{BundleError, Result};
use crate::wire::JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for InstId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Opaque JSON, used for `any` fields.
    Json(JsonValue),
    Ref(InstId),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<InstId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the value's shape, used in error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Ref(_) => "ref",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Pushes every referenced instance in depth-first order.
    pub fn collect_refs(&self, out: &mut Vec<InstId>) {
        match self {
            Self::Ref(id) => out.push(*id),
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

/// JSON held by an `any` field, as the native value it decodes to.
/// Never yields [`Value::Json`] or [`Value::Ref`].
impl From<JsonValue> for Value {
    fn from(raw: JsonValue) -> Self {
        match raw {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => Self::Number(n),
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<InstId> for Value {
    fn from(id: InstId) -> Self {
        Self::Ref(id)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<InstId>> for Value {
    fn from(ids: Vec<InstId>) -> Self {
        Self::List(ids.into_iter().map(Value::Ref).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

/// One live instance. `uid` identifies the instance object itself and is
/// never reused, so two sessions materializing the same bytes hold
/// instances with different uids.
#[derive(Debug, Clone)]
pub struct Instance {
    pub uid: Uuid,
    pub type_name: String,
    fields: BTreeMap<String, Value>,
    revision: u64,
}

impl Instance {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectGraph {
    instances: Vec<Instance>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn create(&mut self, type_name: impl Into<String>) -> InstId {
        let id = InstId(self.instances.len() as u32);
        self.instances.push(Instance {
            uid: Uuid::new_v4(),
            type_name: type_name.into(),
            fields: BTreeMap::new(),
            revision: 0,
        });
        id
    }

    pub fn create_with<I, K>(&mut self, type_name: impl Into<String>, fields: I) -> InstId
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let id = self.create(type_name);
        let inst = &mut self.instances[id.index()];
        inst.fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        id
    }

    pub fn get(&self, id: InstId) -> Option<&Instance> {
        self.instances.get(id.index())
    }

    pub fn type_of(&self, id: InstId) -> Option<&str> {
        self.get(id).map(|i| i.type_name.as_str())
    }

    pub fn field(&self, id: InstId, name: &str) -> Option<&Value> {
        self.get(id).and_then(|i| i.fields.get(name))
    }

    pub fn revision(&self, id: InstId) -> Option<u64> {
        self.get(id).map(|i| i.revision)
    }

    pub fn ids(&self) -> impl Iterator<Item = InstId> {
        (0..self.instances.len() as u32).map(InstId)
    }

    fn get_mut(&mut self, id: InstId) -> Result<&mut Instance> {
        self.instances
            .get_mut(id.index())
            .ok_or_else(|| BundleError::InvalidOperation(format!("unknown instance {id}")))
    }

    pub fn set_field(&mut self, id: InstId, name: impl Into<String>, value: Value) -> Result<()> {
        let inst = self.get_mut(id)?;
        let name = name.into();
        if value.is_null() {
            inst.fields.remove(&name);
        } else {
            inst.fields.insert(name, value);
        }
        inst.revision += 1;
        Ok(())
    }

    /// Replaces every field of `id` at once.
    pub fn set_fields(&mut self, id: InstId, fields: BTreeMap<String, Value>) -> Result<()> {
        let inst = self.get_mut(id)?;
        inst.fields = fields;
        inst.revision += 1;
        Ok(())
    }

    /// Appends to a list field, creating the list when unset.
    pub fn push(&mut self, id: InstId, name: &str, value: Value) -> Result<()> {
        let inst = self.get_mut(id)?;
        match inst
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Value::List(Vec::new()))
        {
            Value::List(items) => items.push(value),
            other => {
                return Err(BundleError::InvalidOperation(format!(
                    "field `{name}` of {id} is a {}, not a list",
                    other.shape()
                )))
            }
        }
        inst.revision += 1;
        Ok(())
    }

    /// Inserts into a map field, creating the map when unset.
    pub fn insert(&mut self, id: InstId, name: &str, key: impl Into<String>, value: Value) -> Result<()> {
        let inst = self.get_mut(id)?;
        match inst
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()))
        {
            Value::Map(entries) => {
                entries.insert(key.into(), value);
            }
            other => {
                return Err(BundleError::InvalidOperation(format!(
                    "field `{name}` of {id} is a {}, not a map",
                    other.shape()
                )))
            }
        }
        inst.revision += 1;
        Ok(())
    }

    /// Forces the instance to be treated as changed by incremental bundling.
    pub fn mark_dirty(&mut self, id: InstId) -> Result<()> {
        self.get_mut(id)?.revision += 1;
        Ok(())
    }

    /// Outgoing references of `id`, in field order.
    pub fn refs_of(&self, id: InstId) -> Vec<InstId> {
        let mut out = Vec::new();
        if let Some(inst) = self.get(id) {
            for value in inst.fields.values() {
                value.collect_refs(&mut out);
            }
        }
        out
    }

    /// Marks the current arena length so a failed batch of creations can
    /// be undone with [`rollback`](Self::rollback).
    pub fn checkpoint(&self) -> usize {
        self.instances.len()
    }

    /// Drops every instance created after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.instances.truncate(checkpoint);
    }
}

/// Compares the subgraphs reachable from `a_root` and `b_root` for shape
/// equality: same types, same field values, and references pairing up
/// one-to-one. Instance uids are not compared.
pub fn structurally_equal(a: &ObjectGraph, a_root: InstId, b: &ObjectGraph, b_root: InstId) -> bool {
    let mut forward: HashMap<InstId, InstId> = HashMap::new();
    let mut backward: HashMap<InstId, InstId> = HashMap::new();
    let mut pending = vec![(a_root, b_root)];

    while let Some((x, y)) = pending.pop() {
        match (forward.get(&x), backward.get(&y)) {
            (Some(mx), Some(my)) if *mx == y && *my == x => continue,
            (None, None) => {}
            _ => return false,
        }
        forward.insert(x, y);
        backward.insert(y, x);

        let (Some(ix), Some(iy)) = (a.get(x), b.get(y)) else {
            return false;
        };
        if ix.type_name != iy.type_name || ix.fields.len() != iy.fields.len() {
            return false;
        }
        for (name, vx) in &ix.fields {
            let Some(vy) = iy.fields.get(name) else {
                return false;
            };
            if !values_match(vx, vy, &mut pending) {
                return false;
            }
        }
    }
    true
}

fn values_match(x: &Value, y: &Value, pending: &mut Vec<(InstId, InstId)>) -> bool {
    match (x, y) {
        (Value::Ref(rx), Value::Ref(ry)) => {
            pending.push((*rx, *ry));
            true
        }
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(a, b)| values_match(a, b, pending))
        }
        (Value::Map(xs), Value::Map(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, a)| ys.get(k).is_some_and(|b| values_match(a, b, pending)))
        }
        (Value::Json(raw), other) | (other, Value::Json(raw)) if !matches!(other, Value::Json(_)) => {
            Value::from(raw.clone()) == *other
        }
        _ => x == y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(graph: &mut ObjectGraph, labels: &[&str]) -> InstId {
        let ids: Vec<InstId> = labels
            .iter()
            .map(|l| graph.create_with("Node", [("label", Value::from(*l))]))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            let next = ids[(i + 1) % ids.len()];
            graph.set_field(*id, "next", Value::Ref(next)).unwrap();
        }
        ids[0]
    }

    #[test]
    fn mutations_bump_revision() {
        let mut graph = ObjectGraph::new();
        let id = graph.create("Node");
        assert_eq!(graph.revision(id), Some(0));
        graph.set_field(id, "label", "a".into()).unwrap();
        graph.push(id, "items", Value::from(1)).unwrap();
        graph.insert(id, "attrs", "k", "v".into()).unwrap();
        graph.mark_dirty(id).unwrap();
        assert_eq!(graph.revision(id), Some(4));
    }

    #[test]
    fn setting_null_clears_field() {
        let mut graph = ObjectGraph::new();
        let id = graph.create_with("Node", [("label", Value::from("x"))]);
        graph.set_field(id, "label", Value::Null).unwrap();
        assert!(graph.field(id, "label").is_none());
    }

    #[test]
    fn push_onto_non_list_fails() {
        let mut graph = ObjectGraph::new();
        let id = graph.create_with("Node", [("label", Value::from("x"))]);
        assert!(graph.push(id, "label", Value::from(1)).is_err());
    }

    #[test]
    fn refs_follow_field_order() {
        let mut graph = ObjectGraph::new();
        let a = graph.create("Leaf");
        let b = graph.create("Leaf");
        let c = graph.create("Leaf");
        let root = graph.create_with(
            "Node",
            [
                ("z", Value::Ref(a)),
                ("a", Value::from(vec![b, c])),
            ],
        );
        assert_eq!(graph.refs_of(root), vec![b, c, a]);
    }

    #[test]
    fn cycles_compare_structurally() {
        let mut g1 = ObjectGraph::new();
        let r1 = ring(&mut g1, &["a", "b", "c"]);
        let mut g2 = ObjectGraph::new();
        g2.create("Padding");
        let r2 = ring(&mut g2, &["a", "b", "c"]);
        assert!(structurally_equal(&g1, r1, &g2, r2));

        let mut g3 = ObjectGraph::new();
        let r3 = ring(&mut g3, &["a", "b", "d"]);
        assert!(!structurally_equal(&g1, r1, &g3, r3));
    }

    #[test]
    fn opaque_json_matches_its_native_form() {
        let mut g1 = ObjectGraph::new();
        let r1 = g1.create_with("Lit", [("value", Value::Json(serde_json::json!(["a", 1])))]);
        let mut g2 = ObjectGraph::new();
        let r2 = g2.create_with(
            "Lit",
            [("value", Value::from(vec![Value::from("a"), Value::from(1)]))],
        );
        assert!(structurally_equal(&g1, r1, &g2, r2));

        let r3 = g2.create_with("Lit", [("value", Value::from("a"))]);
        assert!(!structurally_equal(&g1, r1, &g2, r3));
    }

    #[test]
    fn aliasing_differences_are_detected() {
        // root -> [x, x] versus root -> [x, y] with x and y alike
        let mut g1 = ObjectGraph::new();
        let x = g1.create_with("Leaf", [("v", Value::from(1))]);
        let r1 = g1.create_with("Node", [("kids", Value::from(vec![x, x]))]);

        let mut g2 = ObjectGraph::new();
        let x2 = g2.create_with("Leaf", [("v", Value::from(1))]);
        let y2 = g2.create_with("Leaf", [("v", Value::from(1))]);
        let r2 = g2.create_with("Node", [("kids", Value::from(vec![x2, y2]))]);

        assert!(!structurally_equal(&g1, r1, &g2, r2));
    }

    #[test]
    fn rollback_discards_new_instances() {
        let mut graph = ObjectGraph::new();
        graph.create("Keep");
        let mark = graph.checkpoint();
        graph.create("Drop");
        graph.rollback(mark);
        assert_eq!(graph.len(), 1);
    }
}
