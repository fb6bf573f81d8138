use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{BundleError, Result};

/// Target of a reference-valued field. Weak references point at an
/// instance owned elsewhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSpec {
    pub target: String,
    pub weak: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    /// Arbitrary JSON carried verbatim. May not hold references.
    Any,
    Ref(RefSpec),
    List(Box<FieldKind>),
    Map(Box<FieldKind>),
}

impl FieldKind {
    pub fn reference(target: impl Into<String>) -> Self {
        Self::Ref(RefSpec {
            target: target.into(),
            weak: false,
        })
    }

    pub fn weak_ref(target: impl Into<String>) -> Self {
        Self::Ref(RefSpec {
            target: target.into(),
            weak: true,
        })
    }

    pub fn list(inner: FieldKind) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn map(inner: FieldKind) -> Self {
        Self::Map(Box::new(inner))
    }

    /// True if values of this kind may contain references.
    pub fn holds_refs(&self) -> bool {
        match self {
            Self::Ref(_) => true,
            Self::List(inner) | Self::Map(inner) => inner.holds_refs(),
            _ => false,
        }
    }

    fn ref_targets<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Ref(spec) => out.push(&spec.target),
            Self::List(inner) | Self::Map(inner) => inner.ref_targets(out),
            _ => {}
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Bool => write!(f, "bool"),
            Self::Any => write!(f, "any"),
            Self::Ref(spec) if spec.weak => write!(f, "weak ref<{}>", spec.target),
            Self::Ref(spec) => write!(f, "ref<{}>", spec.target),
            Self::List(inner) => write!(f, "list<{inner}>"),
            Self::Map(inner) => write!(f, "map<{inner}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// A registered type with its inherited fields flattened in, supertype
/// fields first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub supertype: Option<String>,
    pub is_abstract: bool,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    types: BTreeMap<String, TypeDescriptor>,
}

impl ModelRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.types.get(type_name)
    }

    /// Looks up a type tag, failing with a schema error when it is unknown.
    pub fn require(&self, type_name: &str) -> Result<&TypeDescriptor> {
        self.types
            .get(type_name)
            .ok_or_else(|| BundleError::schema(type_name, "unknown type tag"))
    }

    /// Like [`require`](Self::require) but also rejects abstract types,
    /// which can never be instantiated.
    pub fn require_concrete(&self, type_name: &str) -> Result<&TypeDescriptor> {
        let desc = self.require(type_name)?;
        if desc.is_abstract {
            return Err(BundleError::schema(
                type_name,
                "abstract type cannot be instantiated",
            ));
        }
        Ok(desc)
    }

    pub fn fields_of(&self, type_name: &str) -> Option<&[FieldDescriptor]> {
        self.types.get(type_name).map(|t| t.fields.as_slice())
    }

    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        let mut current = Some(sub);
        while let Some(name) = current {
            if name == sup {
                return true;
            }
            current = self.types.get(name).and_then(|t| t.supertype.as_deref());
        }
        false
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Declaration of one type, consumed by [`RegistryBuilder`].
#[derive(Debug, Clone)]
pub struct TypeDef {
    name: String,
    supertype: Option<String>,
    is_abstract: bool,
    fields: Vec<FieldDescriptor>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertype: None,
            is_abstract: false,
            fields: Vec::new(),
        }
    }

    pub fn abstract_type(name: impl Into<String>) -> Self {
        Self {
            is_abstract: true,
            ..Self::new(name)
        }
    }

    pub fn extends(mut self, supertype: impl Into<String>) -> Self {
        self.supertype = Some(supertype.into());
        self
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    defs: Vec<TypeDef>,
}

impl RegistryBuilder {
    pub fn with(mut self, def: TypeDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Result<ModelRegistry> {
        let mut defs: BTreeMap<String, TypeDef> = BTreeMap::new();
        for def in self.defs {
            if defs.contains_key(&def.name) {
                return Err(BundleError::schema(&def.name, "type registered twice"));
            }
            let mut seen = BTreeSet::new();
            for field in &def.fields {
                // "type" carries the tag on the wire.
                if field.name == "type" {
                    return Err(BundleError::schema(&def.name, "field name `type` is reserved"));
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(BundleError::schema(
                        &def.name,
                        format!("field `{}` declared twice", field.name),
                    ));
                }
            }
            defs.insert(def.name.clone(), def);
        }

        for def in defs.values() {
            if let Some(sup) = &def.supertype {
                if !defs.contains_key(sup) {
                    return Err(BundleError::schema(
                        &def.name,
                        format!("unknown supertype `{sup}`"),
                    ));
                }
            }
            let mut targets = Vec::new();
            for field in &def.fields {
                field.kind.ref_targets(&mut targets);
            }
            if let Some(missing) = targets.into_iter().find(|t| !defs.contains_key(*t)) {
                return Err(BundleError::schema(
                    &def.name,
                    format!("reference to unknown type `{missing}`"),
                ));
            }
        }

        let mut types = BTreeMap::new();
        for name in defs.keys() {
            let chain = supertype_chain(&defs, name)?;
            let mut fields: Vec<FieldDescriptor> = Vec::new();
            for ancestor in chain.iter().rev() {
                for field in &defs[*ancestor].fields {
                    if fields.iter().any(|f| f.name == field.name) {
                        return Err(BundleError::schema(
                            name,
                            format!("field `{}` shadows an inherited field", field.name),
                        ));
                    }
                    fields.push(field.clone());
                }
            }
            let def = &defs[name];
            types.insert(
                name.clone(),
                TypeDescriptor {
                    name: name.clone(),
                    supertype: def.supertype.clone(),
                    is_abstract: def.is_abstract,
                    fields,
                },
            );
        }

        Ok(ModelRegistry { types })
    }
}

/// `name` followed by its ancestors, nearest first.
fn supertype_chain<'a>(defs: &'a BTreeMap<String, TypeDef>, name: &'a str) -> Result<Vec<&'a str>> {
    let mut chain = vec![name];
    let mut current = defs.get(name).and_then(|d| d.supertype.as_deref());
    while let Some(sup) = current {
        if chain.contains(&sup) {
            return Err(BundleError::schema(name, "cyclic type hierarchy"));
        }
        chain.push(sup);
        current = defs.get(sup).and_then(|d| d.supertype.as_deref());
    }
    Ok(chain)
}
