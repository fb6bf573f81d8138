use std::fmt;

use thiserror::Error;

use crate::types::{Address, BundleId};
use crate::wire::Bundle;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Schema error: {message} (type `{type_name}`)")]
    Schema { type_name: String, message: String },

    #[error("Dangling reference at {address} field `{field}`: `{target}` does not exist")]
    DanglingReference {
        address: Address,
        field: String,
        target: Address,
    },

    #[error("Field type error at {address} field `{field}`: expected {expected}, found {found}")]
    FieldType {
        address: Address,
        field: String,
        expected: String,
        found: String,
    },

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<BundleId> },

    #[error("Missing dependency: bundle `{0}` is not available")]
    MissingDependency(BundleId),

    #[error("Bundle not found: {0}")]
    NotFound(BundleId),

    #[error(transparent)]
    Migration(Box<MigrationFailure>),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("Unsupported bundle version `{found}` (latest known migration: {latest})")]
    UnsupportedVersion { found: String, latest: u32 },

    #[error("Stale revision for `{bundle_id}`: attempted {attempted}, current {current}")]
    StaleRevision {
        bundle_id: BundleId,
        attempted: u64,
        current: u64,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BundleError>;

impl BundleError {
    pub fn schema(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn field_type(
        address: Address,
        field: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::FieldType {
            address,
            field: field.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<MigrationFailure> for BundleError {
    fn from(failure: MigrationFailure) -> Self {
        Self::Migration(Box::new(failure))
    }
}

/// A failed migration step. `original` is the bundle exactly as it was
/// before the pipeline started.
#[derive(Debug)]
pub struct MigrationFailure {
    pub migration: String,
    pub entity_id: BundleId,
    pub cause: anyhow::Error,
    pub original: Bundle,
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migration `{}` failed for `{}`: {:#}",
            self.migration, self.entity_id, self.cause
        )
    }
}

impl std::error::Error for MigrationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    MissingRequiredField,
    DanglingReference { target: Address },
    UnknownType { type_name: String },
    AbstractType { type_name: String },
    FieldType { expected: String, found: String },
    UnknownField,
    UndeclaredDependency { bundle_id: BundleId },
    MissingRoot,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequiredField => write!(f, "missing required field"),
            Self::DanglingReference { target } => write!(f, "dangling reference to `{target}`"),
            Self::UnknownType { type_name } => write!(f, "unknown type `{type_name}`"),
            Self::AbstractType { type_name } => write!(f, "abstract type `{type_name}`"),
            Self::FieldType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            Self::UnknownField => write!(f, "undeclared field"),
            Self::UndeclaredDependency { bundle_id } => {
                write!(f, "reference into undeclared dependency `{bundle_id}`")
            }
            Self::MissingRoot => write!(f, "root record is missing"),
        }
    }
}

/// One fatal finding of the integrity checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub address: Address,
    pub field: Option<String>,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} field `{}`: {}", self.address, field, self.kind),
            None => write!(f, "{}: {}", self.address, self.kind),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Integrity violation in `{bundle_id}` ({} finding(s)): {}", .violations.len(), summarize(.violations))]
pub struct IntegrityError {
    pub bundle_id: BundleId,
    pub violations: Vec<Violation>,
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
