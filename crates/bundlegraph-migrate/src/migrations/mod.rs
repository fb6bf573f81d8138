//! The built-in migration chain for the design model.
//!
//! Versions only ever grow. Bundled steps come first in history because
//! the unbundled ones run against the current registry and need data that
//! already has the current shape.

mod m001_baseline;
mod m002_rename_tag_field;
mod m003_param_kind;
mod m004_rename_code_expr;
mod m005_unique_component_names;

use bundlegraph_core::Result;

use crate::migration::MigrationRegistry;

pub use m005_unique_component_names::UniqueComponentNames;

pub fn builtin_migrations() -> Result<MigrationRegistry> {
    MigrationRegistry::new(vec![
        m001_baseline::migration(),
        m002_rename_tag_field::migration(),
        m003_param_kind::migration(),
        m004_rename_code_expr::migration(),
        m005_unique_component_names::migration(),
    ])
}
