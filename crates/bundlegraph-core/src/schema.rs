//! The design-tool model: sites, components, template trees, expressions
//! and styling.

use crate::error::Result;
use crate::registry::{FieldKind as K, ModelRegistry, TypeDef};

pub const SITE: &str = "Site";
pub const PROJECT_DEPENDENCY: &str = "ProjectDependency";
pub const COMPONENT: &str = "Component";
pub const PARAM: &str = "Param";
pub const TPL_NODE: &str = "TplNode";
pub const TPL_TAG: &str = "TplTag";
pub const TPL_COMPONENT: &str = "TplComponent";
pub const EXPR: &str = "Expr";
pub const LIT: &str = "Lit";
pub const CUSTOM_CODE: &str = "CustomCode";
pub const VARIANT: &str = "Variant";
pub const VARIANT_SETTING: &str = "VariantSetting";
pub const STYLE_TOKEN: &str = "StyleToken";

/// Registry of the current design model.
pub fn design_registry() -> Result<ModelRegistry> {
    ModelRegistry::builder()
        .with(
            TypeDef::new(SITE)
                .required("components", K::list(K::reference(COMPONENT)))
                .required(
                    "projectDependencies",
                    K::list(K::reference(PROJECT_DEPENDENCY)),
                )
                .required("styleTokens", K::list(K::reference(STYLE_TOKEN))),
        )
        .with(
            TypeDef::new(PROJECT_DEPENDENCY)
                .required("pkgId", K::String)
                .required("version", K::String)
                .required("name", K::String)
                // The package's site lives in its own bundle.
                .required("site", K::weak_ref(SITE)),
        )
        .with(
            TypeDef::new(COMPONENT)
                .required("uuid", K::String)
                .required("name", K::String)
                .required("params", K::list(K::reference(PARAM)))
                .required("tplTree", K::reference(TPL_NODE))
                .required("variants", K::list(K::reference(VARIANT))),
        )
        .with(
            TypeDef::new(PARAM)
                .required("name", K::String)
                .required("kind", K::String)
                .optional("defaultExpr", K::reference(EXPR)),
        )
        .with(TypeDef::abstract_type(TPL_NODE).optional("parent", K::weak_ref(TPL_NODE)))
        .with(
            TypeDef::new(TPL_TAG)
                .extends(TPL_NODE)
                .required("tag", K::String)
                .required("children", K::list(K::reference(TPL_NODE)))
                .required("vsettings", K::list(K::reference(VARIANT_SETTING))),
        )
        .with(
            TypeDef::new(TPL_COMPONENT)
                .extends(TPL_NODE)
                .required("component", K::weak_ref(COMPONENT))
                .required("args", K::map(K::reference(EXPR))),
        )
        .with(TypeDef::abstract_type(EXPR))
        .with(TypeDef::new(LIT).extends(EXPR).optional("value", K::Any))
        .with(
            TypeDef::new(CUSTOM_CODE)
                .extends(EXPR)
                .required("code", K::String),
        )
        .with(
            TypeDef::new(VARIANT)
                .required("uuid", K::String)
                .required("name", K::String),
        )
        .with(
            TypeDef::new(VARIANT_SETTING)
                .required("variants", K::list(K::weak_ref(VARIANT)))
                .required("styles", K::map(K::String)),
        )
        .with(
            TypeDef::new(STYLE_TOKEN)
                .required("uuid", K::String)
                .required("name", K::String)
                .required("value", K::String),
        )
        .build()
}
