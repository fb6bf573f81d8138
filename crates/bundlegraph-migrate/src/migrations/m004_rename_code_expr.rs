use bundlegraph_core::schema::CUSTOM_CODE;
use bundlegraph_core::Bundle;

use crate::migration::Migration;

const LEGACY_TYPE: &str = "CodeExpr";

pub(crate) fn migration() -> Migration {
    Migration::bundled(
        4,
        "rename-code-expr",
        "Renames the CodeExpr type to CustomCode",
        rename_code_expr,
    )
}

fn rename_code_expr(bundle: &mut Bundle) -> anyhow::Result<()> {
    for record in bundle.map.values_mut() {
        if record.type_name == LEGACY_TYPE {
            record.type_name = CUSTOM_CODE.to_string();
        }
    }
    Ok(())
}
