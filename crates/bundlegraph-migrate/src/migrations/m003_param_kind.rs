use anyhow::anyhow;
use serde_json::json;

use bundlegraph_core::schema::PARAM;
use bundlegraph_core::{Bundle, JsonValue};

use crate::migration::Migration;

pub(crate) fn migration() -> Migration {
    Migration::bundled(
        3,
        "param-kind",
        "Replaces Param.isState with Param.kind",
        param_kind,
    )
}

fn param_kind(bundle: &mut Bundle) -> anyhow::Result<()> {
    for (iid, record) in bundle.map.iter_mut() {
        if record.type_name != PARAM {
            continue;
        }
        let kind = match record.fields.remove("isState") {
            Some(JsonValue::Bool(true)) => "state",
            Some(JsonValue::Bool(false)) | Some(JsonValue::Null) | None => "prop",
            Some(other) => {
                return Err(anyhow!("Param `{iid}` has a non-boolean isState: {other}"));
            }
        };
        record.fields.entry("kind".into()).or_insert_with(|| json!(kind));
    }
    Ok(())
}
