use anyhow::bail;

use bundlegraph_core::schema::TPL_TAG;
use bundlegraph_core::Bundle;

use crate::migration::Migration;

pub(crate) fn migration() -> Migration {
    Migration::bundled(
        2,
        "rename-tag-field",
        "Renames TplTag.tagName to TplTag.tag",
        rename_tag_field,
    )
}

fn rename_tag_field(bundle: &mut Bundle) -> anyhow::Result<()> {
    for (iid, record) in bundle.map.iter_mut() {
        if record.type_name != TPL_TAG {
            continue;
        }
        let Some(legacy) = record.fields.remove("tagName") else {
            continue;
        };
        if record.fields.contains_key("tag") {
            bail!("TplTag `{iid}` carries both `tagName` and `tag`");
        }
        record.fields.insert("tag".into(), legacy);
    }
    Ok(())
}
