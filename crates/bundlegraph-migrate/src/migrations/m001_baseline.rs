use bundlegraph_core::Bundle;

use crate::migration::Migration;

pub(crate) fn migration() -> Migration {
    Migration::bundled(
        1,
        "baseline",
        "Stamps never-versioned bundles without changing their content",
        baseline,
    )
}

fn baseline(_bundle: &mut Bundle) -> anyhow::Result<()> {
    Ok(())
}
