use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bundlegraph_core::schema::SITE;
use bundlegraph_core::{InstId, ObjectGraph, Value};

use crate::migration::{Migration, UnbundledContext, UnbundledMigration};

pub(crate) fn migration() -> Migration {
    Migration::unbundled(
        5,
        "unique-component-names",
        "Renames components whose names collide with a sibling or an imported component",
        Arc::new(UniqueComponentNames),
    )
}

/// Gives every component of a site a name no other component of the site
/// or of its imported packages uses. Later duplicates get a numeric suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueComponentNames;

#[async_trait]
impl UnbundledMigration for UniqueComponentNames {
    async fn migrate(&self, ctx: &mut UnbundledContext<'_>) -> anyhow::Result<()> {
        let graph = ctx.bundler.graph();
        if graph.type_of(ctx.root) != Some(SITE) {
            return Ok(());
        }

        let mut taken: BTreeSet<String> = ctx
            .dependency_roots
            .iter()
            .filter(|(_, root)| graph.type_of(*root) == Some(SITE))
            .flat_map(|(_, root)| components(graph, *root))
            .map(|(_, name)| name)
            .collect();

        let mut renames = Vec::new();
        for (component, name) in components(graph, ctx.root) {
            let unique = if taken.contains(&name) {
                next_free(&name, &taken)
            } else {
                name.clone()
            };
            if unique != name {
                renames.push((component, name, unique.clone()));
            }
            taken.insert(unique);
        }

        let graph = ctx.bundler.graph_mut();
        for (component, from, to) in renames {
            debug!(entity_id = ctx.entity_id, %from, %to, "renaming component");
            graph.set_field(component, "name", Value::from(to))?;
        }
        Ok(())
    }
}

fn components(graph: &ObjectGraph, site: InstId) -> Vec<(InstId, String)> {
    graph
        .field(site, "components")
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_ref_id)
        .filter_map(|c| {
            let name = graph.field(c, "name").and_then(Value::as_str)?;
            Some((c, name.to_string()))
        })
        .collect()
}

fn next_free(name: &str, taken: &BTreeSet<String>) -> String {
    (2..)
        .map(|n| format!("{name} {n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}
