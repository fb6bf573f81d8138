use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use bundlegraph_bundler::Bundler;
use bundlegraph_core::{Bundle, BundleError, BundleId, InstId, Result};

/// A pure transform over the serialized map.
pub type BundledFn = fn(&mut Bundle) -> anyhow::Result<()>;

/// Context handed to an unbundled migration: a fresh session holding the
/// entity's graph plus every dependency package, already materialized.
pub struct UnbundledContext<'a> {
    pub bundler: &'a mut Bundler,
    pub root: InstId,
    pub entity_id: &'a str,
    /// Root instance of every loaded dependency bundle.
    pub dependency_roots: Vec<(BundleId, InstId)>,
}

/// A migration that edits the live graph. The runner re-bundles the graph
/// once `migrate` returns.
#[async_trait]
pub trait UnbundledMigration: Send + Sync {
    async fn migrate(&self, ctx: &mut UnbundledContext<'_>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Bundled,
    Unbundled,
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bundled => write!(f, "bundled"),
            Self::Unbundled => write!(f, "unbundled"),
        }
    }
}

#[derive(Clone)]
pub enum MigrationStep {
    Bundled(BundledFn),
    Unbundled(Arc<dyn UnbundledMigration>),
}

#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub description: &'static str,
    pub step: MigrationStep,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

impl Migration {
    pub fn bundled(version: u32, name: &'static str, description: &'static str, step: BundledFn) -> Self {
        Self {
            version,
            name,
            description,
            step: MigrationStep::Bundled(step),
        }
    }

    pub fn unbundled(
        version: u32,
        name: &'static str,
        description: &'static str,
        step: Arc<dyn UnbundledMigration>,
    ) -> Self {
        Self {
            version,
            name,
            description,
            step: MigrationStep::Unbundled(step),
        }
    }

    /// Version stamp written into bundles once this migration has run.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.version, self.name)
    }

    pub fn kind(&self) -> MigrationKind {
        match self.step {
            MigrationStep::Bundled(_) => MigrationKind::Bundled,
            MigrationStep::Unbundled(_) => MigrationKind::Unbundled,
        }
    }

    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tag().as_bytes());
        hasher.update(self.kind().to_string().as_bytes());
        hasher.update(self.description.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// History entry for one applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub tag: String,
    pub kind: MigrationKind,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn for_migration(migration: &Migration) -> Self {
        Self {
            version: migration.version,
            tag: migration.tag(),
            kind: migration.kind(),
            checksum: migration.checksum(),
            applied_at: Utc::now(),
        }
    }
}

/// Numeric version of a stamp such as `"3-param-kind"`. The empty stamp of
/// never-migrated data is version 0.
pub fn parse_version(stamp: &str) -> Option<u32> {
    let stamp = stamp.trim();
    if stamp.is_empty() {
        return Some(0);
    }
    let digits = stamp.split('-').next()?;
    digits.parse().ok()
}

/// Ordered list of every known migration.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// Rejects lists whose versions are not strictly increasing from 1.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        let mut previous = 0;
        for migration in &migrations {
            if migration.version <= previous {
                return Err(BundleError::InvalidOperation(format!(
                    "migration `{}` must have a version greater than {}",
                    migration.tag(),
                    previous
                )));
            }
            previous = migration.version;
        }
        Ok(Self { migrations })
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Stamp of the newest migration, or the empty stamp.
    pub fn latest_tag(&self) -> String {
        self.migrations.last().map(Migration::tag).unwrap_or_default()
    }

    pub fn tag_for(&self, version: u32) -> Option<String> {
        if version == 0 {
            return Some(String::new());
        }
        self.get(version).map(Migration::tag)
    }

    pub fn get(&self, version: u32) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    /// Migrations with a version in `(from, to]`, in order.
    pub fn pending(&self, from: u32, to: u32) -> impl Iterator<Item = &Migration> {
        self.migrations
            .iter()
            .filter(move |m| m.version > from && m.version <= to)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
