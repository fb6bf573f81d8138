//! Storage, dependency loading and the versioned migration pipeline.
//!
//! A stored bundle goes through [`DependencyLoader::resolve`] (which
//! migrates every package it imports), then [`MigrationRunner::migrate`],
//! then an integrity check, before [`ProjectLoader::open`] unbundles it
//! into an editing session.

pub mod loader;
pub mod migration;
pub mod migrations;
pub mod project;
pub mod runner;
pub mod store;

pub use loader::{dependencies_of, DependencyLoader, PackageSet};
pub use migration::{
    parse_version, BundledFn, Migration, MigrationKind, MigrationRecord, MigrationRegistry,
    MigrationStep, UnbundledContext, UnbundledMigration,
};
pub use migrations::{builtin_migrations, UniqueComponentNames};
pub use project::{OpenedProject, ProjectLoader};
pub use runner::{IdGeneratorFactory, MigrationOutcome, MigrationRunner};
pub use store::{BundleStore, FileBundleStore, MemoryBundleStore, StoredBundle};
