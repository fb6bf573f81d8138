pub mod config;
pub mod error;
pub mod graph;
pub mod registry;
pub mod schema;
pub mod types;
pub mod wire;

pub use config::{BundlerSettings, IdStrategy, LogFormat, LoggingSettings, MigrationSettings, Settings};
pub use error::*;
pub use graph::*;
pub use registry::*;
pub use schema::design_registry;
pub use types::*;
pub use wire::*;
