pub mod bundler;
pub mod fast;
pub mod identity;
pub mod ids;
pub mod integrity;

pub use bundler::{Bundler, CLIPBOARD_SCOPE};
pub use fast::{FastBundleStats, FastBundler};
pub use identity::IdentityCache;
pub use ids::{generator_for, LocalIdGenerator, SequentialIdGenerator, ShortIdGenerator};
pub use integrity::{
    DependencyIndex, IntegrityChecker, IntegrityReport, NoDependencies, Warning, WarningKind,
};
