use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Random alphanumeric ids.
    #[default]
    Short,
    /// Counting ids, reproducible across runs.
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlerSettings {
    #[serde(default)]
    pub id_strategy: IdStrategy,
    #[serde(default = "BundlerSettings::default_id_length")]
    pub id_length: usize,
}

impl BundlerSettings {
    fn default_id_length() -> usize {
        12
    }
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategy::default(),
            id_length: Self::default_id_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Write migrated bundles back to storage after a successful open.
    #[serde(default = "MigrationSettings::default_true")]
    pub persist_migrated: bool,
    /// Run the integrity checker on every migrated or saved bundle.
    #[serde(default = "MigrationSettings::default_true")]
    pub verify_integrity: bool,
    #[serde(default)]
    pub fail_on_warnings: bool,
}

impl MigrationSettings {
    fn default_true() -> bool {
        true
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            persist_migrated: true,
            verify_integrity: true,
            fail_on_warnings: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_env")]
    pub env: String,
    #[serde(default)]
    pub bundler: BundlerSettings,
    #[serde(default)]
    pub migrations: MigrationSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Self::default_env(),
            bundler: BundlerSettings::default(),
            migrations: MigrationSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    fn default_env() -> String {
        env::var("BUNDLEGRAPH_ENV")
            .ok()
            .or_else(|| env::var("APP_ENV").ok())
            .unwrap_or_else(|| "development".to_string())
    }

    /// Loads settings from the default config directory.
    pub fn load(env_override: Option<String>) -> Result<Self> {
        let env_name = env_override.unwrap_or_else(Self::default_env);
        Self::load_from_dir(&Self::default_config_dir(), &env_name)
    }

    /// Layers `default.*`, `<env>.toml`, `local.toml` and `BUNDLEGRAPH__*`
    /// environment variables, in that order, then validates the result.
    pub fn load_from_dir(config_dir: &Path, env_name: &str) -> Result<Self> {
        let settings: Settings = cfg::Config::builder()
            .set_default("env", env_name)
            .context("setting env default")?
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.yaml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix("BUNDLEGRAPH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Priority order: `~/.bundlegraph/`, `./config/`, then the current
    /// directory.
    pub fn default_config_dir() -> PathBuf {
        if let Some(home_dir) = dirs::home_dir() {
            let user_dir = home_dir.join(".bundlegraph");
            if user_dir.exists() {
                info!("Using config directory: {:?}", user_dir);
                return user_dir;
            }
        }

        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let project_config = cwd.join("config");
        if project_config.exists() {
            info!("Using config directory: {:?}", project_config);
            return project_config;
        }

        cwd
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.env.trim().is_empty(), "env cannot be empty");
        anyhow::ensure!(
            (4..=64).contains(&self.bundler.id_length),
            "bundler.id_length must be 4..=64"
        );
        anyhow::ensure!(
            !self.logging.level.trim().is_empty(),
            "logging.level cannot be empty"
        );
        anyhow::ensure!(
            self.migrations.verify_integrity || !self.migrations.fail_on_warnings,
            "migrations.fail_on_warnings requires migrations.verify_integrity"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bundler.id_strategy, IdStrategy::Short);
        assert!(settings.migrations.persist_migrated);
    }

    #[test]
    fn files_layer_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[bundler]\nid_strategy = \"sequential\"\nid_length = 10\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("test.toml"), "[bundler]\nid_length = 16\n").unwrap();
        fs::write(
            dir.path().join("local.toml"),
            "[migrations]\npersist_migrated = false\n",
        )
        .unwrap();

        let settings = Settings::load_from_dir(dir.path(), "test").unwrap();
        assert_eq!(settings.env, "test");
        assert_eq!(settings.bundler.id_strategy, IdStrategy::Sequential);
        assert_eq!(settings.bundler.id_length, 16);
        assert_eq!(settings.logging.level, "debug");
        assert!(!settings.migrations.persist_migrated);
        assert!(settings.migrations.verify_integrity);
    }

    #[test]
    fn empty_directory_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from_dir(dir.path(), "development").unwrap();
        assert_eq!(settings.bundler.id_length, 12);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("default.toml"), "[bundler]\nid_length = 2\n").unwrap();
        let err = Settings::load_from_dir(dir.path(), "development").unwrap_err();
        assert!(err.to_string().contains("id_length"));
    }
}
