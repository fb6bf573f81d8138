use anyhow::{Context, Result};
use bundlegraph_bundler::IntegrityChecker;
use bundlegraph_core::{
    design_registry, Bundle, BundleError, BundleId, LogFormat, LoggingSettings, ModelRegistry,
    Settings,
};
use bundlegraph_migrate::{
    builtin_migrations, parse_version, DependencyLoader, MemoryBundleStore, MigrationRegistry,
    MigrationRunner,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "bundlegraph")]
#[command(about = "BundleGraph CLI - Migrate, check and inspect design bundles", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Directory holding default.toml, <env>.toml and local.toml
    #[arg(long, global = true, env = "BUNDLEGRAPH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Configuration environment
    #[arg(long, global = true)]
    env: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every bundle in a file, dependencies first
    Migrate {
        /// Bundle file: one bundle, or an array of [bundle_id, bundle] pairs
        file: PathBuf,

        /// Stop at this migration version instead of the latest
        #[arg(short, long)]
        target: Option<u32>,

        /// Overwrite the input file
        #[arg(long, conflicts_with = "out")]
        in_place: bool,

        /// Write the migrated bundles here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run the integrity checker on every bundle in a file
    Check {
        /// Bundle file
        file: PathBuf,
    },

    /// Summarize the bundles in a file
    Inspect {
        /// Bundle file
        file: PathBuf,
    },

    /// List the registered migration chain
    Migrations,
}

/// On-disk shape of a bundle file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BundleFile {
    Many(Vec<(BundleId, Bundle)>),
    One(Bundle),
}

impl BundleFile {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("{} is not a bundle file", path.display()))
    }

    /// A lone bundle is named after the file stem.
    fn into_entries(self, path: &Path) -> Vec<(BundleId, Bundle)> {
        match self {
            Self::Many(entries) => entries,
            Self::One(bundle) => {
                let id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "bundle".to_string());
                vec![(id, bundle)]
            }
        }
    }

    fn from_entries(single: bool, mut entries: Vec<(BundleId, Bundle)>) -> Self {
        if single && entries.len() == 1 {
            if let Some((_, bundle)) = entries.pop() {
                return Self::One(bundle);
            }
        }
        Self::Many(entries)
    }
}

struct CommandOutput {
    value: serde_json::Value,
    success: bool,
}

impl CommandOutput {
    fn ok(value: serde_json::Value) -> Self {
        Self {
            value,
            success: true,
        }
    }
}

struct Toolkit {
    settings: Settings,
    models: Arc<ModelRegistry>,
    migrations: Arc<MigrationRegistry>,
}

impl Toolkit {
    fn new(settings: Settings) -> Result<Self> {
        Ok(Self {
            settings,
            models: Arc::new(design_registry().context("Failed to build the design registry")?),
            migrations: Arc::new(builtin_migrations().context("Failed to register migrations")?),
        })
    }

    fn runner(&self) -> Arc<MigrationRunner> {
        Arc::new(MigrationRunner::from_settings(
            Arc::clone(&self.migrations),
            Arc::clone(&self.models),
            &self.settings.bundler,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config_dir {
        Some(dir) => {
            let env = cli.env.clone().unwrap_or_else(|| "development".to_string());
            Settings::load_from_dir(dir, &env)
        }
        None => Settings::load(cli.env.clone()),
    }
    .context("Failed to load configuration")?;
    init_tracing(&settings.logging, cli.verbose);

    let toolkit = Toolkit::new(settings)?;
    match execute_command(&cli, &toolkit).await {
        Ok(output) => {
            if !output.value.is_null() {
                print_output(&cli.output, &output.value)?;
            }
            if !output.success {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(logging: &LoggingSettings, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn execute_command(cli: &Cli, toolkit: &Toolkit) -> Result<CommandOutput> {
    match &cli.command {
        Commands::Migrate {
            file,
            target,
            in_place,
            out,
        } => {
            let destination = if *in_place { Some(file.clone()) } else { out.clone() };
            execute_migrate(toolkit, file, *target, destination.as_deref()).await
        }
        Commands::Check { file } => execute_check(toolkit, file),
        Commands::Inspect { file } => execute_inspect(toolkit, file).map(CommandOutput::ok),
        Commands::Migrations => Ok(CommandOutput::ok(execute_migrations(toolkit))),
    }
}

async fn execute_migrate(
    toolkit: &Toolkit,
    file: &Path,
    target: Option<u32>,
    destination: Option<&Path>,
) -> Result<CommandOutput> {
    let input = BundleFile::read(file)?;
    let single = matches!(input, BundleFile::One(_));
    let entries = input.into_entries(file);

    let store = Arc::new(MemoryBundleStore::new());
    for (id, bundle) in &entries {
        store.put(id.clone(), bundle.clone());
    }
    let runner = toolkit.runner();
    let loader = DependencyLoader::new(store, Arc::clone(&runner));
    let checker = IntegrityChecker::new(Arc::clone(&toolkit.models));
    let policy = &toolkit.settings.migrations;
    // Older shapes do not satisfy the current registry.
    let verify = policy.verify_integrity
        && target.map_or(true, |t| t >= toolkit.migrations.latest_version());

    let mut migrated = Vec::with_capacity(entries.len());
    let mut summary = Vec::with_capacity(entries.len());
    for (id, bundle) in &entries {
        let packages = loader
            .resolve(id, bundle)
            .await
            .with_context(|| format!("Failed to load dependencies of `{id}`"))?;
        let outcome = runner.migrate(id, bundle, &packages, target).await?;

        let warnings = if verify {
            let report = checker.check(id, &outcome.bundle, &packages)?;
            if policy.fail_on_warnings && !report.warnings.is_empty() {
                anyhow::bail!(
                    "`{id}` has {} integrity warning(s) and fail_on_warnings is set",
                    report.warnings.len()
                );
            }
            report.warnings.iter().map(ToString::to_string).collect()
        } else {
            Vec::new()
        };

        summary.push(serde_json::json!({
            "bundle": id,
            "from": outcome.from_version,
            "to": outcome.to_version,
            "applied": outcome.applied.iter().map(|r| r.tag.clone()).collect::<Vec<_>>(),
            "warnings": warnings,
        }));
        migrated.push((id.clone(), outcome.bundle));
    }

    let text = serde_json::to_string_pretty(&BundleFile::from_entries(single, migrated))?;
    match destination {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), bundles = summary.len(), "wrote migrated bundles");
            Ok(CommandOutput::ok(serde_json::json!({
                "written": path.display().to_string(),
                "bundles": summary,
            })))
        }
        None => {
            println!("{text}");
            debug!(bundles = summary.len(), "migrated bundles written to stdout");
            Ok(CommandOutput::ok(serde_json::Value::Null))
        }
    }
}

fn execute_check(toolkit: &Toolkit, file: &Path) -> Result<CommandOutput> {
    let entries = BundleFile::read(file)?.into_entries(file);
    let index: BTreeMap<BundleId, Bundle> = entries.iter().cloned().collect();
    let checker = IntegrityChecker::new(Arc::clone(&toolkit.models));

    let mut success = true;
    let mut results = Vec::with_capacity(entries.len());
    for (id, bundle) in &entries {
        match checker.check(id, bundle, &index) {
            Ok(report) => results.push(serde_json::json!({
                "bundle": id,
                "status": "ok",
                "records": report.records,
                "reachable": report.reachable,
                "warnings": report.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })),
            Err(BundleError::Integrity(err)) => {
                success = false;
                results.push(serde_json::json!({
                    "bundle": id,
                    "status": "invalid",
                    "violations": err.violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }));
            }
            Err(other) => return Err(other.into()),
        }
    }

    Ok(CommandOutput {
        value: serde_json::Value::Array(results),
        success,
    })
}

fn execute_inspect(toolkit: &Toolkit, file: &Path) -> Result<serde_json::Value> {
    let entries = BundleFile::read(file)?.into_entries(file);
    let latest = toolkit.migrations.latest_version();
    let summaries = entries
        .iter()
        .map(|(id, bundle)| inspect_bundle(&toolkit.models, latest, id, bundle))
        .collect();
    Ok(serde_json::Value::Array(summaries))
}

fn inspect_bundle(models: &ModelRegistry, latest: u32, id: &str, bundle: &Bundle) -> serde_json::Value {
    let mut types: BTreeMap<&str, usize> = BTreeMap::new();
    for record in bundle.map.values() {
        *types.entry(record.type_name.as_str()).or_default() += 1;
    }
    let reachable = bundle.reachable(models);
    let unreachable: Vec<&str> = bundle
        .map
        .keys()
        .filter(|iid| !reachable.contains(*iid))
        .map(String::as_str)
        .collect();
    let pending = parse_version(&bundle.version).map(|v| latest.saturating_sub(v));

    serde_json::json!({
        "bundle": id,
        "version": bundle.version,
        "pending_migrations": pending,
        "root": bundle.root,
        "records": bundle.map.len(),
        "types": types,
        "deps": bundle.deps,
        "referenced_deps": bundle.referenced_dependencies(models),
        "unreachable": unreachable,
    })
}

fn execute_migrations(toolkit: &Toolkit) -> serde_json::Value {
    let chain = toolkit
        .migrations
        .iter()
        .map(|m| {
            serde_json::json!({
                "tag": m.tag(),
                "kind": m.kind(),
                "description": m.description,
                "checksum": m.checksum(),
            })
        })
        .collect();
    serde_json::Value::Array(chain)
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}: {}", key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}: {}", key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b { "true".green() } else { "false".red() };
                        println!("{}: {}", key_colored, val_colored);
                    }
                    serde_json::Value::Array(items) if items.iter().all(|i| i.is_string()) => {
                        let joined: Vec<&str> = items.iter().filter_map(|i| i.as_str()).collect();
                        println!("{}: {}", key_colored, joined.join(", "));
                    }
                    _ => {
                        println!("{}: {}", key_colored, val);
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                println!("\n{}{}:", "Item ".cyan(), (i + 1).to_string().yellow());
                print_pretty(item)?;
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
