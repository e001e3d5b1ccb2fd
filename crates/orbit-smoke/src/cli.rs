//! Shared command-line plumbing for the smoke binaries.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use orbit::{ConfigError, ConfigStore, RegistryError, TypeRegistry};
use orbit_schema::CompileOptions;
use orbit_schema::error::SchemaError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directory holding the interface files shipped with this crate.
pub const BUNDLED_SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/slice");

/// Interface file compiled when none is named on the command line.
pub const BUNDLED_SCHEMA: &str = "Test.ice";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Parsed process arguments: properties first, then compiler arguments.
#[derive(Debug)]
pub struct Invocation {
    config: ConfigStore,
    options: CompileOptions,
    schema_files: Vec<PathBuf>,
}

impl Invocation {
    /// Parse arguments without the program name.
    ///
    /// `--Key.Name=Value` arguments become properties; the rest is handed to
    /// the interface compiler. With no input files the bundled schema is
    /// compiled with `--all`.
    pub fn parse<I, S>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = ConfigStore::new();
        let rest = config.parse_command_line(args)?;
        let (mut options, mut schema_files) = CompileOptions::from_args(&rest)?;

        if schema_files.is_empty() {
            options = options.include_dir(BUNDLED_SCHEMA_DIR).all(true);
            schema_files.push(Path::new(BUNDLED_SCHEMA_DIR).join(BUNDLED_SCHEMA));
        }

        Ok(Self {
            config,
            options,
            schema_files,
        })
    }

    /// Set `key` unless the command line already did.
    pub fn with_default(mut self, key: &str, value: &str) -> Self {
        self.config.set_default(key, value);
        self
    }

    /// Set `key` regardless of the command line.
    pub fn with_override(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn compile_options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn schema_files(&self) -> &[PathBuf] {
        &self.schema_files
    }

    /// Compile the schema files and register every emitted descriptor.
    pub fn load_registry(&self) -> Result<Arc<TypeRegistry>, CliError> {
        let descriptors = orbit_schema::compile_files(&self.schema_files, &self.options)?;
        let mut registry = TypeRegistry::new();
        registry.register_all(descriptors)?;
        tracing::debug!(types = ?registry.names(), "Type registry loaded");
        Ok(Arc::new(registry))
    }

    /// Freeze the configuration for handing to a context.
    pub fn into_config(self) -> Arc<ConfigStore> {
        let mut config = self.config;
        config.freeze();
        Arc::new(config)
    }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `ORBIT_LOG` picks one level for the
/// orbit crates. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("ORBIT_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "orbit={level},orbit_schema={level},orbit_smoke={level},orbit::bridge=warn"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Map a run result to the process exit code, reporting any error.
pub fn report(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Run failed: {e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
