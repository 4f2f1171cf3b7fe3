//! Configuration schema.
//!
//! Loaded from `~/.idlookup/config.toml` (or an explicit path), then patched
//! from `IDLOOKUP_*` environment variables. Every section has defaults, so an
//! empty or missing file yields a working SQLite setup in the data directory.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backend::BackendError;

/// Default durable token lifetime: 1 day (seconds).
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 3600;

/// Default one-time token lifetime: 10 minutes (seconds).
const DEFAULT_ONE_TIME_TTL_SECS: u64 = 600;

/// Default reaper interval: 1 hour (seconds).
const DEFAULT_VACUUM_DELAY_SECS: u64 = 3600;

/// Default pepper rotation: every day at 01:09.
const DEFAULT_PEPPER_CRON: &str = "9 1 * * *";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub tokens: TokensConfig,
    pub lookup: LookupConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Sqlite,
    #[serde(alias = "pg")]
    Postgres,
}

impl std::str::FromStr for DatabaseEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "pg" | "postgres" | "postgresql" => Ok(Self::Postgres),
            other => bail!("Unknown database engine '{other}' (expected sqlite or postgres)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    /// SQLite database file. `~` is expanded.
    pub path: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    /// Maximum pooled SQLite connections.
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Sqlite,
            path: default_data_dir().join("idlookup.db").display().to_string(),
            host: "localhost".into(),
            port: 5432,
            name: "idlookup".into(),
            user: "idlookup".into(),
            password: String::new(),
            ssl: false,
            pool_size: 8,
        }
    }
}

impl DatabaseConfig {
    /// SQLite path with `~` and `$VARS` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf, BackendError> {
        if self.path.trim().is_empty() {
            return Err(BackendError::Config("database.path is empty".into()));
        }
        expand_path(&self.path).map_err(|e| BackendError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// Lifetime of durable tokens when the caller gives none. 0 = never expires.
    pub ttl_secs: u64,
    /// Lifetime of one-time tokens when the caller gives none.
    pub one_time_ttl_secs: u64,
    /// Interval between expiry sweeps.
    pub vacuum_delay_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            one_time_ttl_secs: DEFAULT_ONE_TIME_TTL_SECS,
            vacuum_delay_secs: DEFAULT_VACUUM_DELAY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Advertised hash algorithms, in preference order.
    pub algorithms: Vec<String>,
    /// Pepper rotation schedule (5, 6 or 7 field cron expression, UTC).
    pub pepper_cron: String,
    /// Largest accepted hash batch.
    pub max_batch: usize,
    /// Optional JSON directory file used to build the hash index.
    pub directory: Option<String>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            algorithms: vec!["sha256".into(), "sha512".into()],
            pepper_cron: DEFAULT_PEPPER_CRON.into(),
            max_batch: 10_000,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing-subscriber` env-filter directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "idlookup=info".into(),
        }
    }
}

impl Config {
    /// Default config location: `~/.idlookup/config.toml`.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Patch values from environment variables.
    ///
    /// `lookup` is a getter so tests can supply a fake environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str, raw: String| -> Result<u64> {
            raw.trim()
                .parse()
                .with_context(|| format!("{key} must be an unsigned integer, got '{raw}'"))
        };

        if let Some(v) = lookup("IDLOOKUP_DATABASE_ENGINE") {
            self.database.engine = v.parse()?;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_HOST") {
            self.database.host = v;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_PORT") {
            self.database.port = u16::try_from(parse_u64("IDLOOKUP_DATABASE_PORT", v)?)
                .context("IDLOOKUP_DATABASE_PORT out of range")?;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = lookup("IDLOOKUP_DATABASE_SSL") {
            self.database.ssl = matches!(v.trim(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("IDLOOKUP_TOKEN_TTL_SECS") {
            self.tokens.ttl_secs = parse_u64("IDLOOKUP_TOKEN_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("IDLOOKUP_ONE_TIME_TTL_SECS") {
            self.tokens.one_time_ttl_secs = parse_u64("IDLOOKUP_ONE_TIME_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("IDLOOKUP_VACUUM_DELAY_SECS") {
            self.tokens.vacuum_delay_secs = parse_u64("IDLOOKUP_VACUUM_DELAY_SECS", v)?;
        }
        if let Some(v) = lookup("IDLOOKUP_PEPPER_CRON") {
            self.lookup.pepper_cron = v;
        }
        if let Some(v) = lookup("IDLOOKUP_ALGORITHMS") {
            self.lookup.algorithms = v
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_lowercase)
                .collect();
        }
        if let Some(v) = lookup("IDLOOKUP_MAX_BATCH") {
            self.lookup.max_batch = usize::try_from(parse_u64("IDLOOKUP_MAX_BATCH", v)?)
                .context("IDLOOKUP_MAX_BATCH out of range")?;
        }
        if let Some(v) = lookup("IDLOOKUP_DIRECTORY") {
            self.lookup.directory = Some(v);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.one_time_ttl_secs == 0 {
            bail!("tokens.one_time_ttl_secs must be greater than 0");
        }
        if self.tokens.vacuum_delay_secs == 0 {
            bail!("tokens.vacuum_delay_secs must be greater than 0");
        }
        if self.lookup.algorithms.is_empty() {
            bail!("lookup.algorithms must list at least one algorithm");
        }
        for name in &self.lookup.algorithms {
            name.parse::<crate::lookup::Algorithm>()?;
        }
        if self.lookup.max_batch == 0 {
            bail!("lookup.max_batch must be greater than 0");
        }
        crate::pepper::PepperSchedule::parse(&self.lookup.pepper_cron)?;
        Ok(())
    }
}

/// `~/.idlookup`, falling back to the working directory when no home exists.
pub fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".idlookup"))
        .unwrap_or_else(|| PathBuf::from(".idlookup"))
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("Cannot expand path '{raw}'"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
