use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::cache::ResponseCache;

pub const ENDPOINT_ENV: &str = "REPOSCOPE_ENDPOINT";
pub const API_TOKEN_ENV: &str = "REPOSCOPE_API_TOKEN";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub repository: RepositoryConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub api_token: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: i64,
    /// Empty means the platform temp dir.
    pub dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub concurrency: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RepositoryConfig {
    pub protected_branches: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub color: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            api_token: "".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 60,
            dir: "".to_string(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::query::DEFAULT_CONCURRENCY,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".reposcope.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    /// Saved config (or defaults) with environment overrides applied.
    pub fn resolve() -> Result<Config> {
        let config = Self::load()?.unwrap_or_default();
        Ok(config.with_overrides(|name| std::env::var(name).ok()))
    }

    /// Like [`Config::resolve`], but an unreadable or malformed file falls
    /// back to defaults. Used by commands that never talk to the service.
    pub fn resolve_lenient() -> Config {
        let config = Self::load().ok().flatten().unwrap_or_default();
        config.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            self.service.endpoint = endpoint;
        }
        if let Some(token) = lookup(API_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.service.api_token = token;
        }
        self
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    pub fn api_token(&self) -> Option<String> {
        (!self.service.api_token.is_empty()).then(|| self.service.api_token.clone())
    }

    pub fn cache_dir(&self) -> PathBuf {
        if self.cache.dir.is_empty() {
            ResponseCache::default_dir()
        } else {
            PathBuf::from(&self.cache.dir)
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .context("Invalid boolean value. Use 'true' or 'false'")
}

// CLI helper functions
pub fn create_default_config(out: &mut dyn Write, overwrite: bool) -> Result<()> {
    let config = Config::default();
    let path = Config::config_path()?;
    if !std::fs::exists(&path)? || overwrite {
        config.save()?;

        writeln!(out, "📝 Created default configuration file.")?;
        writeln!(out, "📍 Point it at your service:")?;
        writeln!(out, "   reposcope config set endpoint https://...")?;
        writeln!(out, "or edit")?;
        writeln!(out, "   {}", path.display())?;
    } else {
        writeln!(
            out,
            "Configuration already exists.  Pass `--overwrite` to overwrite."
        )?;
    }

    Ok(())
}

pub fn show_config(out: &mut dyn Write) -> Result<()> {
    match Config::load()? {
        Some(config) => {
            writeln!(out, "🔧 Current configuration:")?;
            writeln!(out, "   Endpoint: {}", config.service.endpoint)?;
            writeln!(
                out,
                "   API Token: {}",
                if config.service.api_token.is_empty() {
                    "Not set"
                } else {
                    "Set"
                }
            )?;
            writeln!(out, "   Timeout: {}s", config.service.timeout_seconds)?;
            writeln!(out, "   Cache TTL: {}s", config.cache.ttl_seconds)?;
            writeln!(out, "   Cache Dir: {}", config.cache_dir().display())?;
            writeln!(out, "   Concurrency: {}", config.query.concurrency)?;
            writeln!(
                out,
                "   Protected Branches: {}",
                config.repository.protected_branches.join(", ")
            )?;
            writeln!(out, "   Color: {}", config.output.color)?;
        }
        None => {
            writeln!(out, "❌ No configuration file found.")?;
            writeln!(out, "   Run 'reposcope config init' to create one.")?;
        }
    }
    Ok(())
}

pub fn set_config_value(out: &mut dyn Write, key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "endpoint" => config.service.endpoint = value.trim_end_matches('/').to_string(),
        "api-token" => config.service.api_token = value.to_string(),
        "timeout-seconds" => {
            config.service.timeout_seconds = value.parse::<u64>().context("Invalid number value")?;
        }
        "cache-ttl" => {
            config.cache.ttl_seconds = value.parse::<i64>().context("Invalid number value")?;
        }
        "cache-dir" => config.cache.dir = value.to_string(),
        "concurrency" => {
            let concurrency = value.parse::<usize>().context("Invalid number value")?;
            if concurrency == 0 {
                anyhow::bail!("Concurrency must be at least 1");
            }
            config.query.concurrency = concurrency;
        }
        "protected-branches" => {
            config.repository.protected_branches = value
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
        }
        "color" => config.output.color = parse_bool(value)?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save()?;
    writeln!(
        out,
        "✅ Configuration saved to: {}",
        Config::config_path()?.display()
    )?;
    Ok(())
}
