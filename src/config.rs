//! Configuration loading for tollgated.
//!
//! Configuration is loaded from TOML with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `$TOLLGATE_CONFIG`
//! 3. `~/.tollgate/config.toml` (user)
//! 4. `/etc/tollgate/config.toml` (system)
//!
//! With no file present the defaults apply. `TOLLGATE_*` environment
//! variables override file values. Everything is validated once at startup;
//! unknown keys and malformed values are errors.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::budget::{BudgetConfig, ProviderBudget, RequestOverhead};
use crate::cache::CacheConfig;
use crate::ratelimit::{BucketLimits, RateLimitConfig};
use crate::retry::RetryConfig;
use crate::storage::StorageRouter;
use crate::{Result, TollgateError};

/// Provider assumed for budget checks when none is configured.
pub const DEFAULT_PROVIDER: &str = "openrouter";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheSection,
    pub rate_limit: RateLimitSection,
    pub token_budget: TokenBudgetSection,
    pub retry: RetrySection,
    pub storage: StorageSection,
    pub agent: AgentSection,
    pub logging: LoggingSection,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8000).
    pub address: String,
    /// Whole-request timeout in seconds (default: 300).
    pub request_timeout_secs: u64,
    /// Maximum request body size in bytes (default: 1 MiB).
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
            request_timeout_secs: 300,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_entries: u64,
    /// Per-category TTL overrides in seconds.
    pub category_ttl: HashMap<String, u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 3600,
            max_entries: crate::cache::memory::DEFAULT_MAX_ENTRIES,
            category_ttl: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    /// Bucket capacity (burst size).
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
    pub idle_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-client overrides keyed by client key.
    pub overrides: HashMap<String, BucketLimits>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 100.0 / 60.0,
            idle_secs: 600,
            sweep_interval_secs: 60,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenBudgetSection {
    pub enabled: bool,
    pub default_ceiling: usize,
    pub reserved_output_tokens: usize,
    pub overhead: RequestOverhead,
    /// Merged over the built-in provider table.
    pub providers: HashMap<String, ProviderBudget>,
}

impl Default for TokenBudgetSection {
    fn default() -> Self {
        let defaults = BudgetConfig::default();
        Self {
            enabled: defaults.enabled,
            default_ceiling: defaults.default_ceiling,
            reserved_output_tokens: defaults.reserved_output_tokens,
            overhead: defaults.overhead,
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// Deadline per upstream attempt; 0 disables it.
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.1,
            attempt_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Report root; defaults to `<data dir>/tollgate/reports`.
    pub reports_dir: Option<PathBuf>,
    /// Memory root; defaults to `<data dir>/tollgate/memories`.
    pub memories_dir: Option<PathBuf>,
    /// Create the default memory files at startup.
    pub seed_memories: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            reports_dir: None,
            memories_dir: None,
            seed_memories: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Base URL of the agent runtime.
    pub url: String,
    /// Provider the agent talks to; selects the token budget.
    pub provider: String,
    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:2024".to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub format: LogFormat,
}

impl Config {
    /// Load, apply environment overrides, resolve storage roots and validate.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.resolve_storage_roots()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TollgateError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            TollgateError::Configuration(msg) => {
                TollgateError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TollgateError::Configuration(format!("Failed to parse config: {e}")))
    }

    /// Resolve the config file path. `Ok(None)` means use defaults.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        let from_env = std::env::var_os("TOLLGATE_CONFIG").map(PathBuf::from);
        if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(TollgateError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".tollgate").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/tollgate/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply `TOLLGATE_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = EnvReader { lookup: &lookup };

        env.set_string("TOLLGATE_ADDRESS", &mut self.server.address);
        env.set_parsed("TOLLGATE_CACHE_ENABLED", &mut self.cache.enabled)?;
        env.set_parsed("TOLLGATE_CACHE_TTL_SECS", &mut self.cache.default_ttl_secs)?;
        env.set_parsed("TOLLGATE_CACHE_MAX_ENTRIES", &mut self.cache.max_entries)?;
        env.set_parsed("TOLLGATE_RATE_LIMIT_CAPACITY", &mut self.rate_limit.capacity)?;
        env.set_parsed(
            "TOLLGATE_RATE_LIMIT_REFILL_PER_SEC",
            &mut self.rate_limit.refill_per_sec,
        )?;
        env.set_parsed("TOLLGATE_RATE_LIMIT_IDLE_SECS", &mut self.rate_limit.idle_secs)?;
        env.set_parsed("TOLLGATE_TOKEN_LIMITS_ENABLED", &mut self.token_budget.enabled)?;
        env.set_parsed(
            "TOLLGATE_MAX_TOKENS_PER_REQUEST",
            &mut self.token_budget.default_ceiling,
        )?;
        env.set_parsed("TOLLGATE_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        env.set_parsed("TOLLGATE_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        env.set_parsed("TOLLGATE_RETRY_MULTIPLIER", &mut self.retry.multiplier)?;
        env.set_parsed("TOLLGATE_RETRY_JITTER", &mut self.retry.jitter)?;
        if let Some(dir) = env.get("TOLLGATE_REPORTS_DIR") {
            self.storage.reports_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env.get("TOLLGATE_MEMORIES_DIR") {
            self.storage.memories_dir = Some(PathBuf::from(dir));
        }
        env.set_string("TOLLGATE_AGENT_URL", &mut self.agent.url);
        env.set_string("TOLLGATE_PROVIDER", &mut self.agent.provider);
        Ok(())
    }

    /// Fill unset storage roots from the platform data directory.
    ///
    /// Runs once at startup; the router never consults the working directory.
    pub fn resolve_storage_roots(&mut self) -> Result<()> {
        if self.storage.reports_dir.is_some() && self.storage.memories_dir.is_some() {
            return Ok(());
        }
        let base = dirs::data_dir()
            .map(|d| d.join("tollgate"))
            .ok_or_else(|| {
                TollgateError::Configuration(
                    "no platform data directory; set storage.reports_dir and storage.memories_dir"
                        .into(),
                )
            })?;
        self.storage
            .reports_dir
            .get_or_insert_with(|| base.join("reports"));
        self.storage
            .memories_dir
            .get_or_insert_with(|| base.join("memories"));
        Ok(())
    }

    /// Check every value once, before anything is constructed.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(TollgateError::Configuration(msg))
        }

        if self.server.address.parse::<SocketAddr>().is_err() {
            return invalid(format!("server.address {:?} is not a socket address", self.server.address));
        }
        if self.server.request_timeout_secs == 0 {
            return invalid("server.request_timeout_secs must be > 0".into());
        }
        if self.cache.default_ttl_secs == 0 {
            return invalid("cache.default_ttl_secs must be > 0".into());
        }
        if let Some((category, _)) = self.cache.category_ttl.iter().find(|(_, ttl)| **ttl == 0) {
            return invalid(format!("cache.category_ttl.{category} must be > 0"));
        }
        let default_limits = BucketLimits {
            capacity: self.rate_limit.capacity,
            refill_per_sec: self.rate_limit.refill_per_sec,
        };
        let limits = std::iter::once(("default", &default_limits))
            .chain(self.rate_limit.overrides.iter().map(|(k, v)| (k.as_str(), v)));
        for (client, limits) in limits {
            if limits.capacity == 0 {
                return invalid(format!("rate_limit capacity for {client} must be >= 1"));
            }
            if !(limits.refill_per_sec.is_finite() && limits.refill_per_sec > 0.0) {
                return invalid(format!("rate_limit refill_per_sec for {client} must be > 0"));
            }
        }
        if self.rate_limit.idle_secs == 0 {
            return invalid("rate_limit.idle_secs must be > 0".into());
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            return invalid("rate_limit.sweep_interval_secs must be > 0".into());
        }
        if self.token_budget.default_ceiling == 0 {
            return invalid("token_budget.default_ceiling must be > 0".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be >= 1".into());
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]".into());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms".into());
        }
        for (name, dir) in [
            ("reports_dir", &self.storage.reports_dir),
            ("memories_dir", &self.storage.memories_dir),
        ] {
            match dir {
                Some(dir) if dir.is_absolute() => {}
                Some(dir) => return invalid(format!("storage.{name} {dir:?} must be absolute")),
                None => return invalid(format!("storage.{name} is not set")),
            }
        }
        if reqwest::Url::parse(&self.agent.url).is_err() {
            return invalid(format!("agent.url {:?} is not a URL", self.agent.url));
        }
        if self.agent.provider.trim().is_empty() {
            return invalid("agent.provider must not be empty".into());
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.server.address.parse().map_err(|e| {
            TollgateError::Configuration(format!("invalid server.address: {e}"))
        })
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let mut config = RateLimitConfig::new()
            .limits(self.rate_limit.capacity, self.rate_limit.refill_per_sec)
            .idle_timeout(Duration::from_secs(self.rate_limit.idle_secs))
            .sweep_interval(Duration::from_secs(self.rate_limit.sweep_interval_secs));
        for (client, limits) in &self.rate_limit.overrides {
            config = config.override_client(client.clone(), *limits);
        }
        config
    }

    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new()
            .enabled(self.cache.enabled)
            .max_entries(self.cache.max_entries)
            .ttl(Duration::from_secs(self.cache.default_ttl_secs));
        for (category, secs) in &self.cache.category_ttl {
            config = config.category_ttl(category.clone(), Duration::from_secs(*secs));
        }
        config
    }

    pub fn budget_config(&self) -> BudgetConfig {
        let section = &self.token_budget;
        let mut config = BudgetConfig::new()
            .enabled(section.enabled)
            .default_ceiling(section.default_ceiling)
            .reserved_output_tokens(section.reserved_output_tokens)
            .overhead(section.overhead);
        for (name, budget) in &section.providers {
            config = config.provider(name.clone(), *budget);
        }
        config
    }

    pub fn retry_config(&self) -> RetryConfig {
        let config = RetryConfig::new()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.base_delay_ms))
            .multiplier(self.retry.multiplier)
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .jitter(self.retry.jitter);
        match self.retry.attempt_timeout_secs {
            0 => config,
            secs => config.attempt_timeout(Duration::from_secs(secs)),
        }
    }

    /// Build the storage router. Requires resolved roots.
    pub fn storage_router(&self) -> Result<StorageRouter> {
        match (&self.storage.reports_dir, &self.storage.memories_dir) {
            (Some(reports), Some(memories)) => StorageRouter::new(reports, memories),
            _ => Err(TollgateError::Configuration(
                "storage roots are not resolved".into(),
            )),
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn set_string(&self, name: &str, target: &mut String) {
        if let Some(value) = self.get(name) {
            *target = value;
        }
    }

    fn set_parsed<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.get(name) {
            *target = value.trim().parse().map_err(|e| {
                TollgateError::Configuration(format!("{name}={value:?} is invalid: {e}"))
            })?;
        }
        Ok(())
    }
}
