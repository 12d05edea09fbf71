//! Configuration for the synchronized cache

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a synchronized cache participant
///
/// Mirrors the flat option set a host application passes when registering
/// the cache: storage root, refresh TTL, backend key prefix, catch-up
/// ceiling and file permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the local store
    pub path: PathBuf,

    /// Process-class identity; each identity gets its own subtree under `path`
    pub identity: String,

    /// How long local state is trusted before checking the shared backend again
    pub local_ttl: Duration,

    /// Jitter factor (0.0 - 1.0) applied to `local_ttl` per refresh window
    /// Spreads out refreshes of participants that started together
    pub local_ttl_jitter: f64,

    /// Prefix for every key written to the shared backend
    pub shared_prefix: String,

    /// Largest version gap replayed incrementally before clearing everything
    pub max_catchup_versions: u64,

    /// Attempts to publish before giving up on a moving global base
    pub max_publish_attempts: u32,

    /// Keep read records in memory
    pub buffered: bool,

    /// Honor lifecycle events passed to `handle_event`
    pub listen_events: bool,

    /// Unix permission bits for files (None leaves the umask default)
    pub file_permission: Option<u32>,

    /// Unix permission bits for directories
    pub directory_permission: Option<u32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            identity: "default".to_string(),
            local_ttl: Duration::from_secs(60),
            local_ttl_jitter: 0.0,
            shared_prefix: "loc-sync-cache_".to_string(),
            max_catchup_versions: 100,
            max_publish_attempts: 100,
            buffered: true,
            listen_events: true,
            file_permission: Some(0o644),
            directory_permission: Some(0o755),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from `SYNC_CACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is honored. Unset variables keep
    /// their defaults; `SYNC_CACHE_PATH` is required.
    pub fn from_env() -> Result<Self, String> {
        dotenv::dotenv().ok();

        let mut config = CacheConfig::default();

        config.path = std::env::var("SYNC_CACHE_PATH")
            .map(PathBuf::from)
            .map_err(|_| "SYNC_CACHE_PATH must be set".to_string())?;

        if let Ok(identity) = std::env::var("SYNC_CACHE_IDENTITY") {
            config.identity = identity;
        }
        if let Some(secs) = env_parse::<u64>("SYNC_CACHE_LOCAL_TTL")? {
            config.local_ttl = Duration::from_secs(secs);
        }
        if let Some(jitter) = env_parse::<f64>("SYNC_CACHE_LOCAL_TTL_JITTER")? {
            config.local_ttl_jitter = jitter;
        }
        if let Ok(prefix) = std::env::var("SYNC_CACHE_PREFIX") {
            config.shared_prefix = prefix;
        }
        if let Some(max) = env_parse::<u64>("SYNC_CACHE_MAX_CATCHUP")? {
            config.max_catchup_versions = max;
        }
        if let Some(attempts) = env_parse::<u32>("SYNC_CACHE_MAX_PUBLISH_ATTEMPTS")? {
            config.max_publish_attempts = attempts;
        }
        if let Some(buffered) = env_parse::<bool>("SYNC_CACHE_BUFFERED")? {
            config.buffered = buffered;
        }
        if let Some(listen) = env_parse::<bool>("SYNC_CACHE_LISTEN_EVENTS")? {
            config.listen_events = listen;
        }
        if let Ok(mode) = std::env::var("SYNC_CACHE_FILE_PERMISSION") {
            config.file_permission = Some(parse_mode(&mode)?);
        }
        if let Ok(mode) = std::env::var("SYNC_CACHE_DIRECTORY_PERMISSION") {
            config.directory_permission = Some(parse_mode(&mode)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("path must be configured".to_string());
        }

        if self.identity.is_empty()
            || self
                .identity
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '.')
        {
            return Err(format!(
                "identity must be a plain directory name, got {:?}",
                self.identity
            ));
        }

        if self.local_ttl_jitter < 0.0 || self.local_ttl_jitter > 1.0 {
            return Err("local_ttl_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.max_catchup_versions == 0 {
            return Err("max_catchup_versions must be greater than 0".to_string());
        }

        if self.max_publish_attempts == 0 {
            return Err("max_publish_attempts must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Calculate the refresh window with jitter applied
    pub fn local_ttl_with_jitter(&self) -> Duration {
        if self.local_ttl_jitter == 0.0 || self.local_ttl.is_zero() {
            return self.local_ttl;
        }

        let base_secs = self.local_ttl.as_secs_f64();
        let jitter_range = base_secs * self.local_ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.0);

        Duration::from_secs_f64(final_secs)
    }

    /// Directory holding this identity's state, records and locks
    pub fn identity_dir(&self) -> PathBuf {
        self.path.join(&self.identity)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_mode(raw: &str) -> Result<u32, String> {
    let digits = raw.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|_| format!("invalid octal file mode: {:?}", raw))
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    path: Option<PathBuf>,
    identity: Option<String>,
    local_ttl: Option<Duration>,
    local_ttl_jitter: Option<f64>,
    shared_prefix: Option<String>,
    max_catchup_versions: Option<u64>,
    max_publish_attempts: Option<u32>,
    buffered: Option<bool>,
    listen_events: Option<bool>,
    file_permission: Option<Option<u32>>,
    directory_permission: Option<Option<u32>>,
}

impl CacheConfigBuilder {
    /// Set the local storage root
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the process-class identity
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set how long local state is trusted without a backend check
    pub fn local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = Some(ttl);
        self
    }

    /// Set the refresh window jitter factor (0.0 - 1.0)
    pub fn local_ttl_jitter(mut self, jitter: f64) -> Self {
        self.local_ttl_jitter = Some(jitter);
        self
    }

    /// Set the shared backend key prefix
    pub fn shared_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shared_prefix = Some(prefix.into());
        self
    }

    /// Set the catch-up ceiling
    pub fn max_catchup_versions(mut self, max: u64) -> Self {
        self.max_catchup_versions = Some(max);
        self
    }

    /// Set the publish attempt bound
    pub fn max_publish_attempts(mut self, attempts: u32) -> Self {
        self.max_publish_attempts = Some(attempts);
        self
    }

    /// Enable or disable the in-memory buffer
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = Some(buffered);
        self
    }

    /// Enable or disable lifecycle event handling
    pub fn listen_events(mut self, listen: bool) -> Self {
        self.listen_events = Some(listen);
        self
    }

    /// Set file permission bits
    pub fn file_permission(mut self, mode: Option<u32>) -> Self {
        self.file_permission = Some(mode);
        self
    }

    /// Set directory permission bits
    pub fn directory_permission(mut self, mode: Option<u32>) -> Self {
        self.directory_permission = Some(mode);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            path: self.path.unwrap_or(defaults.path),
            identity: self.identity.unwrap_or(defaults.identity),
            local_ttl: self.local_ttl.unwrap_or(defaults.local_ttl),
            local_ttl_jitter: self.local_ttl_jitter.unwrap_or(defaults.local_ttl_jitter),
            shared_prefix: self.shared_prefix.unwrap_or(defaults.shared_prefix),
            max_catchup_versions: self
                .max_catchup_versions
                .unwrap_or(defaults.max_catchup_versions),
            max_publish_attempts: self
                .max_publish_attempts
                .unwrap_or(defaults.max_publish_attempts),
            buffered: self.buffered.unwrap_or(defaults.buffered),
            listen_events: self.listen_events.unwrap_or(defaults.listen_events),
            file_permission: self.file_permission.unwrap_or(defaults.file_permission),
            directory_permission: self
                .directory_permission
                .unwrap_or(defaults.directory_permission),
        }
    }
}
