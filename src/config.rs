use crate::api::pagination::DEFAULT_PAGE_SIZE;
use crate::error::{IngestError, IngestResult};
use crate::upload::rate_limiter::{DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_PER_SECOND};
use crate::upload::retry::RetryStrategy;
use crate::upload::types::{DEFAULT_CONCURRENCY, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.cloud.deepset.ai/api/v1";

pub const ENV_API_KEY: &str = "API_KEY";
pub const ENV_API_URL: &str = "API_URL";
pub const ENV_DEFAULT_WORKSPACE: &str = "DEFAULT_WORKSPACE_NAME";

/// Contents of `~/.cloud-ingest/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub default_workspace: Option<String>,
    #[serde(default)]
    pub upload: UploadSettings,
}

/// Pipeline tunables; every key is optional in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    pub max_batch_size: usize,
    pub max_batch_bytes: u64,
    pub concurrency: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_per_second: f64,
    pub api_max_attempts: u32,
    pub transfer_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub default_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub page_size: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit_capacity: DEFAULT_RATE_LIMIT_CAPACITY,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            api_max_attempts: 3,
            transfer_max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            poll_interval_ms: 2_000,
            default_timeout_secs: 300,
            request_timeout_secs: 20,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl UploadSettings {
    pub fn api_retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy(self.api_max_attempts)
    }

    pub fn transfer_retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy(self.transfer_max_attempts)
    }

    fn retry_strategy(&self, max_attempts: u32) -> RetryStrategy {
        RetryStrategy::new(
            max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> IngestResult<()> {
        let positive = [
            ("maxBatchSize", self.max_batch_size as u64),
            ("maxBatchBytes", self.max_batch_bytes),
            ("concurrency", self.concurrency as u64),
            ("rateLimitCapacity", self.rate_limit_capacity as u64),
            ("apiMaxAttempts", self.api_max_attempts as u64),
            ("transferMaxAttempts", self.transfer_max_attempts as u64),
            ("pollIntervalMs", self.poll_interval_ms),
            ("requestTimeoutSecs", self.request_timeout_secs),
            ("pageSize", self.page_size as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(IngestError::Config(format!("upload.{} must be positive", key)));
        }
        if !(self.rate_limit_per_second > 0.0 && self.rate_limit_per_second.is_finite()) {
            return Err(IngestError::Config(
                "upload.rateLimitPerSecond must be positive".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(IngestError::Config(
                "upload.retryBaseDelayMs must not exceed upload.retryMaxDelayMs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validated settings the client is built from
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_key: String,
    pub api_url: String,
    pub default_workspace: Option<String>,
    pub upload: UploadSettings,
}

impl ResolvedConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            default_workspace: None,
            upload: UploadSettings::default(),
        }
    }

    pub fn with_default_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.default_workspace = Some(workspace.into());
        self
    }
}

impl ClientConfig {
    /// Override file values with environment values found by `lookup`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(url) = non_empty(ENV_API_URL) {
            self.api_url = Some(url);
        }
        if let Some(workspace) = non_empty(ENV_DEFAULT_WORKSPACE) {
            self.default_workspace = Some(workspace);
        }
    }

    /// Validate and fill in defaults
    pub fn resolve(&self) -> IngestResult<ResolvedConfig> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                IngestError::Config(format!(
                    "No API key configured; set {} or apiKey in the config file",
                    ENV_API_KEY
                ))
            })?;

        let api_url = self
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API_URL);
        let parsed = url::Url::parse(api_url)
            .map_err(|e| IngestError::Config(format!("Invalid API URL '{}': {}", api_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IngestError::Config(format!(
                "API URL must use http or https: {}",
                api_url
            )));
        }

        self.upload.validate()?;

        Ok(ResolvedConfig {
            api_key: api_key.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            default_workspace: self
                .default_workspace
                .as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string),
            upload: self.upload.clone(),
        })
    }
}

pub fn get_config_dir() -> IngestResult<PathBuf> {
    if let Some(home_dir) = dirs::home_dir() {
        Ok(home_dir.join(".cloud-ingest"))
    } else {
        Err(IngestError::Config("Could not find home directory".to_string()))
    }
}

pub fn get_config_file_path() -> IngestResult<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn get_logs_dir() -> IngestResult<PathBuf> {
    Ok(get_config_dir()?.join("logs"))
}

/// Create `dir` readable by the owner only
pub fn ensure_private_dir(dir: &Path) -> IngestResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(dir)?.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

pub fn load_config() -> IngestResult<ClientConfig> {
    load_config_from(&get_config_file_path()?)
}

/// Read a config file; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> IngestResult<ClientConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "No config file, using defaults");
        return Ok(ClientConfig::default());
    }
    let content = fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&content)?;
    Ok(config)
}

pub fn save_config(config: &ClientConfig) -> IngestResult<()> {
    save_config_to(&get_config_file_path()?, config)
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> IngestResult<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;

    // Owner read/write only, it holds the API key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }

    Ok(())
}
