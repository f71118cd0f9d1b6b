//! Client configuration.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_API_HOST: &str = "pinedb.io";
pub const DEFAULT_API_VERSION: &str = "2024-01-01";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection and routing settings shared by every request a client makes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
  /// Routing target.
  pub project_id: String,
  /// Logical namespace inside the project.
  pub dataset: String,
  /// Credential; `None` for anonymous access.
  #[serde(skip_serializing)]
  pub token: Option<String>,
  /// Route reads through the cached edge layer.
  pub use_cdn: bool,
  /// Protocol version pin, `"1"` or a `YYYY-MM-DD` date.
  pub api_version: String,
  /// Either a bare domain (`pinedb.io`) or a full base URL.
  pub api_host: String,
  /// Default per-call timeout.
  pub timeout: Duration,
}

impl ClientConfig {
  pub fn new(project_id: impl Into<String>, dataset: impl Into<String>) -> Self {
    Self {
      project_id: project_id.into(),
      dataset: dataset.into(),
      token: None,
      use_cdn: false,
      api_version: DEFAULT_API_VERSION.to_string(),
      api_host: DEFAULT_API_HOST.to_string(),
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  pub fn with_cdn(mut self, use_cdn: bool) -> Self {
    self.use_cdn = use_cdn;
    self
  }

  pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
    self.api_version = version.into();
    self
  }

  pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
    self.api_host = host.into();
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Check every field, returning the first problem found.
  pub fn validate(&self) -> Result<()> {
    if !project_pattern().is_match(&self.project_id) {
      return Err(Error::InvalidConfig(format!(
        "project id {:?} may only contain a-z, 0-9 and dashes",
        self.project_id
      )));
    }
    if !dataset_pattern().is_match(&self.dataset) {
      return Err(Error::InvalidConfig(format!(
        "dataset {:?} must be 1-64 characters of a-z, 0-9, _ and -, starting alphanumeric",
        self.dataset
      )));
    }
    validate_api_version(&self.api_version)?;
    if self.api_host.is_empty() {
      return Err(Error::InvalidConfig("api host must not be empty".to_string()));
    }
    if self.timeout.is_zero() {
      return Err(Error::InvalidConfig("timeout must be positive".to_string()));
    }
    Ok(())
  }

  /// Merge a partial update into a copy of this configuration.
  pub fn merged(&self, patch: ConfigPatch) -> Result<Self> {
    let mut next = self.clone();
    if let Some(project_id) = patch.project_id {
      next.project_id = project_id;
    }
    if let Some(dataset) = patch.dataset {
      next.dataset = dataset;
    }
    if let Some(token) = patch.token {
      next.token = token;
    }
    if let Some(use_cdn) = patch.use_cdn {
      next.use_cdn = use_cdn;
    }
    if let Some(api_version) = patch.api_version {
      next.api_version = api_version;
    }
    if let Some(api_host) = patch.api_host {
      next.api_host = api_host;
    }
    if let Some(timeout) = patch.timeout {
      next.timeout = timeout;
    }
    next.validate()?;
    Ok(next)
  }

  /// Base URL for API calls; `cached` selects the edge layer.
  pub fn base_url(&self, cached: bool) -> String {
    let host = self.api_host.trim_end_matches('/');
    let root = if host.starts_with("http://") || host.starts_with("https://") {
      host.to_string()
    } else if cached {
      format!("https://{}.apicdn.{}", self.project_id, host)
    } else {
      format!("https://{}.api.{}", self.project_id, host)
    };
    format!("{}/v{}", root, self.api_version)
  }
}

impl fmt::Debug for ClientConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClientConfig")
      .field("project_id", &self.project_id)
      .field("dataset", &self.dataset)
      .field("token", &self.token.as_ref().map(|_| "<redacted>"))
      .field("use_cdn", &self.use_cdn)
      .field("api_version", &self.api_version)
      .field("api_host", &self.api_host)
      .field("timeout", &self.timeout)
      .finish()
  }
}

/// A partial configuration update. Unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
  pub project_id: Option<String>,
  pub dataset: Option<String>,
  /// `Some(None)` clears the token.
  pub token: Option<Option<String>>,
  pub use_cdn: Option<bool>,
  pub api_version: Option<String>,
  pub api_host: Option<String>,
  pub timeout: Option<Duration>,
}

impl ConfigPatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
    self.project_id = Some(project_id.into());
    self
  }

  pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
    self.dataset = Some(dataset.into());
    self
  }

  pub fn token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(Some(token.into()));
    self
  }

  pub fn anonymous(mut self) -> Self {
    self.token = Some(None);
    self
  }

  pub fn use_cdn(mut self, use_cdn: bool) -> Self {
    self.use_cdn = Some(use_cdn);
    self
  }

  pub fn api_version(mut self, version: impl Into<String>) -> Self {
    self.api_version = Some(version.into());
    self
  }

  pub fn api_host(mut self, host: impl Into<String>) -> Self {
    self.api_host = Some(host.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Process-local, shareable view of the current configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
  inner: Arc<RwLock<ClientConfig>>,
}

impl ConfigHandle {
  pub fn new(config: ClientConfig) -> Self {
    Self {
      inner: Arc::new(RwLock::new(config)),
    }
  }

  /// Snapshot of the current configuration.
  pub fn get(&self) -> ClientConfig {
    self
      .inner
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  /// Validate and apply a partial update, returning the new configuration.
  pub fn update(&self, patch: ConfigPatch) -> Result<ClientConfig> {
    let mut current = self
      .inner
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let next = current.merged(patch)?;
    *current = next.clone();
    Ok(next)
  }
}

fn project_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid project pattern"))
}

fn dataset_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid dataset pattern"))
}

fn validate_api_version(version: &str) -> Result<()> {
  if version == "1" || version == "X" {
    return Ok(());
  }
  NaiveDate::parse_from_str(version, "%Y-%m-%d")
    .map(|_| ())
    .map_err(|_| {
      Error::InvalidConfig(format!(
        "api version {:?} must be \"1\", \"X\" or a YYYY-MM-DD date",
        version
      ))
    })
}
