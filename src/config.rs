//! Search runner configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use mesh_dht::config::{AdmissionPolicy, SearchRunnerConfig};
//!
//! let config = SearchRunnerConfig::from_json_str(r#"{ "admission": "strict" }"#).unwrap();
//! assert_eq!(config.admission, AdmissionPolicy::Strict);
//! assert_eq!(config.max_concurrent_searches, 30);
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default ceiling on concurrently running searches.
pub const DEFAULT_MAX_CONCURRENT_SEARCHES: usize = 30;

/// Default number of routing table nodes a search starts from.
pub const DEFAULT_INITIAL_CANDIDATES: usize = 8;

/// Default bound on a single outbound find-node request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// How the search ceiling is compared against the active count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Reject only once the active count already exceeds the ceiling, which
    /// lets one search run beyond it.
    #[default]
    AllowOneOver,
    /// Reject as soon as the ceiling is reached.
    Strict,
}

impl AdmissionPolicy {
    /// Whether a new search must be refused with `active` searches running.
    ///
    /// ```
    /// use mesh_dht::config::AdmissionPolicy;
    ///
    /// assert!(!AdmissionPolicy::AllowOneOver.rejects(30, 30));
    /// assert!(AdmissionPolicy::AllowOneOver.rejects(31, 30));
    /// assert!(AdmissionPolicy::Strict.rejects(30, 30));
    /// ```
    pub fn rejects(self, active: usize, max: usize) -> bool {
        match self {
            AdmissionPolicy::AllowOneOver => active > max,
            AdmissionPolicy::Strict => active >= max,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRunnerConfig {
    pub max_concurrent_searches: usize,
    pub admission: AdmissionPolicy,
    /// Seeds taken from the routing table for each new search.
    pub initial_candidates: usize,
    /// Seeds speaking an older protocol are skipped.
    pub min_protocol_version: u32,
    pub request_timeout_ms: u64,
}

impl Default for SearchRunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_searches: DEFAULT_MAX_CONCURRENT_SEARCHES,
            admission: AdmissionPolicy::default(),
            initial_candidates: DEFAULT_INITIAL_CANDIDATES,
            min_protocol_version: 0,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl SearchRunnerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing search runner config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_searches == 0 {
            bail!("max_concurrent_searches must be at least 1");
        }
        if self.initial_candidates == 0 {
            bail!("initial_candidates must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
