//! Pipeline configuration.
//!
//! ```rust,ignore
//! use cloudfetch::CloudFetchConfig;
//! use std::time::Duration;
//!
//! let config = CloudFetchConfig::builder()
//!     .max_parallel_downloads(8)
//!     .retry_max_attempts(5)
//!     .link_expiry_buffer(Duration::from_secs(90))
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy settings for chunk downloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Download attempts before a chunk is aborted (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the exponential delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each delay
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_jitter: Duration::from_millis(100),
        }
    }
}

/// Configuration for a [`ChunkPipeline`](crate::ChunkPipeline)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudFetchConfig {
    /// Chunks allowed to be downloading or resident at the same time
    pub max_parallel_downloads: usize,
    /// Retry policy
    pub retry: RetryConfig,
    /// Links expiring within this margin are refreshed before use
    #[serde(with = "humantime_serde")]
    pub link_expiry_buffer: Duration,
    /// TCP connect timeout for chunk downloads
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Whole-request timeout for chunk downloads (headers and body)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Upper bound on the decoded size of a single chunk
    pub max_chunk_memory_bytes: Option<usize>,
    /// User agent sent with chunk downloads
    pub user_agent: String,
}

impl Default for CloudFetchConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 16,
            retry: RetryConfig::default(),
            link_expiry_buffer: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            max_chunk_memory_bytes: None,
            user_agent: concat!("cloudfetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CloudFetchConfig {
    /// Create a new builder
    pub fn builder() -> CloudFetchConfigBuilder {
        CloudFetchConfigBuilder::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_downloads == 0 {
            return Err(Error::config("max_parallel_downloads must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::config(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.max_chunk_memory_bytes == Some(0) {
            return Err(Error::config("max_chunk_memory_bytes must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`CloudFetchConfig`]
#[derive(Default)]
pub struct CloudFetchConfigBuilder {
    config: CloudFetchConfig,
}

impl CloudFetchConfigBuilder {
    /// Set the download window
    pub fn max_parallel_downloads(mut self, n: usize) -> Self {
        self.config.max_parallel_downloads = n;
        self
    }

    /// Set the full retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set maximum download attempts
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Set the first retry delay
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    /// Set the maximum retry delay
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    /// Set the jitter bound
    pub fn retry_max_jitter(mut self, jitter: Duration) -> Self {
        self.config.retry.max_jitter = jitter;
        self
    }

    /// Set the link expiry safety margin
    pub fn link_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.config.link_expiry_buffer = buffer;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Limit decoded memory per chunk
    pub fn max_chunk_memory_bytes(mut self, bytes: usize) -> Self {
        self.config.max_chunk_memory_bytes = Some(bytes);
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<CloudFetchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
