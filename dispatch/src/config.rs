use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{DispatchError, Result};

pub const DEFAULT_NUM_KEYS: usize = 10_000;
pub const DEFAULT_NUM_WORKERS: usize = 16;
/// Maximum number of un-handled records per queue.
pub const DEFAULT_BACKLOG: usize = 1000;
/// Keys travel as `u16` on the wire.
pub const MAX_KEYS: usize = u16::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub num_keys: usize,
    pub num_workers: usize,
    /// Capacity of each worker's request lane.
    pub backlog: usize,
    pub response_backlog: usize,
    /// How many times a worker retries a response push before dropping it.
    /// `None` retries until the host makes room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_retry_limit: Option<u32>,
    pub response_backoff_ms: u64,
    /// When set together with `shmem_file_name`, the mapping gets a link file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shmem_file_name: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            num_keys: DEFAULT_NUM_KEYS,
            num_workers: DEFAULT_NUM_WORKERS,
            backlog: DEFAULT_BACKLOG,
            response_backlog: DEFAULT_BACKLOG,
            response_retry_limit: None,
            response_backoff_ms: 1,
            data_dir: None,
            shmem_file_name: None,
        }
    }
}

impl DispatchConfig {
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_keys == 0 || self.num_keys > MAX_KEYS {
            return Err(DispatchError::Config(format!(
                "num_keys must be within 1..={}, got {}",
                MAX_KEYS, self.num_keys
            )));
        }
        if self.num_workers == 0 || self.num_workers > self.num_keys {
            return Err(DispatchError::Config(format!(
                "num_workers must be within 1..={}, got {}",
                self.num_keys, self.num_workers
            )));
        }
        if self.backlog == 0 || self.response_backlog == 0 {
            return Err(DispatchError::Config(
                "backlog and response_backlog must be non-zero".to_string(),
            ));
        }
        if self.backlog > u32::MAX as usize || self.response_backlog > u32::MAX as usize {
            return Err(DispatchError::Config(
                "backlog and response_backlog must fit in 32 bits".to_string(),
            ));
        }
        if self.data_dir.is_some() != self.shmem_file_name.is_some() {
            return Err(DispatchError::Config(
                "data_dir and shmem_file_name must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn response_backoff(&self) -> Duration {
        Duration::from_millis(self.response_backoff_ms)
    }

    pub fn link_path(&self) -> Option<PathBuf> {
        match (&self.data_dir, &self.shmem_file_name) {
            (Some(dir), Some(name)) => Some(PathBuf::from(dir).join(name)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    config: DispatchConfig,
}

impl DispatchConfigBuilder {
    pub fn num_keys(mut self, num_keys: usize) -> Self {
        self.config.num_keys = num_keys;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    pub fn backlog(mut self, backlog: usize) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn response_backlog(mut self, response_backlog: usize) -> Self {
        self.config.response_backlog = response_backlog;
        self
    }

    pub fn response_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.config.response_retry_limit = limit;
        self
    }

    pub fn response_backoff_ms(mut self, ms: u64) -> Self {
        self.config.response_backoff_ms = ms;
        self
    }

    pub fn data_dir(mut self, data_dir: String) -> Self {
        self.config.data_dir = Some(data_dir);
        self
    }

    pub fn shmem_file_name(mut self, shmem_file_name: String) -> Self {
        self.config.shmem_file_name = Some(shmem_file_name);
        self
    }

    pub fn build(self) -> Result<DispatchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
