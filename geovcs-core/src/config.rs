//! Repository configuration and platform services

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::RevPerson;

pub const CONFIG_FILE: &str = "config.json";

/// Storage engine backing a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Heap,
    #[default]
    Sled,
}

/// Per-repository settings, persisted as `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub uuid: String,
    pub backend: Backend,
    /// Commit identity
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    /// Flush object batches to disk before returning
    pub sync_writes: bool,
    pub put_all_batch_size: usize,
    /// Decoded objects kept in memory; 0 disables the cache
    pub object_cache_size: usize,
    /// Capacity of the bounded queue feeding working tree inserts
    pub insert_queue_capacity: usize,
    pub read_only: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            backend: Backend::Sled,
            user_name: None,
            user_email: None,
            sync_writes: true,
            put_all_batch_size: crate::storage::DEFAULT_PUT_ALL_BATCH_SIZE,
            object_cache_size: 10_000,
            insert_queue_capacity: 1_000,
            read_only: false,
        }
    }
}

impl RepositoryConfig {
    /// Fresh configuration with a new repository uuid
    pub fn generate() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self.user_email = Some(email.into());
        self
    }

    /// Load from a repository directory, falling back to defaults when no
    /// config file exists
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save atomically into a repository directory
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// Identity for a new commit at `platform`'s current time
    pub fn person(&self, platform: &dyn Platform) -> Result<RevPerson> {
        if self.user_name.is_none() && self.user_email.is_none() {
            return Err(Error::IllegalState(
                "no commit identity configured; set user_name and user_email".to_string(),
            ));
        }
        let now = platform.current_time_millis();
        Ok(RevPerson::new(
            self.user_name.clone(),
            self.user_email.clone(),
            now,
            platform.timezone_offset(now),
        ))
    }
}

/// Clock and timezone source
pub trait Platform: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn current_time_millis(&self) -> i64;

    /// Local offset from UTC at `millis`, in milliseconds
    fn timezone_offset(&self, millis: i64) -> i32;
}

/// System clock in the local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPlatform;

impl Platform for DefaultPlatform {
    fn current_time_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn timezone_offset(&self, millis: i64) -> i32 {
        Local
            .timestamp_millis_opt(millis)
            .single()
            .map(|dt| dt.offset().local_minus_utc() * 1000)
            .unwrap_or(0)
    }
}

/// Deterministic clock advancing by a fixed step on every read
#[derive(Debug)]
pub struct TestPlatform {
    now: AtomicI64,
    step: i64,
    tz_offset: i32,
}

impl TestPlatform {
    pub fn new(start_millis: i64, step: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
            step,
            tz_offset: 0,
        }
    }

    pub fn with_tz_offset(mut self, tz_offset: i32) -> Self {
        self.tz_offset = tz_offset;
        self
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new(1_000_000_000_000, 1_000)
    }
}

impl Platform for TestPlatform {
    fn current_time_millis(&self) -> i64 {
        self.now.fetch_add(self.step, Ordering::SeqCst)
    }

    fn timezone_offset(&self, _millis: i64) -> i32 {
        self.tz_offset
    }
}
