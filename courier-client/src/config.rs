use courier_core::{DeliveryError, DeliveryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Timing knobs of the delivery state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Window, measured from the first attempt, after which a pending message fails.
    pub deadline_ms: u64,
    /// A send with no ack after this long counts as a failed attempt.
    pub attempt_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl DeliveryPolicy {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> DeliveryResult<()> {
        if self.deadline_ms == 0 {
            return Err(DeliveryError::Config("deadline must be positive".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(DeliveryError::Config("attempt timeout must be positive".into()));
        }
        if self.backoff_initial_ms == 0 || self.backoff_max_ms < self.backoff_initial_ms {
            return Err(DeliveryError::Config(format!(
                "invalid backoff range {}ms..{}ms",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            deadline_ms: 30_000,
            attempt_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 8_000,
        }
    }
}

/// Object-storage settings for attachment uploads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: String,
    pub bucket: String,
    /// Base of the URLs handed out for uploaded objects.
    pub public_base_url: String,
    pub max_attachment_bytes: u64,
    pub chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "chat-attachments".to_string(),
            public_base_url: "http://localhost:9000/chat-attachments".to_string(),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub database_url: String,
    pub server_url: String,
    pub user_id: String,
    pub api_key: String,
    pub api_secret: String,
    /// Reachability endpoint polled by the connectivity monitor, if any.
    pub reachability_url: Option<String>,
    pub reachability_interval_ms: u64,
    pub policy: DeliveryPolicy,
    pub upload: UploadConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:courier.db?mode=rwc".to_string(),
            server_url: "ws://localhost:8080/ws".to_string(),
            user_id: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            reachability_url: None,
            reachability_interval_ms: 15_000,
            policy: DeliveryPolicy::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reads `COURIER_*` variables, falling back to the defaults.
    pub fn from_env() -> DeliveryResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> DeliveryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let millis = |name: &str, default: u64| -> DeliveryResult<u64> {
            match lookup(name) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| DeliveryError::Config(format!("{} is not a number: {}", name, raw))),
                None => Ok(default),
            }
        };

        let policy = DeliveryPolicy {
            deadline_ms: millis("COURIER_DEADLINE_MS", defaults.policy.deadline_ms)?,
            attempt_timeout_ms: millis("COURIER_ATTEMPT_TIMEOUT_MS", defaults.policy.attempt_timeout_ms)?,
            backoff_initial_ms: millis("COURIER_BACKOFF_INITIAL_MS", defaults.policy.backoff_initial_ms)?,
            backoff_max_ms: millis("COURIER_BACKOFF_MAX_MS", defaults.policy.backoff_max_ms)?,
        };
        policy.validate()?;

        let upload = UploadConfig {
            endpoint: lookup("COURIER_UPLOAD_ENDPOINT").unwrap_or(defaults.upload.endpoint),
            bucket: lookup("COURIER_UPLOAD_BUCKET").unwrap_or(defaults.upload.bucket),
            public_base_url: lookup("COURIER_UPLOAD_PUBLIC_URL").unwrap_or(defaults.upload.public_base_url),
            max_attachment_bytes: millis("COURIER_MAX_ATTACHMENT_BYTES", defaults.upload.max_attachment_bytes)?,
            chunk_size: defaults.upload.chunk_size,
        };

        Ok(Self {
            database_url: lookup("COURIER_DATABASE_URL").unwrap_or(defaults.database_url),
            server_url: lookup("COURIER_SERVER_URL").unwrap_or(defaults.server_url),
            user_id: lookup("COURIER_USER_ID").unwrap_or(defaults.user_id),
            api_key: lookup("COURIER_API_KEY").unwrap_or(defaults.api_key),
            api_secret: lookup("COURIER_API_SECRET").unwrap_or(defaults.api_secret),
            reachability_url: lookup("COURIER_REACHABILITY_URL").or(defaults.reachability_url),
            reachability_interval_ms: millis("COURIER_REACHABILITY_INTERVAL_MS", defaults.reachability_interval_ms)?,
            policy,
            upload,
        })
    }
}
