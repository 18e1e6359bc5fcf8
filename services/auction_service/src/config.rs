//! Configuration management for the auction coordination service.
//!
//! Runtime behaviour is tuned through a hierarchical, multi-source
//! configuration backed by the `config` crate.
//!
//! Priority (lowest → highest):
//! 1. Compile-time defaults (`impl Default`).
//! 2. An optional TOML/YAML/JSON file passed at start-up (or
//!    `auctiond.{toml,yaml,json}` in the working directory).
//! 3. Environment variables with the `STAGEGATE` prefix:
//!
//! ```text
//! STAGEGATE__LEDGER__ENDPOINT=http://indexer:8645
//! STAGEGATE__AUCTION__SOFT_CLOSE_WINDOW=5m
//! ```
//!
//! The final, frozen [`AppConfig`] is published as a global singleton
//! through [`get()`]; [`init`] may only be called once.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Duration as ChronoDuration;
use config::{Config, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleRules;
use crate::reconcile::ReconcileOptions;

static APP_CONFIG: OnceCell<Arc<AppConfig>> = OnceCell::new();

pub type ConfigHandle = Arc<AppConfig>;

/// Initialise the configuration singleton. See the module docs for source
/// precedence.
pub fn init(config_path: Option<impl AsRef<Path>>) -> Result<ConfigHandle, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path.as_ref()).required(true));
    } else {
        for ext in ["toml", "yaml", "json"] {
            let file_name = format!("auctiond.{ext}");
            if Path::new(&file_name).exists() {
                builder = builder.add_source(File::with_name(&file_name).required(false));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("STAGEGATE")
            .separator("__")
            .try_parsing(true),
    );

    let mut config: AppConfig = builder.build()?.try_deserialize()?;
    config.apply_fallbacks();
    config
        .validate()
        .map_err(ConfigError::Message)?;

    let arc = Arc::new(config);
    APP_CONFIG
        .set(arc.clone())
        .map_err(|_| ConfigError::Message("configuration already initialised".into()))?;

    Ok(arc)
}

/// Obtain the frozen [`AppConfig`]. Panics if [`init`] has not run.
#[inline(always)]
pub fn get() -> &'static AppConfig {
    APP_CONFIG
        .get()
        .expect("configuration accessed before initialisation")
}

/// Top-level configuration. New service-specific settings get their own
/// sub-struct instead of loose optional fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub ledger: LedgerConfig,
    pub auction: AuctionConfig,
    pub api: ApiConfig,
    pub journal: JournalConfig,
}

impl AppConfig {
    /// Validate internal consistency. Prefer an error over silently fixing
    /// values at runtime.
    fn validate(&self) -> Result<(), String> {
        if self.ledger.endpoint.is_empty() {
            return Err("ledger.endpoint must not be empty".into());
        }
        if self.ledger.poll_interval < Duration::from_millis(100) {
            return Err("ledger.poll_interval is unrealistically low".into());
        }
        if self.ledger.dedup_horizon_blocks == 0 {
            return Err("ledger.dedup_horizon_blocks must be > 0".into());
        }
        if self.auction.extension_increment.is_zero() {
            return Err("auction.extension_increment must be > 0".into());
        }
        Ok(())
    }

    /// Fill in fallback values that require runtime computation.
    fn apply_fallbacks(&mut self) {
        if self.service.instance_id.is_empty() {
            let id: [u8; 6] = rand::random();
            self.service.instance_id = hex::encode(id);
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            poll_interval: self.ledger.poll_interval,
            poll_timeout: self.ledger.poll_timeout,
            backoff_floor: self.ledger.backoff_floor,
            backoff_ceiling: self.ledger.backoff_ceiling,
        }
    }

    pub fn lifecycle_rules(&self) -> LifecycleRules {
        LifecycleRules {
            soft_close_window: ChronoDuration::seconds(
                self.auction.soft_close_window.as_secs() as i64
            ),
            extension_increment: ChronoDuration::seconds(
                self.auction.extension_increment.as_secs() as i64,
            ),
            max_extension_count: self.auction.max_extension_count,
        }
    }
}

/// Metadata & housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical service name, appears in logs.
    pub name: String,
    /// Unique instance identifier, auto-generated unless provided.
    pub instance_id: String,
    /// Graceful shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "stagegate-auctiond".into(),
            instance_id: String::new(),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Ledger feed and wallet relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Indexer/relay root URL.
    pub endpoint: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_floor: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_ceiling: Duration,
    /// Deadline for handing a transaction request to the wallet layer.
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
    /// How long an accepted bid may wait for its confirming event before
    /// the in-flight slot degrades to unresolved.
    #[serde(with = "humantime_serde")]
    pub confirm_timeout: Duration,
    /// Applied-event dedup window, in blocks; must exceed the chain's
    /// plausible reorg depth.
    pub dedup_horizon_blocks: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8645".into(),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(30),
            confirm_timeout: Duration::from_secs(120),
            dedup_horizon_blocks: 1_024,
        }
    }
}

/// Anti-snipe rules shared by every tracked auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    #[serde(with = "humantime_serde")]
    pub soft_close_window: Duration,
    #[serde(with = "humantime_serde")]
    pub extension_increment: Duration,
    pub max_extension_count: u32,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            soft_close_window: Duration::from_secs(300),
            extension_increment: Duration::from_secs(300),
            max_extension_count: 3,
        }
    }
}

/// HTTP façade bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    #[serde(with = "serde_ipaddr")]
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

/// Durable-cursor storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("auctiond-journal"),
        }
    }
}

mod serde_ipaddr {
    use std::net::IpAddr;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &IpAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<IpAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(D::Error::custom)
    }
}
