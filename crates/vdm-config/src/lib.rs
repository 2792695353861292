//! `vdm.toml`: where caches live, how pages are fetched, and how to reach each VistA.

mod error;
mod logging;

pub use error::ConfigError;
pub use logging::{init_tracing, LoggingConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vdm_cache::{
    BrokerConnector, BrokerCredentials, CacherConfig, CipherPad, ConnectionPool,
    CorruptEntryPolicy, FmqlCacher, FmqlInterface, PageRounding, DEFAULT_CONTEXT, DEFAULT_CSTOP,
    DEFAULT_DESCRIBE_LIMIT, DEFAULT_POOL_SIZE, DEFAULT_SELECT_LIMIT,
};

/// File name looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "vdm.toml";
/// Overrides `caches_root`.
pub const CACHE_DIR_ENV: &str = "VDM_CACHE_DIR";

/// Upper bound for `request_timeout_secs` and `checkout_timeout_secs`: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VdmConfig {
    #[serde(default = "VdmConfig::default_caches_root")]
    pub caches_root: PathBuf,

    /// Fetch workers per fill; also the number of broker sessions per VistA.
    #[serde(default = "VdmConfig::default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "VdmConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "VdmConfig::default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,

    /// Retries of a failed page fetch before the fill gives up.
    #[serde(default = "VdmConfig::default_fetch_retries")]
    pub fetch_retries: u32,

    /// First retry delay; doubles on each further retry.
    #[serde(default = "VdmConfig::default_retry_backoff_millis")]
    pub retry_backoff_millis: u64,

    #[serde(default)]
    pub page_rounding: PageRounding,

    #[serde(default)]
    pub corrupt_entries: CorruptEntryPolicy,

    /// Schema listings skip files numbered below this.
    #[serde(default = "VdmConfig::default_min_file_id")]
    pub min_file_id: f64,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backends by VistA label. A label without an entry is served from its cache only.
    #[serde(default)]
    pub vistas: BTreeMap<String, VistaTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_describe")]
    pub describe: u64,
    #[serde(default = "LimitsConfig::default_select")]
    pub select: u64,
    #[serde(default = "LimitsConfig::default_cstop")]
    pub cstop: u64,
}

impl LimitsConfig {
    fn default_describe() -> u64 {
        DEFAULT_DESCRIBE_LIMIT
    }

    fn default_select() -> u64 {
        DEFAULT_SELECT_LIMIT
    }

    fn default_cstop() -> u64 {
        DEFAULT_CSTOP
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            describe: Self::default_describe(),
            select: Self::default_select(),
            cstop: Self::default_cstop(),
        }
    }
}

/// How to reach one VistA: exactly one of an FMQL endpoint or an RPC broker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VistaTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerConfig>,
}

impl VistaTarget {
    pub fn endpoint(url: impl Into<String>) -> Self {
        Self {
            endpoint: Some(url.into()),
            broker: None,
        }
    }

    pub fn broker(broker: BrokerConfig) -> Self {
        Self {
            endpoint: None,
            broker: Some(broker),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub access: String,
    pub verify: String,
    /// The site's cipher pad, one row per line.
    pub cipher_pad: PathBuf,
    #[serde(default = "BrokerConfig::default_context")]
    pub context: String,
}

impl BrokerConfig {
    fn default_context() -> String {
        DEFAULT_CONTEXT.to_owned()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cipher_pad", &self.cipher_pad)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Default for VdmConfig {
    fn default() -> Self {
        Self {
            caches_root: Self::default_caches_root(),
            pool_size: Self::default_pool_size(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            checkout_timeout_secs: Self::default_checkout_timeout_secs(),
            fetch_retries: Self::default_fetch_retries(),
            retry_backoff_millis: Self::default_retry_backoff_millis(),
            page_rounding: PageRounding::default(),
            corrupt_entries: CorruptEntryPolicy::default(),
            min_file_id: Self::default_min_file_id(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
            vistas: BTreeMap::new(),
        }
    }
}

impl VdmConfig {
    fn default_caches_root() -> PathBuf {
        PathBuf::from("Caches")
    }

    fn default_pool_size() -> usize {
        DEFAULT_POOL_SIZE
    }

    fn default_request_timeout_secs() -> u64 {
        120
    }

    fn default_checkout_timeout_secs() -> u64 {
        60
    }

    fn default_fetch_retries() -> u32 {
        2
    }

    fn default_retry_backoff_millis() -> u64 {
        500
    }

    fn default_min_file_id() -> f64 {
        1.1
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: VdmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// `explicit` if given, else `./vdm.toml` if present, else defaults; then environment
    /// overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load_from_path(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides read through `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            self.caches_root = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".to_owned()));
        }
        for (name, value) in [
            ("limits.describe", self.limits.describe),
            ("limits.select", self.limits.select),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("checkout_timeout_secs", self.checkout_timeout_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 1 and {MAX_TIMEOUT_SECS}, got {value}"
                )));
            }
        }
        if !self.min_file_id.is_finite() || self.min_file_id < 0.0 {
            return Err(ConfigError::Invalid(
                "min_file_id must be a non-negative number".to_owned(),
            ));
        }
        for (label, target) in &self.vistas {
            match (&target.endpoint, &target.broker) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "vista {label:?} sets both endpoint and broker; choose one"
                    )))
                }
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "vista {label:?} has neither an endpoint nor a broker"
                    )))
                }
                (Some(endpoint), None) if endpoint.trim().is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "vista {label:?} has an empty endpoint"
                    )))
                }
                (None, Some(broker)) if broker.host.trim().is_empty() => {
                    return Err(ConfigError::Invalid(format!(
                        "vista {label:?} has an empty broker host"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn target(&self, label: &str) -> Option<&VistaTarget> {
        self.vistas.get(label)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }

    /// The settings of the cacher for `label`.
    pub fn cacher_config(&self, label: &str) -> CacherConfig {
        CacherConfig::new(&self.caches_root, label)
            .with_pool_size(self.pool_size)
            .with_limits(self.limits.describe, self.limits.select)
            .with_default_cstop(self.limits.cstop)
            .with_page_rounding(self.page_rounding)
            .with_corrupt_entries(self.corrupt_entries)
            .with_retries(
                self.fetch_retries,
                Duration::from_millis(self.retry_backoff_millis),
            )
            .with_timeouts(self.request_timeout(), self.checkout_timeout())
    }

    /// A cacher for `label`, online if the label has a target and offline otherwise.
    pub fn open_cacher(&self, label: &str) -> vdm_cache::Result<FmqlCacher> {
        let config = self.cacher_config(label);
        let Some(target) = self.target(label) else {
            tracing::debug!(
                target = "vdm.config",
                vista = label,
                "no backend; serving from cache only"
            );
            return FmqlCacher::offline(config);
        };

        let pool = match &target.broker {
            Some(broker) => {
                let cipher = CipherPad::load(&broker.cipher_pad)?;
                let credentials = BrokerCredentials {
                    access: broker.access.clone(),
                    verify: broker.verify.clone(),
                };
                let connector =
                    BrokerConnector::new(&broker.host, broker.port, credentials, cipher)
                        .with_context(&broker.context)
                        .with_timeout(self.request_timeout());
                Some(Arc::new(ConnectionPool::new(
                    connector,
                    self.pool_size,
                    self.checkout_timeout(),
                )))
            }
            None => None,
        };
        let interface = FmqlInterface::new(target.endpoint.clone(), pool, self.request_timeout())?;
        FmqlCacher::new(config, Arc::new(interface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_debug_hides_credentials() {
        let broker = BrokerConfig {
            host: "10.0.0.1".to_owned(),
            port: 9201,
            access: "ACCESS1".to_owned(),
            verify: "VERIFY1".to_owned(),
            cipher_pad: PathBuf::from("cipher.txt"),
            context: BrokerConfig::default_context(),
        };
        let printed = format!("{broker:?}");
        assert!(printed.contains("10.0.0.1"));
        assert!(!printed.contains("ACCESS1") && !printed.contains("VERIFY1"));
    }
}
