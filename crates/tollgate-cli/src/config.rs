//! Layered operator configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tollgate_core::{
    build_pool_fee_config, ExternalCallPolicy, MultisigConfig, ObjectId, PoolFeeConfig,
    PoolFeeParams, ProtocolObjects, PublicKey, Signer, TollgateError, ValidationError,
};

/// Main tollgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Protocol object ids
    #[serde(default)]
    pub objects: Option<ProtocolObjects>,

    /// Multisig authority
    #[serde(default)]
    pub multisig: Option<MultisigSection>,

    #[serde(default)]
    pub fees: FeesConfig,

    /// Timeouts and retries for ledger and signer calls
    #[serde(default)]
    pub calls: CallsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerEntry {
    /// Hex, or base64 with the scheme flag
    pub public_key: String,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigSection {
    pub signers: Vec<SignerEntry>,
    pub threshold: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeesConfig {
    /// Default pool fees, in percent
    #[serde(default)]
    pub default: Option<PoolFeeParams>,

    /// Pool-specific overrides
    #[serde(default)]
    pub pools: Vec<PoolFeeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFeeEntry {
    pub pool: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub rates: PoolFeeParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Per-call timeout; unset waits indefinitely
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            read_attempts: default_read_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_read_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Defaults, then the TOML file at `path`, then `TOLLGATE_` environment
    /// variables (`__` separates nesting, e.g. `TOLLGATE_CALLS__READ_ATTEMPTS`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&TollgateConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn protocol_objects(&self) -> Result<&ProtocolObjects, ValidationError> {
        self.objects
            .as_ref()
            .ok_or_else(|| ValidationError::InvalidObjectId("[objects] section is missing".into()))
    }

    pub fn multisig_config(&self) -> Result<MultisigConfig, ValidationError> {
        let section = self.multisig.as_ref().ok_or(ValidationError::EmptySignerSet)?;
        let signers = section
            .signers
            .iter()
            .map(|entry| Ok(Signer::new(PublicKey::parse(&entry.public_key)?, entry.weight)))
            .collect::<Result<Vec<_>, ValidationError>>()?;
        MultisigConfig::new(signers, section.threshold)
    }

    pub fn call_policy(&self) -> ExternalCallPolicy {
        ExternalCallPolicy {
            timeout: self.calls.timeout_secs.map(Duration::from_secs),
            read_attempts: self.calls.read_attempts,
            retry_backoff: Duration::from_millis(self.calls.retry_backoff_ms),
        }
    }
}

impl PoolFeeEntry {
    pub fn pool_id(&self) -> Result<ObjectId, ValidationError> {
        ObjectId::parse(&self.pool)
    }

    pub fn encode(&self) -> Result<PoolFeeConfig, TollgateError> {
        self.pool_id()?;
        Ok(build_pool_fee_config(&self.rates)?)
    }
}
