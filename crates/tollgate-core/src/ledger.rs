use crate::error::{ExternalError, ValidationError};
use crate::multisig::{AggregatedAuthorization, PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const OBJECT_ID_HEX_LEN: usize = 64;

/// 32-byte ledger object identity, rendered as `0x` + 64 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse a `0x`-prefixed hex id. Short forms are left-padded with zeros.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ValidationError::InvalidObjectId(input.to_string()))?;

        if digits.is_empty()
            || digits.len() > OBJECT_ID_HEX_LEN
            || !digits.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ValidationError::InvalidObjectId(input.to_string()));
        }

        Ok(Self(format!(
            "0x{:0>width$}",
            digits.to_ascii_lowercase(),
            width = OBJECT_ID_HEX_LEN
        )))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// Fully qualified coin/asset type tag, e.g. `0x2::sui::SUI`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetType(String);

impl AssetType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time read of a ledger object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub type_tag: String,
    pub version: u64,
    #[serde(default)]
    pub fields: Value,
}

/// Symbol and decimal count of an asset type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBalance {
    pub asset_type: AssetType,
    pub raw_amount: u64,
}

/// One page of a balance listing. `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BalancePage {
    pub entries: Vec<RawBalance>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedObject {
    pub id: ObjectId,
    pub type_tag: String,
}

/// Execution receipt returned by the ledger for a submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub digest: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub created: Vec<CreatedObject>,
    #[serde(default)]
    pub consumed: Vec<ObjectId>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success)
    }
}

/// Narrow view of the external ledger.
///
/// `submit` returns `Ok` whenever the ledger produced a receipt, including
/// receipts whose status is a failure; `Err` is reserved for transport-level
/// problems where no receipt exists.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit(
        &self,
        payload: &[u8],
        authorization: &AggregatedAuthorization,
    ) -> Result<Receipt, ExternalError>;

    async fn read_object(&self, id: &ObjectId) -> Result<Option<ObjectSnapshot>, ExternalError>;

    async fn read_balances(
        &self,
        owner: &ObjectId,
        filter: Option<&AssetType>,
        cursor: Option<&str>,
    ) -> Result<BalancePage, ExternalError>;

    async fn read_asset_metadata(&self, asset: &AssetType) -> Result<AssetMetadata, ExternalError>;
}

/// Produces a signature for one signer over exact payload bytes.
///
/// Agents may be local keys, hardware devices or an operator running a
/// separate signing step.
#[async_trait]
pub trait SignerAgent: Send + Sync {
    async fn sign(&self, payload: &[u8], signer: &PublicKey) -> Result<Vec<u8>, ExternalError>;
}

/// Timeout and retry envelope around collaborator calls.
///
/// Reads are idempotent and retried up to `read_attempts`. Submissions go
/// through [`ExternalCallPolicy::bounded`] only and are never repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalCallPolicy {
    pub timeout: Option<Duration>,
    pub read_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ExternalCallPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            read_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl ExternalCallPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run one call under the configured timeout.
    pub async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, ExternalError>
    where
        F: Future<Output = Result<T, ExternalError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ExternalError::Timeout {
                    operation: operation.to_string(),
                    millis: limit.as_millis(),
                })?,
            None => call.await,
        }
    }

    /// Run an idempotent read, retrying transient failures.
    pub async fn read<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ExternalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let attempts = self.read_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.bounded(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    warn!(
                        operation,
                        attempt,
                        attempts,
                        error = %err,
                        "ledger read failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &ExternalError) -> bool {
    matches!(
        err,
        ExternalError::Ledger { .. } | ExternalError::Timeout { .. }
    )
}
