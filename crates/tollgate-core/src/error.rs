use crate::fee::PoolFeeField;
use crate::ledger::{AssetType, ObjectId};
use crate::ticket::{ActionType, TicketId};
use thiserror::Error;

/// Top-level error for every tollgate operation.
#[derive(Debug, Error)]
pub enum TollgateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error(transparent)]
    External(#[from] ExternalError),
}

/// Bad input shape or range. Local to one request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("percentage {percent}% is not a finite number")]
    NonFinitePercent { percent: f64 },

    #[error("malformed percentage '{input}': {reason}")]
    MalformedPercent { input: String, reason: String },

    #[error(
        "invalid precision for {percent}%: raw value {raw} is not a multiple of {granularity} (0.0001%)"
    )]
    Precision {
        percent: String,
        raw: i128,
        granularity: u64,
    },

    #[error("percentage {percent}% is out of bounds (raw {raw}, allowed 0..={max})")]
    Range { percent: String, raw: i128, max: u64 },

    #[error("pool fee config rejected: {}", describe_field_failures(.failures))]
    PoolFeeConfig {
        failures: Vec<(PoolFeeField, Box<ValidationError>)>,
    },

    #[error("multisig config must contain at least one signer")]
    EmptySignerSet,

    #[error("multisig config has {count} signers, maximum is {max}")]
    TooManySigners { count: usize, max: usize },

    #[error("signer #{index} has weight 0, weights must be at least 1")]
    ZeroWeight { index: usize },

    #[error("multisig threshold must be at least 1")]
    ZeroThreshold,

    #[error("threshold {threshold} exceeds total signer weight {total_weight}")]
    UnreachableThreshold { threshold: u16, total_weight: u32 },

    #[error("public key {public_key} appears more than once in the signer set")]
    DuplicatePublicKey { public_key: String },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid object id '{0}'")]
    InvalidObjectId(String),

    #[error("unknown action type '{0}'")]
    UnknownActionType(String),

    #[error("malformed encoding: {0}")]
    Encoding(String),

    #[error("request bundle contains no calls")]
    EmptyRequest,
}

fn describe_field_failures(failures: &[(PoolFeeField, Box<ValidationError>)]) -> String {
    failures
        .iter()
        .map(|(field, err)| format!("{field}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Signature or quorum failures. Blocks submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("signature from {signer} does not verify against the request payload")]
    SignatureMismatch { signer: String },

    #[error("insufficient signer weight: {}", describe_shortfall(.accumulated, .required, .missing))]
    InsufficientWeight {
        accumulated: u32,
        required: u32,
        missing: Vec<String>,
    },

    #[error("signer {signer} supplied more than one signature")]
    DuplicateSigner { signer: String },

    #[error("{signer} is not a member of multisig {address}")]
    UnknownSigner { signer: String, address: String },

    #[error("authorization artifact is malformed: {0}")]
    MalformedArtifact(String),
}

impl AuthorizationError {
    /// Weight still needed to reach the threshold, zero for other variants.
    pub fn shortfall(&self) -> u32 {
        match self {
            Self::InsufficientWeight {
                accumulated,
                required,
                ..
            } => required.saturating_sub(*accumulated),
            _ => 0,
        }
    }
}

fn describe_shortfall(accumulated: &u32, required: &u32, missing: &[String]) -> String {
    format!(
        "accumulated {accumulated}, required {required} (short by {}), missing signers: [{}]",
        required.saturating_sub(*accumulated),
        missing.join(", ")
    )
}

/// Ticket selection failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error("ticket {ticket} has type {actual}, operation requires {expected}")]
    TypeMismatch {
        ticket: TicketId,
        expected: ActionType,
        actual: ActionType,
    },

    #[error("duplicate ticket ids in one batch: {}", join_ids(.tickets))]
    Duplicate { tickets: Vec<TicketId> },

    #[error("asset {asset} appears more than once in one fee bag")]
    DuplicateAsset { asset: AssetType },

    #[error("not enough tickets: found {available}, need at least {required}")]
    Insufficient { available: usize, required: usize },

    #[error("ticket {ticket} cannot authorize anything: {state}")]
    NotUsable { ticket: TicketId, state: String },

    #[error("ticket object {0} does not decode as an action ticket: {1}")]
    Malformed(ObjectId, String),
}

fn join_ids(ids: &[TicketId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collaborator failures, surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("ledger {operation} failed: {message}")]
    Ledger { operation: String, message: String },

    #[error("submission {digest} failed on ledger: {message}")]
    SubmissionFailed { digest: String, message: String },

    #[error("object {0} not found")]
    NotFound(ObjectId),

    #[error("signer agent for {signer} failed: {message}")]
    Signer { signer: String, message: String },

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u128 },
}

impl ExternalError {
    pub fn ledger(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ledger {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
