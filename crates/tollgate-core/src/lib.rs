//! Tollgate core: threshold-authorized admin requests for a fee-charging
//! trading protocol.
//!
//! Percentages are encoded onto the on-ledger fixed-point grid, privileged
//! calls are gated by single-use action tickets, and every request is
//! authorized by a weighted multisig before it reaches the ledger.

#![deny(unsafe_code)]

pub mod aggregator;
pub mod error;
pub mod fee;
pub mod ledger;
pub mod multisig;
pub mod request;
pub mod ticket;

pub use aggregator::{
    locate_fee_bags, reconcile, reconcile_from_ledger, AssetBalanceEntry, DeferredAsset, FeeBag,
    FeeBagLocations, PlannedWithdrawal, ReconciliationBuilder, WithdrawalPlan,
};
pub use error::{AuthorizationError, ExternalError, TicketError, TollgateError, ValidationError};
pub use fee::{
    build_pool_fee_config, decode_rate, encode_rate, encode_rate_decimal, FeeRate, PoolFeeConfig,
    PoolFeeField, PoolFeeParams, FEE_PRECISION_MULTIPLE, FEE_SCALE, PRECISION_MAX,
};
pub use ledger::{
    AssetMetadata, AssetType, BalancePage, CreatedObject, ExecutionStatus, ExternalCallPolicy,
    LedgerClient, ObjectId, ObjectSnapshot, RawBalance, Receipt, SignerAgent,
};
pub use multisig::{
    aggregate, collect_signature, derive_address, Address, AggregatedAuthorization,
    CollectionState, MultisigConfig, MultisigConfigSpec, PartialSignature, PublicKey,
    SignatureCollector, Signer, MAX_SIGNERS, MULTISIG_SCHEME_FLAG,
};
pub use request::{
    AdminCall, ProtocolObjects, RequestAssembler, RequestBuilder, RequestBundle, UnsettledOrder,
};
pub use ticket::{
    assert_no_duplicate_tickets, issue_ticket, issue_tickets, load_tickets, match_tickets,
    parse_ticket_ids, tickets_from_receipt, ActionTicket, ActionType, CapabilityCredential,
    TicketId, TicketMatch, TicketRequest, TicketState, UnmatchedAction,
};
