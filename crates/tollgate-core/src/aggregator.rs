//! Fee bag reconciliation.
//!
//! A fee bag holds one balance per asset type. Reconciliation walks the
//! non-zero balances in enumeration order and pairs each with the ticket at
//! the same position, producing a [`WithdrawalPlan`] of assets withdrawn now
//! and assets deferred for lack of a usable ticket.

use crate::error::{ExternalError, TicketError, TollgateError, ValidationError};
use crate::ledger::{AssetMetadata, AssetType, ExternalCallPolicy, LedgerClient, ObjectId};
use crate::ticket::{assert_no_duplicate_tickets, ActionTicket, ActionType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// One asset's balance inside a fee bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalanceEntry {
    pub asset_type: AssetType,
    pub raw_amount: u64,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl AssetBalanceEntry {
    pub fn new(asset_type: AssetType, raw_amount: u64, decimals: u8) -> Self {
        Self {
            asset_type,
            raw_amount,
            decimals,
            symbol: None,
        }
    }

    pub fn with_metadata(asset_type: AssetType, raw_amount: u64, metadata: &AssetMetadata) -> Self {
        Self {
            asset_type,
            raw_amount,
            decimals: metadata.decimals,
            symbol: Some(metadata.symbol.clone()),
        }
    }

    /// `raw_amount / 10^decimals` as an exact decimal string. Display only.
    pub fn display_amount(&self) -> String {
        let digits = self.raw_amount.to_string();
        let scale = self.decimals as usize;
        if scale == 0 {
            return digits;
        }

        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (whole, fraction) = padded.split_at(padded.len() - scale);
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            whole.to_string()
        } else {
            format!("{whole}.{fraction}")
        }
    }

    /// Symbol when known, otherwise the full asset type.
    pub fn label(&self) -> &str {
        self.symbol.as_deref().unwrap_or_else(|| self.asset_type.as_str())
    }
}

impl fmt::Display for AssetBalanceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.display_amount(), self.label())
    }
}

/// The two fee bags held by the treasury.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeBag {
    ProtocolFees,
    CoverageFees,
}

impl FeeBag {
    /// Treasury field holding the bag.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::ProtocolFees => "protocol_fees",
            Self::CoverageFees => "deep_reserves_coverage_fees",
        }
    }

    /// Ticket type required to withdraw from this bag.
    pub fn action(self) -> ActionType {
        match self {
            Self::ProtocolFees => ActionType::WithdrawProtocolFee,
            Self::CoverageFees => ActionType::WithdrawCoverageFee,
        }
    }
}

impl FromStr for FeeBag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "protocol" | "protocol_fees" => Ok(Self::ProtocolFees),
            "coverage" | "coverage_fees" | "deep_reserves_coverage_fees" => Ok(Self::CoverageFees),
            other => Err(ValidationError::Encoding(format!("unknown fee bag '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBagLocations {
    pub protocol_fees: ObjectId,
    pub coverage_fees: ObjectId,
}

impl FeeBagLocations {
    pub fn get(&self, bag: FeeBag) -> &ObjectId {
        match bag {
            FeeBag::ProtocolFees => &self.protocol_fees,
            FeeBag::CoverageFees => &self.coverage_fees,
        }
    }
}

/// Read the treasury and extract both fee bag ids.
pub async fn locate_fee_bags(
    ledger: &dyn LedgerClient,
    treasury: &ObjectId,
    policy: &ExternalCallPolicy,
) -> Result<FeeBagLocations, TollgateError> {
    let snapshot = policy
        .read("read_object", || ledger.read_object(treasury))
        .await?
        .ok_or_else(|| ExternalError::NotFound(treasury.clone()))?;

    let bag_id = |bag: FeeBag| -> Result<ObjectId, TollgateError> {
        let pointer = format!("/{}/fields/id/id", bag.field_name());
        let raw = snapshot
            .fields
            .pointer(&pointer)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExternalError::ledger(
                    "read_object",
                    format!("treasury {treasury} has no {} bag", bag.field_name()),
                )
            })?;
        Ok(ObjectId::parse(raw)?)
    };

    Ok(FeeBagLocations {
        protocol_fees: bag_id(FeeBag::ProtocolFees)?,
        coverage_fees: bag_id(FeeBag::CoverageFees)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWithdrawal {
    pub entry: AssetBalanceEntry,
    pub ticket: ActionTicket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredAsset {
    pub entry: AssetBalanceEntry,
    pub reason: TicketError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalPlan {
    pub action: ActionType,
    pub withdrawals: Vec<PlannedWithdrawal>,
    pub deferred: Vec<DeferredAsset>,
    /// Tickets left over once every non-zero asset was planned.
    pub unused_tickets: Vec<ActionTicket>,
}

impl WithdrawalPlan {
    pub fn is_empty(&self) -> bool {
        self.withdrawals.is_empty() && self.deferred.is_empty()
    }

    pub fn withdrawn_assets(&self) -> Vec<&AssetType> {
        self.withdrawals.iter().map(|w| &w.entry.asset_type).collect()
    }

    pub fn deferred_assets(&self) -> Vec<&AssetType> {
        self.deferred.iter().map(|d| &d.entry.asset_type).collect()
    }
}

/// Incremental reconciliation over a stream of balances.
#[derive(Debug)]
pub struct ReconciliationBuilder {
    action: ActionType,
    tickets: Vec<ActionTicket>,
    position: usize,
    withdrawals: Vec<PlannedWithdrawal>,
    deferred: Vec<DeferredAsset>,
    skipped_zero: usize,
    seen_assets: HashSet<AssetType>,
}

impl ReconciliationBuilder {
    pub fn new(action: ActionType, tickets: Vec<ActionTicket>) -> Result<Self, TicketError> {
        assert_no_duplicate_tickets(tickets.iter().map(|t| &t.id))?;
        Ok(Self {
            action,
            tickets,
            position: 0,
            withdrawals: Vec::new(),
            deferred: Vec::new(),
            skipped_zero: 0,
            seen_assets: HashSet::new(),
        })
    }

    /// Add the next balance in enumeration order.
    ///
    /// A bag holds one balance per asset type, so a repeated asset type is
    /// rejected rather than planned twice.
    pub fn push(&mut self, entry: AssetBalanceEntry) -> Result<(), TicketError> {
        if !self.seen_assets.insert(entry.asset_type.clone()) {
            warn!(asset = %entry.asset_type, "asset type enumerated twice in one fee bag");
            return Err(TicketError::DuplicateAsset {
                asset: entry.asset_type,
            });
        }
        if entry.raw_amount == 0 {
            self.skipped_zero += 1;
            return Ok(());
        }

        let position = self.position;
        self.position += 1;

        let reason = match self.tickets.get(position) {
            None => TicketError::Insufficient {
                available: self.tickets.len(),
                required: position + 1,
            },
            Some(ticket) if ticket.action != self.action => {
                warn!(
                    asset = %entry.asset_type,
                    ticket = %ticket.id,
                    expected = %self.action,
                    actual = %ticket.action,
                    "ticket type does not match fee bag, deferring asset"
                );
                TicketError::TypeMismatch {
                    ticket: ticket.id.clone(),
                    expected: self.action,
                    actual: ticket.action,
                }
            }
            Some(ticket) if !ticket.is_usable() => ticket.not_usable(),
            Some(ticket) => {
                debug!(asset = %entry.asset_type, amount = %entry.display_amount(), ticket = %ticket.id, "withdrawal planned");
                self.withdrawals.push(PlannedWithdrawal {
                    entry,
                    ticket: ticket.clone(),
                });
                return Ok(());
            }
        };

        self.deferred.push(DeferredAsset { entry, reason });
        Ok(())
    }

    pub fn finish(self) -> WithdrawalPlan {
        let required = self.position;
        let unused_tickets = self.tickets.into_iter().skip(required).collect::<Vec<_>>();

        let plan = WithdrawalPlan {
            action: self.action,
            withdrawals: self.withdrawals,
            deferred: self.deferred,
            unused_tickets,
        };

        if plan.is_empty() {
            info!(action = %plan.action, skipped_zero = self.skipped_zero, "fee bag is empty, nothing to withdraw");
            return plan;
        }

        if !plan.deferred.is_empty() {
            let withdrawn = plan
                .withdrawals
                .iter()
                .map(|w| w.entry.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let remaining = plan
                .deferred
                .iter()
                .map(|d| d.entry.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            warn!(
                action = %plan.action,
                withdrawn_count = plan.withdrawals.len(),
                deferred_count = plan.deferred.len(),
                withdrawn = %withdrawn,
                remaining = %remaining,
                "not every asset has a usable ticket, remaining assets stay in the bag"
            );
        }

        info!(
            action = %plan.action,
            withdrawals = plan.withdrawals.len(),
            deferred = plan.deferred.len(),
            unused_tickets = plan.unused_tickets.len(),
            "withdrawal plan built"
        );
        plan
    }
}

/// Reconcile an in-memory balance list against available tickets.
pub fn reconcile(
    action: ActionType,
    balances: impl IntoIterator<Item = AssetBalanceEntry>,
    tickets: Vec<ActionTicket>,
) -> Result<WithdrawalPlan, TicketError> {
    let mut builder = ReconciliationBuilder::new(action, tickets)?;
    for entry in balances {
        builder.push(entry)?;
    }
    Ok(builder.finish())
}

/// Stream a fee bag's balances page by page and reconcile as they arrive.
///
/// Metadata is only fetched for non-zero balances and cached per asset type.
pub async fn reconcile_from_ledger(
    ledger: &dyn LedgerClient,
    bag: &ObjectId,
    action: ActionType,
    tickets: Vec<ActionTicket>,
    policy: &ExternalCallPolicy,
) -> Result<WithdrawalPlan, TollgateError> {
    let mut builder = ReconciliationBuilder::new(action, tickets)?;
    let mut metadata: HashMap<AssetType, AssetMetadata> = HashMap::new();
    let mut cursor: Option<String> = None;
    let mut page_count = 0_usize;

    loop {
        let page = policy
            .read("read_balances", || {
                ledger.read_balances(bag, None, cursor.as_deref())
            })
            .await?;
        page_count += 1;
        debug!(bag = %bag.short(), page = page_count, entries = page.entries.len(), "balance page read");

        for balance in page.entries {
            if balance.raw_amount == 0 {
                builder.push(AssetBalanceEntry::new(balance.asset_type, 0, 0))?;
                continue;
            }
            if !metadata.contains_key(&balance.asset_type) {
                let fetched = policy
                    .read("read_asset_metadata", || {
                        ledger.read_asset_metadata(&balance.asset_type)
                    })
                    .await?;
                metadata.insert(balance.asset_type.clone(), fetched);
            }
            let entry = match metadata.get(&balance.asset_type) {
                Some(meta) => AssetBalanceEntry::with_metadata(balance.asset_type, balance.raw_amount, meta),
                None => continue,
            };
            builder.push(entry)?;
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(builder.finish())
}
