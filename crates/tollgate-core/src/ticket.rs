//! Single-use action tickets.
//!
//! A ticket pre-authorizes exactly one privileged call of one [`ActionType`].
//! The ledger assigns ticket identities; this module only models them, pairs
//! them with the actions a batch needs, and refuses pairings that would
//! consume the wrong ticket.

use crate::error::{ExternalError, TicketError, TollgateError, ValidationError};
use crate::ledger::{
    ExecutionStatus, ExternalCallPolicy, LedgerClient, ObjectId, ObjectSnapshot, Receipt,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Marker in the type tag of every ticket object.
pub const TICKET_TYPE_MARKER: &str = "::ticket::Ticket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionType {
    WithdrawDeepReserves,
    WithdrawProtocolFee,
    WithdrawCoverageFee,
    UpdatePoolCreationProtocolFee,
    UpdateDefaultFees,
    UpdatePoolSpecificFees,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::WithdrawDeepReserves,
        ActionType::WithdrawProtocolFee,
        ActionType::WithdrawCoverageFee,
        ActionType::UpdatePoolCreationProtocolFee,
        ActionType::UpdateDefaultFees,
        ActionType::UpdatePoolSpecificFees,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::WithdrawDeepReserves => "WithdrawDeepReserves",
            Self::WithdrawProtocolFee => "WithdrawProtocolFee",
            Self::WithdrawCoverageFee => "WithdrawCoverageFee",
            Self::UpdatePoolCreationProtocolFee => "UpdatePoolCreationProtocolFee",
            Self::UpdateDefaultFees => "UpdateDefaultFees",
            Self::UpdatePoolSpecificFees => "UpdatePoolSpecificFees",
        }
    }

    pub fn snake_name(self) -> &'static str {
        match self {
            Self::WithdrawDeepReserves => "withdraw_deep_reserves",
            Self::WithdrawProtocolFee => "withdraw_protocol_fee",
            Self::WithdrawCoverageFee => "withdraw_coverage_fee",
            Self::UpdatePoolCreationProtocolFee => "update_pool_creation_protocol_fee",
            Self::UpdateDefaultFees => "update_default_fees",
            Self::UpdatePoolSpecificFees => "update_pool_specific_fees",
        }
    }

    /// Program helper returning the on-chain tag for this ticket type.
    pub fn move_helper(self) -> String {
        format!("{}_ticket_type", self.snake_name())
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|action| action.name() == wanted || action.snake_name() == wanted)
            .ok_or_else(|| ValidationError::UnknownActionType(s.to_string()))
    }
}

/// Ledger identity of a ticket object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(ObjectId);

impl TicketId {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        ObjectId::parse(input).map(Self)
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.0
    }
}

impl From<ObjectId> for TicketId {
    fn from(id: ObjectId) -> Self {
        Self(id)
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a ticket. Dead tickets keep the reason they died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TicketState {
    /// Exists on-ledger, not yet referenced by any request.
    Created,
    /// Referenced by a reserved request awaiting execution. Request builders
    /// refuse it until the request settles or is released.
    Outstanding,
    Consumed { digest: String },
    Expired { at: DateTime<Utc> },
}

impl TicketState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Outstanding)
    }

    fn describe(&self) -> String {
        match self {
            Self::Created => "created".to_string(),
            Self::Outstanding => "outstanding".to_string(),
            Self::Consumed { digest } => format!("consumed by {digest}"),
            Self::Expired { at } => format!("expired at {}", at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTicket {
    pub id: TicketId,
    pub action: ActionType,
    pub created_at: DateTime<Utc>,
    pub state: TicketState,
}

/// On-ledger field layout of a ticket object.
#[derive(Debug, Deserialize)]
struct TicketFields {
    ticket_type: String,
    created_at_ms: i64,
    #[serde(default)]
    state: Option<TicketState>,
}

impl ActionTicket {
    pub fn new(id: TicketId, action: ActionType, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            action,
            created_at,
            state: TicketState::Created,
        }
    }

    pub fn from_snapshot(snapshot: &ObjectSnapshot) -> Result<Self, TicketError> {
        let malformed = |reason: String| TicketError::Malformed(snapshot.id.clone(), reason);

        if !snapshot.type_tag.contains(TICKET_TYPE_MARKER) {
            return Err(malformed(format!("type {} is not a ticket", snapshot.type_tag)));
        }
        let fields: TicketFields =
            serde_json::from_value(snapshot.fields.clone()).map_err(|e| malformed(e.to_string()))?;
        let action = fields
            .ticket_type
            .parse::<ActionType>()
            .map_err(|e| malformed(e.to_string()))?;
        let created_at = DateTime::from_timestamp_millis(fields.created_at_ms)
            .ok_or_else(|| malformed(format!("bad timestamp {}", fields.created_at_ms)))?;

        Ok(Self {
            id: TicketId(snapshot.id.clone()),
            action,
            created_at,
            state: fields.state.unwrap_or(TicketState::Created),
        })
    }

    pub fn is_usable(&self) -> bool {
        self.state.is_live()
    }

    pub(crate) fn not_usable(&self) -> TicketError {
        TicketError::NotUsable {
            ticket: self.id.clone(),
            state: self.state.describe(),
        }
    }

    /// Created → Outstanding.
    pub fn mark_outstanding(&mut self) -> Result<(), TicketError> {
        match self.state {
            TicketState::Created => {
                self.state = TicketState::Outstanding;
                Ok(())
            }
            TicketState::Outstanding => Ok(()),
            _ => Err(self.not_usable()),
        }
    }

    /// Outstanding → Created, after the request holding it failed.
    pub fn release(&mut self) -> Result<(), TicketError> {
        match self.state {
            TicketState::Outstanding => {
                self.state = TicketState::Created;
                Ok(())
            }
            TicketState::Created => Ok(()),
            _ => Err(self.not_usable()),
        }
    }

    pub fn consume(&mut self, digest: impl Into<String>) -> Result<(), TicketError> {
        if !self.is_usable() {
            return Err(self.not_usable());
        }
        self.state = TicketState::Consumed {
            digest: digest.into(),
        };
        Ok(())
    }

    /// Record an expiry reported by the ledger.
    pub fn expire(&mut self, at: DateTime<Utc>) -> Result<(), TicketError> {
        if !self.is_usable() {
            return Err(self.not_usable());
        }
        self.state = TicketState::Expired { at };
        Ok(())
    }
}

/// Proof of administrative authority, passed through to the ledger unread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCredential {
    pub object_id: ObjectId,
}

impl CapabilityCredential {
    pub fn new(object_id: ObjectId) -> Self {
        Self { object_id }
    }
}

/// Request to mint `count` tickets of one action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    pub action: ActionType,
    pub count: usize,
    pub capability: CapabilityCredential,
}

/// Build the request for one ticket of `action`.
pub fn issue_ticket(action: ActionType, capability: &CapabilityCredential) -> TicketRequest {
    issue_tickets(action, 1, capability)
}

pub fn issue_tickets(
    action: ActionType,
    count: usize,
    capability: &CapabilityCredential,
) -> TicketRequest {
    TicketRequest {
        action,
        count,
        capability: capability.clone(),
    }
}

/// Turn the receipt of a ticket-creation request into tickets, in creation order.
pub fn tickets_from_receipt(
    receipt: &Receipt,
    request: &TicketRequest,
) -> Result<Vec<ActionTicket>, TollgateError> {
    if let ExecutionStatus::Failure { error } = &receipt.status {
        return Err(ExternalError::SubmissionFailed {
            digest: receipt.digest.clone(),
            message: error.clone(),
        }
        .into());
    }

    let now = Utc::now();
    let tickets: Vec<ActionTicket> = receipt
        .created
        .iter()
        .filter(|created| created.type_tag.contains(TICKET_TYPE_MARKER))
        .map(|created| ActionTicket::new(TicketId(created.id.clone()), request.action, now))
        .collect();

    if tickets.len() != request.count {
        return Err(TicketError::Insufficient {
            available: tickets.len(),
            required: request.count,
        }
        .into());
    }

    info!(
        action = %request.action,
        count = tickets.len(),
        digest = %receipt.digest,
        "tickets created"
    );
    Ok(tickets)
}

/// An action left without a ticket, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedAction {
    pub position: usize,
    pub action: ActionType,
    pub reason: TicketError,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TicketMatch {
    pub matched: Vec<(ActionType, ActionTicket)>,
    pub unmatched: Vec<UnmatchedAction>,
}

impl TicketMatch {
    pub fn is_complete(&self) -> bool {
        self.unmatched.is_empty()
    }

    pub fn unmatched_actions(&self) -> Vec<ActionType> {
        self.unmatched.iter().map(|u| u.action).collect()
    }
}

/// Pair tickets with required actions by position.
///
/// A ticket is only paired when its action type equals the action at its
/// position, it is still live and it has not already been paired. Anything
/// else leaves that action unmatched.
pub fn match_tickets(required: &[ActionType], available: &[ActionTicket]) -> TicketMatch {
    let mut result = TicketMatch::default();
    let mut paired: HashSet<&TicketId> = HashSet::new();

    for (position, action) in required.iter().copied().enumerate() {
        let reason = match available.get(position) {
            Some(ticket) if paired.contains(&ticket.id) => {
                warn!(position, ticket = %ticket.id, "ticket already paired with an earlier action");
                TicketError::Duplicate {
                    tickets: vec![ticket.id.clone()],
                }
            }
            Some(ticket) if ticket.action != action => {
                warn!(
                    position,
                    ticket = %ticket.id,
                    expected = %action,
                    actual = %ticket.action,
                    "ticket type does not match required action, leaving it unused"
                );
                TicketError::TypeMismatch {
                    ticket: ticket.id.clone(),
                    expected: action,
                    actual: ticket.action,
                }
            }
            Some(ticket) if !ticket.is_usable() => {
                warn!(position, ticket = %ticket.id, state = ?ticket.state, "ticket is no longer live");
                ticket.not_usable()
            }
            Some(ticket) => {
                debug!(position, ticket = %ticket.id, action = %action, "ticket matched");
                paired.insert(&ticket.id);
                result.matched.push((action, ticket.clone()));
                continue;
            }
            None => TicketError::Insufficient {
                available: available.len(),
                required: required.len(),
            },
        };
        result.unmatched.push(UnmatchedAction {
            position,
            action,
            reason,
        });
    }

    if available.len() < required.len() {
        warn!(
            available = available.len(),
            required = required.len(),
            "fewer tickets than required actions"
        );
    }
    result
}

/// Reject a batch that names the same ticket more than once.
pub fn assert_no_duplicate_tickets<'a, I>(tickets: I) -> Result<(), TicketError>
where
    I: IntoIterator<Item = &'a TicketId>,
{
    let mut seen = HashSet::new();
    let mut duplicates: Vec<TicketId> = Vec::new();
    for id in tickets {
        if !seen.insert(id) && !duplicates.contains(id) {
            duplicates.push(id.clone());
        }
    }

    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(TicketError::Duplicate {
            tickets: duplicates,
        })
    }
}

/// Parse a comma-separated ticket id list.
pub fn parse_ticket_ids(raw: &str, min_count: usize) -> Result<Vec<TicketId>, TollgateError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(TicketId::parse)
        .collect::<Result<Vec<_>, _>>()?;

    assert_no_duplicate_tickets(&ids)?;
    if ids.len() < min_count {
        return Err(TicketError::Insufficient {
            available: ids.len(),
            required: min_count,
        }
        .into());
    }
    Ok(ids)
}

/// Read and decode ticket objects, preserving the order of `ids`.
pub async fn load_tickets(
    ledger: &dyn LedgerClient,
    ids: &[TicketId],
    policy: &ExternalCallPolicy,
) -> Result<Vec<ActionTicket>, TollgateError> {
    assert_no_duplicate_tickets(ids)?;

    try_join_all(ids.iter().map(|id| async move {
        let snapshot = policy
            .read("read_object", || ledger.read_object(id.object_id()))
            .await?
            .ok_or_else(|| ExternalError::NotFound(id.object_id().clone()))?;
        ActionTicket::from_snapshot(&snapshot).map_err(TollgateError::from)
    }))
    .await
}
