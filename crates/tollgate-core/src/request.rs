//! Request assembly and submission.
//!
//! [`RequestAssembler`] turns validated fee configs, tickets and plans into a
//! [`RequestBundle`] whose payload bytes are fixed before any signer sees
//! them. Submission re-verifies the authorization against those exact bytes
//! and is attempted once.

use crate::aggregator::{FeeBag, WithdrawalPlan};
use crate::error::{ExternalError, TicketError, TollgateError, ValidationError};
use crate::fee::{FeeRate, PoolFeeConfig};
use crate::ledger::{AssetType, ExecutionStatus, ExternalCallPolicy, LedgerClient, ObjectId, Receipt};
use crate::multisig::{Address, AggregatedAuthorization, MultisigConfig};
use crate::ticket::{ActionTicket, ActionType, TicketId, TicketRequest, TicketState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Ids of the shared protocol objects every admin call touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolObjects {
    pub package: ObjectId,
    pub treasury: ObjectId,
    pub multisig_config: ObjectId,
    pub admin_cap: ObjectId,
    pub trading_fee_config: ObjectId,
    pub pool_creation_config: ObjectId,
    pub loyalty_program: ObjectId,
    pub loyalty_admin_cap: ObjectId,
}

/// Every privileged mutation the admin surface can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum AdminCall {
    CreateTickets {
        action: ActionType,
        count: usize,
        capability: ObjectId,
    },
    UpdateDefaultFees {
        ticket: TicketId,
        config: PoolFeeConfig,
    },
    UpdatePoolSpecificFees {
        ticket: TicketId,
        pool: ObjectId,
        base_asset: AssetType,
        quote_asset: AssetType,
        config: PoolFeeConfig,
    },
    UpdatePoolCreationProtocolFee {
        ticket: TicketId,
        raw_fee: u64,
    },
    WithdrawProtocolFee {
        ticket: TicketId,
        asset: AssetType,
        recipient: Address,
    },
    WithdrawCoverageFee {
        ticket: TicketId,
        asset: AssetType,
        recipient: Address,
    },
    WithdrawDeepReserves {
        ticket: TicketId,
        raw_amount: u64,
        recipient: Address,
    },
    EnableVersion {
        version: u16,
    },
    DisableVersion {
        version: u16,
    },
    AddLoyaltyLevel {
        level: u8,
        discount: FeeRate,
    },
    RemoveLoyaltyLevel {
        level: u8,
    },
    GrantUserLevel {
        user: Address,
        level: u8,
    },
    RevokeUserLevel {
        user: Address,
    },
    InitMultisigConfig {
        public_keys: Vec<String>,
        weights: Vec<u8>,
        threshold: u16,
    },
    UpdateMultisigConfig {
        public_keys: Vec<String>,
        weights: Vec<u8>,
        threshold: u16,
    },
    UpdateLoyaltyAdminCapOwner {
        new_owner: Address,
    },
    CreatePoolCreationConfig,
    ClaimProtocolUnsettledFeeStorageRebate {
        fee_manager: ObjectId,
        fee_asset: AssetType,
    },
    /// `order_id` is a decimal u128; JSON numbers cannot carry it losslessly.
    ClaimUserUnsettledFeeStorageRebate {
        fee_manager: ObjectId,
        pool: ObjectId,
        balance_manager: ObjectId,
        order_id: String,
        base_asset: AssetType,
        quote_asset: AssetType,
        fee_asset: AssetType,
        public_keys: Vec<String>,
        weights: Vec<u8>,
        threshold: u16,
    },
}

impl AdminCall {
    /// The ticket this call consumes and the type it must have.
    pub fn required_ticket(&self) -> Option<(ActionType, &TicketId)> {
        match self {
            Self::UpdateDefaultFees { ticket, .. } => Some((ActionType::UpdateDefaultFees, ticket)),
            Self::UpdatePoolSpecificFees { ticket, .. } => {
                Some((ActionType::UpdatePoolSpecificFees, ticket))
            }
            Self::UpdatePoolCreationProtocolFee { ticket, .. } => {
                Some((ActionType::UpdatePoolCreationProtocolFee, ticket))
            }
            Self::WithdrawProtocolFee { ticket, .. } => Some((ActionType::WithdrawProtocolFee, ticket)),
            Self::WithdrawCoverageFee { ticket, .. } => Some((ActionType::WithdrawCoverageFee, ticket)),
            Self::WithdrawDeepReserves { ticket, .. } => {
                Some((ActionType::WithdrawDeepReserves, ticket))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTickets { .. } => "create_tickets",
            Self::UpdateDefaultFees { .. } => "update_default_fees",
            Self::UpdatePoolSpecificFees { .. } => "update_pool_specific_fees",
            Self::UpdatePoolCreationProtocolFee { .. } => "update_pool_creation_protocol_fee",
            Self::WithdrawProtocolFee { .. } => "withdraw_protocol_fee",
            Self::WithdrawCoverageFee { .. } => "withdraw_coverage_fee",
            Self::WithdrawDeepReserves { .. } => "withdraw_deep_reserves",
            Self::EnableVersion { .. } => "enable_version",
            Self::DisableVersion { .. } => "disable_version",
            Self::AddLoyaltyLevel { .. } => "add_loyalty_level",
            Self::RemoveLoyaltyLevel { .. } => "remove_loyalty_level",
            Self::GrantUserLevel { .. } => "grant_user",
            Self::RevokeUserLevel { .. } => "revoke_user",
            Self::InitMultisigConfig { .. } => "init_multisig_config",
            Self::UpdateMultisigConfig { .. } => "update_multisig_config",
            Self::UpdateLoyaltyAdminCapOwner { .. } => "update_loyalty_admin_cap_owner",
            Self::CreatePoolCreationConfig => "create_pool_creation_config",
            Self::ClaimProtocolUnsettledFeeStorageRebate { .. } => {
                "claim_protocol_unsettled_fee_storage_rebate_admin"
            }
            Self::ClaimUserUnsettledFeeStorageRebate { .. } => {
                "claim_user_unsettled_fee_storage_rebate_admin"
            }
        }
    }
}

/// An order whose settled fees still hold a storage rebate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsettledOrder {
    pub pool: ObjectId,
    pub balance_manager: ObjectId,
    pub order_id: u128,
    pub base_asset: AssetType,
    pub quote_asset: AssetType,
}

fn multisig_arguments(config: &MultisigConfig) -> (Vec<String>, Vec<u8>, u16) {
    let public_keys = config
        .public_key_bytes()
        .into_iter()
        .map(|bytes| format!("0x{}", hex::encode(bytes)))
        .collect();
    (public_keys, config.weights(), config.threshold())
}

/// Composes requests sent by one multisig authority.
#[derive(Debug, Clone)]
pub struct RequestAssembler {
    objects: ProtocolObjects,
    authority: MultisigConfig,
}

impl RequestAssembler {
    pub fn new(objects: ProtocolObjects, authority: MultisigConfig) -> Self {
        Self { objects, authority }
    }

    pub fn objects(&self) -> &ProtocolObjects {
        &self.objects
    }

    pub fn authority(&self) -> &MultisigConfig {
        &self.authority
    }

    pub fn builder(&self) -> RequestBuilder<'_> {
        RequestBuilder {
            assembler: self,
            calls: Vec::new(),
            tickets: HashSet::new(),
        }
    }

    /// Verify `authorization` against the exact bundle bytes, then submit once.
    ///
    /// A receipt with a failure status becomes [`ExternalError::SubmissionFailed`]
    /// carrying the ledger's error text.
    pub async fn submit(
        &self,
        ledger: &dyn LedgerClient,
        bundle: &RequestBundle,
        authorization: &AggregatedAuthorization,
        policy: &ExternalCallPolicy,
    ) -> Result<Receipt, TollgateError> {
        if bundle.sender != self.authority.address() {
            return Err(ValidationError::InvalidAddress(format!(
                "bundle sender {} is not the configured multisig {}",
                bundle.sender,
                self.authority.address()
            ))
            .into());
        }
        let weight = authorization.verify(&self.authority, bundle.payload())?;

        let receipt = policy
            .bounded("submit", ledger.submit(bundle.payload(), authorization))
            .await?;

        match &receipt.status {
            ExecutionStatus::Success => {
                info!(
                    digest = %receipt.digest,
                    calls = bundle.calls.len(),
                    tickets = bundle.consumed_tickets().len(),
                    weight,
                    "request executed"
                );
                Ok(receipt)
            }
            ExecutionStatus::Failure { error: message } => {
                error!(digest = %receipt.digest, error = %message, "request failed on ledger");
                Err(ExternalError::SubmissionFailed {
                    digest: receipt.digest.clone(),
                    message: message.clone(),
                }
                .into())
            }
        }
    }
}

/// Accumulates calls for one bundle.
///
/// Ticket-consuming calls are checked against the ticket's action type, only
/// `Created` tickets are accepted, and a ticket can appear at most once per
/// bundle.
#[derive(Debug)]
pub struct RequestBuilder<'a> {
    assembler: &'a RequestAssembler,
    calls: Vec<AdminCall>,
    tickets: HashSet<TicketId>,
}

impl<'a> RequestBuilder<'a> {
    fn check_ticket(&mut self, expected: ActionType, ticket: &ActionTicket) -> Result<(), TicketError> {
        if ticket.action != expected {
            return Err(TicketError::TypeMismatch {
                ticket: ticket.id.clone(),
                expected,
                actual: ticket.action,
            });
        }
        if ticket.state != TicketState::Created {
            return Err(ticket.not_usable());
        }
        if !self.tickets.insert(ticket.id.clone()) {
            return Err(TicketError::Duplicate {
                tickets: vec![ticket.id.clone()],
            });
        }
        Ok(())
    }

    pub fn create_tickets(&mut self, request: &TicketRequest) -> &mut Self {
        self.calls.push(AdminCall::CreateTickets {
            action: request.action,
            count: request.count,
            capability: request.capability.object_id.clone(),
        });
        self
    }

    pub fn update_default_fees(
        &mut self,
        ticket: &ActionTicket,
        config: PoolFeeConfig,
    ) -> Result<&mut Self, TicketError> {
        self.check_ticket(ActionType::UpdateDefaultFees, ticket)?;
        self.calls.push(AdminCall::UpdateDefaultFees {
            ticket: ticket.id.clone(),
            config,
        });
        Ok(self)
    }

    pub fn update_pool_specific_fees(
        &mut self,
        ticket: &ActionTicket,
        pool: ObjectId,
        base_asset: AssetType,
        quote_asset: AssetType,
        config: PoolFeeConfig,
    ) -> Result<&mut Self, TicketError> {
        self.check_ticket(ActionType::UpdatePoolSpecificFees, ticket)?;
        self.calls.push(AdminCall::UpdatePoolSpecificFees {
            ticket: ticket.id.clone(),
            pool,
            base_asset,
            quote_asset,
            config,
        });
        Ok(self)
    }

    pub fn update_pool_creation_protocol_fee(
        &mut self,
        ticket: &ActionTicket,
        raw_fee: u64,
    ) -> Result<&mut Self, TicketError> {
        self.check_ticket(ActionType::UpdatePoolCreationProtocolFee, ticket)?;
        self.calls.push(AdminCall::UpdatePoolCreationProtocolFee {
            ticket: ticket.id.clone(),
            raw_fee,
        });
        Ok(self)
    }

    /// One withdrawal per planned asset, paid to the multisig address.
    pub fn withdraw(&mut self, bag: FeeBag, plan: &WithdrawalPlan) -> Result<&mut Self, TicketError> {
        let recipient = self.assembler.authority.address();
        let mut staged = Vec::with_capacity(plan.withdrawals.len());
        for planned in &plan.withdrawals {
            if let Err(err) = self.check_ticket(bag.action(), &planned.ticket) {
                for call in &staged {
                    if let Some((_, id)) = AdminCall::required_ticket(call) {
                        self.tickets.remove(id);
                    }
                }
                return Err(err);
            }
            let ticket = planned.ticket.id.clone();
            let asset = planned.entry.asset_type.clone();
            staged.push(match bag {
                FeeBag::ProtocolFees => AdminCall::WithdrawProtocolFee {
                    ticket,
                    asset,
                    recipient,
                },
                FeeBag::CoverageFees => AdminCall::WithdrawCoverageFee {
                    ticket,
                    asset,
                    recipient,
                },
            });
        }
        self.calls.extend(staged);
        Ok(self)
    }

    pub fn withdraw_deep_reserves(
        &mut self,
        ticket: &ActionTicket,
        raw_amount: u64,
    ) -> Result<&mut Self, TicketError> {
        self.check_ticket(ActionType::WithdrawDeepReserves, ticket)?;
        let recipient = self.assembler.authority.address();
        self.calls.push(AdminCall::WithdrawDeepReserves {
            ticket: ticket.id.clone(),
            raw_amount,
            recipient,
        });
        Ok(self)
    }

    pub fn set_version_enabled(&mut self, version: u16, enabled: bool) -> &mut Self {
        self.calls.push(if enabled {
            AdminCall::EnableVersion { version }
        } else {
            AdminCall::DisableVersion { version }
        });
        self
    }

    pub fn add_loyalty_level(&mut self, level: u8, discount: FeeRate) -> &mut Self {
        self.calls.push(AdminCall::AddLoyaltyLevel { level, discount });
        self
    }

    pub fn remove_loyalty_level(&mut self, level: u8) -> &mut Self {
        self.calls.push(AdminCall::RemoveLoyaltyLevel { level });
        self
    }

    pub fn grant_user_level(&mut self, user: Address, level: u8) -> &mut Self {
        self.calls.push(AdminCall::GrantUserLevel { user, level });
        self
    }

    pub fn revoke_user_level(&mut self, user: Address) -> &mut Self {
        self.calls.push(AdminCall::RevokeUserLevel { user });
        self
    }

    /// Publish `config` as the on-ledger multisig definition.
    pub fn init_multisig_config(&mut self, config: &MultisigConfig) -> &mut Self {
        let (public_keys, weights, threshold) = multisig_arguments(config);
        self.calls.push(AdminCall::InitMultisigConfig {
            public_keys,
            weights,
            threshold,
        });
        self
    }

    pub fn update_multisig_config(&mut self, config: &MultisigConfig) -> &mut Self {
        let (public_keys, weights, threshold) = multisig_arguments(config);
        self.calls.push(AdminCall::UpdateMultisigConfig {
            public_keys,
            weights,
            threshold,
        });
        self
    }

    pub fn update_loyalty_admin_cap_owner(&mut self, new_owner: Address) -> &mut Self {
        self.calls.push(AdminCall::UpdateLoyaltyAdminCapOwner { new_owner });
        self
    }

    pub fn create_pool_creation_config(&mut self) -> &mut Self {
        self.calls.push(AdminCall::CreatePoolCreationConfig);
        self
    }

    pub fn claim_protocol_storage_rebate(&mut self, fee_manager: ObjectId, fee_asset: AssetType) -> &mut Self {
        self.calls.push(AdminCall::ClaimProtocolUnsettledFeeStorageRebate {
            fee_manager,
            fee_asset,
        });
        self
    }

    /// The ledger re-derives the multisig address from the arguments, so the
    /// authority's keys travel with the call.
    pub fn claim_user_storage_rebate(
        &mut self,
        fee_manager: ObjectId,
        order: &UnsettledOrder,
        fee_asset: AssetType,
    ) -> &mut Self {
        let (public_keys, weights, threshold) = multisig_arguments(&self.assembler.authority);
        self.calls.push(AdminCall::ClaimUserUnsettledFeeStorageRebate {
            fee_manager,
            pool: order.pool.clone(),
            balance_manager: order.balance_manager.clone(),
            order_id: order.order_id.to_string(),
            base_asset: order.base_asset.clone(),
            quote_asset: order.quote_asset.clone(),
            fee_asset,
            public_keys,
            weights,
            threshold,
        });
        self
    }

    pub fn calls(&self) -> &[AdminCall] {
        &self.calls
    }

    /// Freeze the calls into payload bytes.
    pub fn build(&self) -> Result<RequestBundle, ValidationError> {
        if self.calls.is_empty() {
            return Err(ValidationError::EmptyRequest);
        }
        RequestBundle::new(
            self.assembler.authority.address(),
            self.assembler.objects.clone(),
            self.calls.clone(),
        )
    }
}

#[derive(Serialize)]
struct PayloadView<'a> {
    sender: &'a Address,
    objects: &'a ProtocolObjects,
    calls: &'a [AdminCall],
}

/// Immutable request with its canonical payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBundle {
    sender: Address,
    objects: ProtocolObjects,
    calls: Vec<AdminCall>,
    payload: Vec<u8>,
}

impl RequestBundle {
    fn new(
        sender: Address,
        objects: ProtocolObjects,
        calls: Vec<AdminCall>,
    ) -> Result<Self, ValidationError> {
        let payload = serde_json::to_vec(&PayloadView {
            sender: &sender,
            objects: &objects,
            calls: &calls,
        })
        .map_err(|e| ValidationError::Encoding(e.to_string()))?;

        Ok(Self {
            sender,
            objects,
            calls,
            payload,
        })
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn objects(&self) -> &ProtocolObjects {
        &self.objects
    }

    pub fn calls(&self) -> &[AdminCall] {
        &self.calls
    }

    /// Exact bytes every signer signs.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_base64(&self) -> String {
        BASE64.encode(&self.payload)
    }

    /// blake3 of the payload, hex encoded.
    pub fn digest(&self) -> String {
        blake3::hash(&self.payload).to_hex().to_string()
    }

    pub fn consumed_tickets(&self) -> Vec<&TicketId> {
        self.calls
            .iter()
            .filter_map(|call| call.required_ticket().map(|(_, id)| id))
            .collect()
    }

    /// Mark every ticket this bundle consumes as `Outstanding`.
    ///
    /// All referenced tickets found in `tickets` are checked before any is
    /// touched. Returns how many were reserved.
    pub fn reserve(&self, tickets: &mut [ActionTicket]) -> Result<usize, TicketError> {
        let wanted: HashSet<&TicketId> = self.consumed_tickets().into_iter().collect();
        if let Some(taken) = tickets
            .iter()
            .find(|t| wanted.contains(&t.id) && t.state != TicketState::Created)
        {
            return Err(taken.not_usable());
        }

        let mut reserved = 0;
        for ticket in tickets.iter_mut().filter(|t| wanted.contains(&t.id)) {
            ticket.mark_outstanding()?;
            reserved += 1;
        }
        debug!(digest = %self.digest(), reserved, "tickets reserved");
        Ok(reserved)
    }

    /// Apply the outcome of submitting this bundle to its tickets.
    ///
    /// A successful receipt consumes them with the receipt digest, a failed
    /// one puts them back to `Created`. Returns how many changed state.
    pub fn settle(&self, receipt: &Receipt, tickets: &mut [ActionTicket]) -> Result<usize, TicketError> {
        let wanted: HashSet<&TicketId> = self.consumed_tickets().into_iter().collect();
        let mut settled = 0;
        for ticket in tickets.iter_mut().filter(|t| wanted.contains(&t.id)) {
            if receipt.is_success() {
                ticket.consume(receipt.digest.clone())?;
            } else {
                ticket.release()?;
            }
            settled += 1;
        }
        debug!(digest = %receipt.digest, settled, success = receipt.is_success(), "tickets settled");
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{reconcile, AssetBalanceEntry};
    use crate::fee::{build_pool_fee_config, PoolFeeParams};
    use crate::ledger::{AssetMetadata, BalancePage, ObjectSnapshot};
    use crate::multisig::aggregate;
    use crate::multisig::tests::{config, sign};
    use crate::ticket::tests::ticket;
    use crate::ticket::CapabilityCredential;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn objects() -> ProtocolObjects {
        let id = |n: u8| ObjectId::parse(&format!("0x{n:x}")).unwrap();
        ProtocolObjects {
            package: id(0xa1),
            treasury: id(0xa2),
            multisig_config: id(0xa3),
            admin_cap: id(0xa4),
            trading_fee_config: id(0xa5),
            pool_creation_config: id(0xa6),
            loyalty_program: id(0xa7),
            loyalty_admin_cap: id(0xa8),
        }
    }

    fn fees() -> PoolFeeConfig {
        build_pool_fee_config(&PoolFeeParams {
            primary_asset_taker_rate: 0.06,
            primary_asset_maker_rate: 0.03,
            input_asset_taker_rate: 0.05,
            input_asset_maker_rate: 0.02,
            max_discount_rate: 25.0,
        })
        .unwrap()
    }

    struct RecordingLedger {
        outcome: ExecutionStatus,
        submitted: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl LedgerClient for RecordingLedger {
        async fn submit(
            &self,
            payload: &[u8],
            _authorization: &AggregatedAuthorization,
        ) -> Result<Receipt, ExternalError> {
            self.submitted.lock().unwrap().push(payload.to_vec());
            Ok(Receipt {
                digest: "RCPT".into(),
                status: self.outcome.clone(),
                created: vec![],
                consumed: vec![],
            })
        }

        async fn read_object(&self, _id: &ObjectId) -> Result<Option<ObjectSnapshot>, ExternalError> {
            Ok(None)
        }

        async fn read_balances(
            &self,
            _owner: &ObjectId,
            _filter: Option<&AssetType>,
            _cursor: Option<&str>,
        ) -> Result<BalancePage, ExternalError> {
            Ok(BalancePage::default())
        }

        async fn read_asset_metadata(&self, asset: &AssetType) -> Result<AssetMetadata, ExternalError> {
            Err(ExternalError::ledger("read_asset_metadata", asset.to_string()))
        }
    }

    fn ledger(outcome: ExecutionStatus) -> RecordingLedger {
        RecordingLedger {
            outcome,
            submitted: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn ticket_type_checked_at_assembly() {
        let assembler = RequestAssembler::new(objects(), config(&[1, 1], 2));
        let mut builder = assembler.builder();
        let wrong = ticket(1, ActionType::UpdatePoolSpecificFees);
        let err = builder.update_default_fees(&wrong, fees()).unwrap_err();
        assert!(matches!(err, TicketError::TypeMismatch { .. }));
        assert!(builder.calls().is_empty());
    }

    #[test]
    fn same_ticket_twice_is_rejected() {
        let assembler = RequestAssembler::new(objects(), config(&[1, 1], 2));
        let mut builder = assembler.builder();
        let t = ticket(1, ActionType::UpdateDefaultFees);
        builder.update_default_fees(&t, fees()).unwrap();
        assert!(matches!(
            builder.update_default_fees(&t, fees()),
            Err(TicketError::Duplicate { .. })
        ));
    }

    #[test]
    fn empty_bundle_is_rejected() {
        let assembler = RequestAssembler::new(objects(), config(&[1], 1));
        assert_eq!(assembler.builder().build().unwrap_err(), ValidationError::EmptyRequest);
    }

    #[test]
    fn payload_is_deterministic() {
        let assembler = RequestAssembler::new(objects(), config(&[1, 2], 2));
        let build = || {
            let mut builder = assembler.builder();
            builder
                .create_tickets(&crate::ticket::issue_tickets(
                    ActionType::WithdrawProtocolFee,
                    3,
                    &CapabilityCredential::new(objects().admin_cap),
                ))
                .set_version_enabled(2, true)
                .add_loyalty_level(1, FeeRate::from_raw(100_000_000).unwrap());
            builder.build().unwrap()
        };

        let a = build();
        let b = build();
        assert_eq!(a.payload(), b.payload());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.sender(), assembler.authority().address());
        assert!(a.consumed_tickets().is_empty());
    }

    #[test]
    fn withdrawal_plan_becomes_calls_to_the_multisig() {
        let authority = config(&[1, 1], 1);
        let assembler = RequestAssembler::new(objects(), authority.clone());
        let plan = reconcile(
            ActionType::WithdrawCoverageFee,
            vec![
                AssetBalanceEntry::new(AssetType::new("A"), 5, 0),
                AssetBalanceEntry::new(AssetType::new("B"), 6, 0),
            ],
            vec![ticket(1, ActionType::WithdrawCoverageFee)],
        )
        .unwrap();

        let mut builder = assembler.builder();
        builder.withdraw(FeeBag::CoverageFees, &plan).unwrap();
        let bundle = builder.build().unwrap();

        assert_eq!(bundle.calls().len(), 1);
        match &bundle.calls()[0] {
            AdminCall::WithdrawCoverageFee { recipient, asset, .. } => {
                assert_eq!(*recipient, authority.address());
                assert_eq!(asset.as_str(), "A");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(builder.withdraw(FeeBag::ProtocolFees, &plan).is_err());
    }

    #[test]
    fn multisig_config_call_carries_flagged_keys() {
        let authority = config(&[3, 1], 2);
        let assembler = RequestAssembler::new(objects(), authority.clone());
        let mut builder = assembler.builder();
        builder.init_multisig_config(&authority);
        match &builder.calls()[0] {
            AdminCall::InitMultisigConfig {
                public_keys,
                weights,
                threshold,
            } => {
                assert_eq!(public_keys.len(), 2);
                assert!(public_keys[0].starts_with("0x00"));
                assert_eq!(public_keys[0].len(), 2 + 66);
                assert_eq!(weights, &vec![3, 1]);
                assert_eq!(*threshold, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reserved_ticket_cannot_join_another_bundle() {
        let assembler = RequestAssembler::new(objects(), config(&[1, 1], 1));
        let mut tickets = vec![
            ticket(1, ActionType::UpdateDefaultFees),
            ticket(2, ActionType::WithdrawDeepReserves),
        ];

        let mut builder = assembler.builder();
        builder.update_default_fees(&tickets[0], fees()).unwrap();
        let bundle = builder.build().unwrap();
        assert_eq!(bundle.reserve(&mut tickets).unwrap(), 1);
        assert_eq!(tickets[0].state, TicketState::Outstanding);
        assert_eq!(tickets[1].state, TicketState::Created);

        let mut second = assembler.builder();
        assert!(matches!(
            second.update_default_fees(&tickets[0], fees()),
            Err(TicketError::NotUsable { .. })
        ));
        assert!(matches!(bundle.reserve(&mut tickets), Err(TicketError::NotUsable { .. })));
    }

    #[test]
    fn settle_consumes_on_success_and_releases_on_failure() {
        let assembler = RequestAssembler::new(objects(), config(&[1, 1], 1));
        let mut tickets = vec![ticket(1, ActionType::WithdrawDeepReserves)];
        let mut builder = assembler.builder();
        builder.withdraw_deep_reserves(&tickets[0], 10).unwrap();
        let bundle = builder.build().unwrap();
        bundle.reserve(&mut tickets).unwrap();

        let failed = Receipt {
            digest: "FAIL".into(),
            status: ExecutionStatus::Failure { error: "EPaused".into() },
            created: vec![],
            consumed: vec![],
        };
        assert_eq!(bundle.settle(&failed, &mut tickets).unwrap(), 1);
        assert_eq!(tickets[0].state, TicketState::Created);

        bundle.reserve(&mut tickets).unwrap();
        let ok = Receipt {
            digest: "DONE".into(),
            status: ExecutionStatus::Success,
            created: vec![],
            consumed: vec![],
        };
        assert_eq!(bundle.settle(&ok, &mut tickets).unwrap(), 1);
        assert_eq!(
            tickets[0].state,
            TicketState::Consumed {
                digest: "DONE".into()
            }
        );
        assert!(bundle.settle(&ok, &mut tickets).is_err());
    }

    #[test]
    fn storage_rebate_and_owner_calls() {
        let authority = config(&[2, 1], 2);
        let assembler = RequestAssembler::new(objects(), authority.clone());
        let fee_manager = ObjectId::parse("0x4cef").unwrap();
        let usdc = AssetType::new("0xdba::usdc::USDC");
        let order = UnsettledOrder {
            pool: ObjectId::parse("0xface").unwrap(),
            balance_manager: ObjectId::parse("0xee7d").unwrap(),
            order_id: 1_844_692_854_115_028_871_151_501,
            base_asset: AssetType::new("0x3a3::haedal::HAEDAL"),
            quote_asset: usdc.clone(),
        };

        let mut builder = assembler.builder();
        builder
            .claim_protocol_storage_rebate(fee_manager.clone(), usdc.clone())
            .claim_user_storage_rebate(fee_manager, &order, usdc)
            .update_loyalty_admin_cap_owner(authority.address())
            .create_pool_creation_config();
        let bundle = builder.build().unwrap();

        let names: Vec<_> = bundle.calls().iter().map(AdminCall::name).collect();
        assert_eq!(
            names,
            [
                "claim_protocol_unsettled_fee_storage_rebate_admin",
                "claim_user_unsettled_fee_storage_rebate_admin",
                "update_loyalty_admin_cap_owner",
                "create_pool_creation_config",
            ]
        );
        assert!(bundle.consumed_tickets().is_empty());
        match &bundle.calls()[1] {
            AdminCall::ClaimUserUnsettledFeeStorageRebate {
                order_id,
                weights,
                threshold,
                public_keys,
                ..
            } => {
                assert_eq!(order_id, "1844692854115028871151501");
                assert_eq!(weights, &vec![2, 1]);
                assert_eq!(*threshold, 2);
                assert_eq!(public_keys.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let decoded: serde_json::Value = serde_json::from_slice(bundle.payload()).unwrap();
        assert_eq!(decoded["calls"][3], serde_json::json!({ "call": "create_pool_creation_config" }));
        let call: AdminCall = serde_json::from_value(decoded["calls"][1].clone()).unwrap();
        assert_eq!(&call, &bundle.calls()[1]);
    }

    #[tokio::test]
    async fn submit_verifies_then_sends_once() {
        let authority = config(&[1, 1, 1], 2);
        let assembler = RequestAssembler::new(objects(), authority.clone());
        let mut builder = assembler.builder();
        builder
            .update_default_fees(&ticket(1, ActionType::UpdateDefaultFees), fees())
            .unwrap();
        let bundle = builder.build().unwrap();
        let payload = bundle.payload();

        let auth = aggregate(&authority, payload, &[sign(1, payload), sign(2, payload)]).unwrap();
        let ok = ledger(ExecutionStatus::Success);
        let policy = ExternalCallPolicy::default();
        let receipt = assembler.submit(&ok, &bundle, &auth, &policy).await.unwrap();
        assert!(receipt.is_success());
        assert_eq!(ok.submitted.lock().unwrap().len(), 1);

        let failing = ledger(ExecutionStatus::Failure {
            error: "ETicketAlreadyUsed".into(),
        });
        let err = assembler.submit(&failing, &bundle, &auth, &policy).await.unwrap_err();
        match err {
            TollgateError::External(ExternalError::SubmissionFailed { message, .. }) => {
                assert_eq!(message, "ETicketAlreadyUsed")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(failing.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_refuses_authorization_for_other_bytes() {
        let authority = config(&[1, 1], 2);
        let assembler = RequestAssembler::new(objects(), authority.clone());
        let mut builder = assembler.builder();
        builder.set_version_enabled(3, false);
        let bundle = builder.build().unwrap();

        let other = b"a different request";
        let auth = aggregate(&authority, other, &[sign(1, other), sign(2, other)]).unwrap();
        let recording = ledger(ExecutionStatus::Success);
        let err = assembler
            .submit(&recording, &bundle, &auth, &ExternalCallPolicy::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TollgateError::Authorization(_)));
        assert!(recording.submitted.lock().unwrap().is_empty());
    }
}
