//! Ledger and signer adapters for tollgate.
//!
//! [`InMemoryLedger`] is a fixture-backed ledger for dry runs and tests. It
//! enforces ticket consumption the way the on-chain program does, so a
//! request that would fail on-ledger fails here with a failure receipt.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signer as _, SigningKey};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tokio::sync::Mutex;
use tollgate_core::error::{ExternalError, ValidationError};
use tollgate_core::ledger::{
    AssetMetadata, AssetType, BalancePage, CreatedObject, ExecutionStatus, LedgerClient, ObjectId,
    ObjectSnapshot, RawBalance, Receipt, SignerAgent,
};
use tollgate_core::multisig::{Address, AggregatedAuthorization, MultisigConfig, PublicKey};
use tollgate_core::request::{AdminCall, ProtocolObjects};
use tollgate_core::ticket::{ActionTicket, ActionType, TicketId, TICKET_TYPE_MARKER};
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 50;

/// Serialized starting state of an [`InMemoryLedger`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerFixture {
    #[serde(default)]
    pub objects: Vec<ObjectSnapshot>,
    /// Balances keyed by the owning bag id, in enumeration order.
    #[serde(default)]
    pub balances: BTreeMap<ObjectId, Vec<RawBalance>>,
    #[serde(default)]
    pub metadata: HashMap<AssetType, AssetMetadata>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// Payload layout produced by `RequestBundle`.
#[derive(Debug, Deserialize)]
struct SubmittedPayload {
    sender: Address,
    objects: ProtocolObjects,
    calls: Vec<AdminCall>,
}

/// A request the ledger executed, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedRequest {
    pub digest: String,
    pub sender: Address,
    pub calls: Vec<AdminCall>,
}

#[derive(Debug, Default)]
struct LedgerState {
    objects: HashMap<ObjectId, ObjectSnapshot>,
    balances: BTreeMap<ObjectId, Vec<RawBalance>>,
    metadata: HashMap<AssetType, AssetMetadata>,
    next_object: u64,
    executed: Vec<ExecutedRequest>,
}

impl LedgerState {
    fn mint_id(&mut self) -> ObjectId {
        self.next_object += 1;
        ObjectId::from_bytes(*blake3::hash(&self.next_object.to_le_bytes()).as_bytes())
    }

    fn bag_of(&self, treasury: &ObjectId, field: &str) -> Option<ObjectId> {
        let snapshot = self.objects.get(treasury)?;
        let raw = snapshot
            .fields
            .pointer(&format!("/{field}/fields/id/id"))?
            .as_str()?;
        ObjectId::parse(raw).ok()
    }

    fn live_ticket(&self, id: &TicketId, expected: ActionType) -> Result<(), String> {
        let snapshot = self
            .objects
            .get(id.object_id())
            .ok_or_else(|| format!("ETicketNotFound: {id}"))?;
        let ticket = ActionTicket::from_snapshot(snapshot).map_err(|e| format!("EInvalidTicket: {e}"))?;
        if ticket.action != expected {
            return Err(format!(
                "ETicketTypeMismatch: {id} is {}, call needs {expected}",
                ticket.action
            ));
        }
        if !ticket.is_usable() {
            return Err(format!("ETicketNotUsable: {id} is {:?}", ticket.state));
        }
        Ok(())
    }
}

/// Fixture-backed [`LedgerClient`].
#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    authority: Option<MultisigConfig>,
    page_size: usize,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::from_fixture(LedgerFixture::default())
    }
}

impl InMemoryLedger {
    pub fn from_fixture(fixture: LedgerFixture) -> Self {
        let objects = fixture
            .objects
            .into_iter()
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();
        Self {
            state: Mutex::new(LedgerState {
                objects,
                balances: fixture.balances,
                metadata: fixture.metadata,
                ..LedgerState::default()
            }),
            authority: None,
            page_size: fixture.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
        }
    }

    pub fn from_fixture_json(json: &str) -> Result<Self, ValidationError> {
        let fixture: LedgerFixture = serde_json::from_str(json)
            .map_err(|e| ValidationError::Encoding(format!("ledger fixture: {e}")))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn from_fixture_path(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ValidationError::Encoding(format!("{}: {e}", path.display())))?;
        Self::from_fixture_json(&raw)
    }

    /// Check every submitted authorization against `config`, as the program does.
    pub fn with_authority(mut self, config: MultisigConfig) -> Self {
        self.authority = Some(config);
        self
    }

    pub async fn insert_object(&self, snapshot: ObjectSnapshot) {
        let mut state = self.state.lock().await;
        state.objects.insert(snapshot.id.clone(), snapshot);
    }

    pub async fn executed(&self) -> Vec<ExecutedRequest> {
        self.state.lock().await.executed.clone()
    }

    pub async fn balances_of(&self, bag: &ObjectId) -> Vec<RawBalance> {
        self.state
            .lock()
            .await
            .balances
            .get(bag)
            .cloned()
            .unwrap_or_default()
    }

    fn failure(digest: String, error: String) -> Receipt {
        warn!(digest = %digest, error = %error, "in-memory ledger rejected request");
        Receipt {
            digest,
            status: ExecutionStatus::Failure { error },
            created: Vec::new(),
            consumed: Vec::new(),
        }
    }

    /// Check all calls first so a rejected request leaves no trace.
    fn validate(state: &LedgerState, payload: &SubmittedPayload) -> Result<(), String> {
        let mut seen = Vec::new();
        for call in &payload.calls {
            if let Some((expected, ticket)) = call.required_ticket() {
                if seen.contains(&ticket) {
                    return Err(format!("ETicketAlreadyUsed: {ticket}"));
                }
                seen.push(ticket);
                state.live_ticket(ticket, expected)?;
            }
            match call {
                AdminCall::WithdrawProtocolFee { .. } | AdminCall::WithdrawCoverageFee { .. } => {
                    let field = withdrawal_bag_field(call);
                    if state.bag_of(&payload.objects.treasury, field).is_none() {
                        return Err(format!("ETreasuryMissingBag: {field}"));
                    }
                }
                AdminCall::CreateTickets { capability, .. }
                    if capability != &payload.objects.admin_cap =>
                {
                    return Err(format!("EInvalidCapability: {capability}"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(
        state: &mut LedgerState,
        payload: &SubmittedPayload,
        digest: &str,
        created: &mut Vec<CreatedObject>,
        consumed: &mut Vec<ObjectId>,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        let ticket_type = format!("{}{}", payload.objects.package, TICKET_TYPE_MARKER);

        for call in &payload.calls {
            if let Some((_, ticket)) = call.required_ticket() {
                if let Some(snapshot) = state.objects.get_mut(ticket.object_id()) {
                    set_field(
                        &mut snapshot.fields,
                        "state",
                        json!({ "state": "consumed", "digest": digest }),
                    );
                    snapshot.version += 1;
                }
                consumed.push(ticket.object_id().clone());
            }

            match call {
                AdminCall::CreateTickets { action, count, .. } => {
                    for _ in 0..*count {
                        let id = state.mint_id();
                        state.objects.insert(
                            id.clone(),
                            ObjectSnapshot {
                                id: id.clone(),
                                type_tag: ticket_type.clone(),
                                version: 1,
                                fields: json!({
                                    "ticket_type": action.name(),
                                    "created_at_ms": now_ms,
                                }),
                            },
                        );
                        created.push(CreatedObject {
                            id,
                            type_tag: ticket_type.clone(),
                        });
                    }
                }
                AdminCall::WithdrawProtocolFee { asset, .. }
                | AdminCall::WithdrawCoverageFee { asset, .. } => {
                    let field = withdrawal_bag_field(call);
                    if let Some(bag) = state.bag_of(&payload.objects.treasury, field) {
                        if let Some(entries) = state.balances.get_mut(&bag) {
                            entries.retain(|entry| &entry.asset_type != asset);
                        }
                    }
                }
                other => debug!(call = other.name(), "recorded admin call"),
            }
        }
    }
}

fn withdrawal_bag_field(call: &AdminCall) -> &'static str {
    match call {
        AdminCall::WithdrawCoverageFee { .. } => "deep_reserves_coverage_fees",
        _ => "protocol_fees",
    }
}

fn set_field(fields: &mut Value, key: &str, value: Value) {
    match fields {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
        }
        other => *other = json!({ key: value }),
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(
        &self,
        payload: &[u8],
        authorization: &AggregatedAuthorization,
    ) -> Result<Receipt, ExternalError> {
        let mut state = self.state.lock().await;
        let digest = format!(
            "{}-{}",
            &blake3::hash(payload).to_hex()[..16],
            state.executed.len() + 1
        );

        let decoded: SubmittedPayload = match serde_json::from_slice(payload) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(Self::failure(digest, format!("EMalformedRequest: {e}"))),
        };
        if authorization.address() != decoded.sender {
            return Ok(Self::failure(
                digest,
                format!("EInvalidSender: signed by {}", authorization.address()),
            ));
        }
        if let Some(config) = &self.authority {
            if let Err(e) = authorization.verify(config, payload) {
                return Ok(Self::failure(digest, format!("EInvalidSignature: {e}")));
            }
        }
        if let Err(error) = Self::validate(&state, &decoded) {
            return Ok(Self::failure(digest, error));
        }

        let mut created = Vec::new();
        let mut consumed = Vec::new();
        Self::apply(&mut state, &decoded, &digest, &mut created, &mut consumed);
        state.executed.push(ExecutedRequest {
            digest: digest.clone(),
            sender: decoded.sender,
            calls: decoded.calls,
        });

        info!(
            digest = %digest,
            created = created.len(),
            consumed = consumed.len(),
            "in-memory ledger executed request"
        );
        Ok(Receipt {
            digest,
            status: ExecutionStatus::Success,
            created,
            consumed,
        })
    }

    async fn read_object(&self, id: &ObjectId) -> Result<Option<ObjectSnapshot>, ExternalError> {
        Ok(self.state.lock().await.objects.get(id).cloned())
    }

    async fn read_balances(
        &self,
        owner: &ObjectId,
        filter: Option<&AssetType>,
        cursor: Option<&str>,
    ) -> Result<BalancePage, ExternalError> {
        let state = self.state.lock().await;
        let Some(entries) = state.balances.get(owner) else {
            return Err(ExternalError::NotFound(owner.clone()));
        };

        let start = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ExternalError::ledger("read_balances", format!("bad cursor '{raw}'")))?,
            None => 0,
        };
        let matching: Vec<&RawBalance> = entries
            .iter()
            .filter(|entry| filter.map_or(true, |wanted| &entry.asset_type == wanted))
            .collect();
        let end = (start + self.page_size).min(matching.len());

        Ok(BalancePage {
            entries: matching
                .get(start..end)
                .unwrap_or_default()
                .iter()
                .map(|entry| (*entry).clone())
                .collect(),
            next_cursor: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn read_asset_metadata(&self, asset: &AssetType) -> Result<AssetMetadata, ExternalError> {
        self.state
            .lock()
            .await
            .metadata
            .get(asset)
            .cloned()
            .ok_or_else(|| {
                ExternalError::ledger("read_asset_metadata", format!("no metadata for {asset}"))
            })
    }
}

/// Ledger whose every call fails, for exercising error paths.
#[derive(Debug, Clone)]
pub struct AlwaysFailLedger {
    reason: String,
}

impl AlwaysFailLedger {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LedgerClient for AlwaysFailLedger {
    async fn submit(
        &self,
        _payload: &[u8],
        _authorization: &AggregatedAuthorization,
    ) -> Result<Receipt, ExternalError> {
        Err(ExternalError::ledger("submit", self.reason.clone()))
    }

    async fn read_object(&self, _id: &ObjectId) -> Result<Option<ObjectSnapshot>, ExternalError> {
        Err(ExternalError::ledger("read_object", self.reason.clone()))
    }

    async fn read_balances(
        &self,
        _owner: &ObjectId,
        _filter: Option<&AssetType>,
        _cursor: Option<&str>,
    ) -> Result<BalancePage, ExternalError> {
        Err(ExternalError::ledger("read_balances", self.reason.clone()))
    }

    async fn read_asset_metadata(&self, _asset: &AssetType) -> Result<AssetMetadata, ExternalError> {
        Err(ExternalError::ledger("read_asset_metadata", self.reason.clone()))
    }
}

/// [`SignerAgent`] holding ed25519 keys in process memory.
#[derive(Default)]
pub struct LocalKeySigner {
    keys: HashMap<PublicKey, SigningKey>,
}

impl LocalKeySigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut signer = Self::new();
        signer.add_seed(seed);
        signer
    }

    /// Parse a 32-byte hex seed, `0x` optional.
    pub fn from_seed_hex(seed: &str) -> Result<Self, ValidationError> {
        let trimmed = seed.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| ValidationError::Encoding(format!("signer seed: {e}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            ValidationError::Encoding(format!("signer seed is {} bytes, expected 32", bytes.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn add_seed(&mut self, seed: [u8; 32]) -> PublicKey {
        let key = SigningKey::from_bytes(&seed);
        let public = PublicKey::from(key.verifying_key());
        self.keys.insert(public, key);
        public
    }

    pub fn public_keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.keys.keys().copied().collect();
        keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        keys
    }
}

impl fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("public_keys", &self.public_keys())
            .finish()
    }
}

#[async_trait]
impl SignerAgent for LocalKeySigner {
    async fn sign(&self, payload: &[u8], signer: &PublicKey) -> Result<Vec<u8>, ExternalError> {
        let key = self.keys.get(signer).ok_or_else(|| ExternalError::Signer {
            signer: signer.to_hex(),
            message: "no local key for this signer".to_string(),
        })?;
        debug!(signer = %signer, bytes = payload.len(), "signing payload locally");
        Ok(key.sign(payload).to_bytes().to_vec())
    }
}
