//! Weighted multisig: address derivation, partial signatures and aggregation.
//!
//! A [`MultisigConfig`] is an ordered signer list plus a threshold. Signer order
//! is part of its identity: the composite address hashes keys and weights in
//! order, and the aggregated artifact aligns signatures positionally with the
//! weight list.

use crate::error::{AuthorizationError, TollgateError, ValidationError};
use crate::ledger::{ExternalCallPolicy, SignerAgent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, VerifyingKey};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheme-version tag prefixed to every multisig address preimage.
pub const MULTISIG_SCHEME_FLAG: u8 = 0x03;

/// Key-scheme flag for ed25519 signers.
pub const ED25519_SCHEME_FLAG: u8 = 0x00;

/// Largest signer set the participation bitmap can describe on-ledger.
pub const MAX_SIGNERS: usize = 10;

const PUBLIC_KEY_LEN: usize = 32;

/// BLAKE2b with a 32-byte output, the ledger's address hash.
type Blake2b256 = Blake2b<U32>;
const SIGNATURE_LEN: usize = 64;

/// An ed25519 signer key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            ValidationError::InvalidPublicKey(format!(
                "expected {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| ValidationError::InvalidPublicKey(e.to_string()))
    }

    /// Parse either hex (`0x` optional) of the raw key, or base64 of the
    /// flag-prefixed key as exported by wallet tooling.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let hex_digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if hex_digits.len() == PUBLIC_KEY_LEN * 2 {
            if let Ok(bytes) = hex::decode(hex_digits) {
                return Self::from_bytes(&bytes);
            }
        }

        let bytes = BASE64
            .decode(trimmed)
            .map_err(|e| ValidationError::InvalidPublicKey(format!("'{input}': {e}")))?;
        match bytes.split_first() {
            Some((&ED25519_SCHEME_FLAG, key)) => Self::from_bytes(key),
            Some((flag, _)) => Err(ValidationError::InvalidPublicKey(format!(
                "unsupported key scheme flag {flag:#04x}"
            ))),
            None => Err(ValidationError::InvalidPublicKey("empty key".to_string())),
        }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    pub fn flag(&self) -> u8 {
        ED25519_SCHEME_FLAG
    }

    /// Flag-prefixed key bytes, the form the program stores.
    pub fn to_flagged_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
        out.push(self.flag());
        out.extend_from_slice(self.as_bytes());
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.as_bytes()))
    }

    /// Single-key account address of this signer: BLAKE2b-256 of `flag || key`.
    pub fn address(&self) -> Address {
        let mut hasher = Blake2b256::new();
        hasher.update([self.flag()]);
        hasher.update(self.as_bytes());
        Address::from_digest(hasher)
    }

    pub fn verify(&self, payload: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(payload, signature).is_ok()
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 32]);

impl Address {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn from_digest(hasher: Blake2b256) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(digits).map_err(|e| ValidationError::InvalidAddress(e.to_string()))?;
        let raw: [u8; 32] = bytes.try_into().map_err(|_| {
            ValidationError::InvalidAddress(format!("'{s}' is not 32 bytes"))
        })?;
        Ok(Self(raw))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signer {
    pub public_key: PublicKey,
    pub weight: u8,
}

impl Signer {
    pub fn new(public_key: PublicKey, weight: u8) -> Self {
        Self { public_key, weight }
    }
}

/// Immutable, validated multisig definition with its cached address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "MultisigConfigSpec", into = "MultisigConfigSpec")]
pub struct MultisigConfig {
    signers: Vec<Signer>,
    threshold: u16,
    address: Address,
}

/// Unvalidated wire/config form of a [`MultisigConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfigSpec {
    pub signers: Vec<Signer>,
    pub threshold: u16,
}

impl MultisigConfig {
    pub fn new(signers: Vec<Signer>, threshold: u16) -> Result<Self, ValidationError> {
        if signers.is_empty() {
            return Err(ValidationError::EmptySignerSet);
        }
        if signers.len() > MAX_SIGNERS {
            return Err(ValidationError::TooManySigners {
                count: signers.len(),
                max: MAX_SIGNERS,
            });
        }
        if let Some(index) = signers.iter().position(|s| s.weight == 0) {
            return Err(ValidationError::ZeroWeight { index });
        }

        let mut seen = HashSet::with_capacity(signers.len());
        for signer in &signers {
            if !seen.insert(signer.public_key) {
                return Err(ValidationError::DuplicatePublicKey {
                    public_key: signer.public_key.to_hex(),
                });
            }
        }

        if threshold == 0 {
            return Err(ValidationError::ZeroThreshold);
        }
        let total_weight = signers.iter().map(|s| s.weight as u32).sum::<u32>();
        if threshold as u32 > total_weight {
            return Err(ValidationError::UnreachableThreshold {
                threshold,
                total_weight,
            });
        }

        let address = compute_address(&signers, threshold);
        Ok(Self {
            signers,
            threshold,
            address,
        })
    }

    pub fn signers(&self) -> &[Signer] {
        &self.signers
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn total_weight(&self) -> u32 {
        self.signers.iter().map(|s| s.weight as u32).sum()
    }

    pub fn position_of(&self, key: &PublicKey) -> Option<usize> {
        self.signers.iter().position(|s| &s.public_key == key)
    }

    /// Flag-prefixed public keys in config order.
    pub fn public_key_bytes(&self) -> Vec<Vec<u8>> {
        self.signers
            .iter()
            .map(|s| s.public_key.to_flagged_bytes())
            .collect()
    }

    pub fn weights(&self) -> Vec<u8> {
        self.signers.iter().map(|s| s.weight).collect()
    }
}

impl TryFrom<MultisigConfigSpec> for MultisigConfig {
    type Error = ValidationError;

    fn try_from(spec: MultisigConfigSpec) -> Result<Self, Self::Error> {
        Self::new(spec.signers, spec.threshold)
    }
}

impl From<MultisigConfig> for MultisigConfigSpec {
    fn from(config: MultisigConfig) -> Self {
        Self {
            signers: config.signers,
            threshold: config.threshold,
        }
    }
}

/// Recompute the composite address of `config`.
///
/// BLAKE2b-256 over `scheme flag || threshold (u16 LE) || for each signer in
/// order: key flag || key bytes || weight`. This must reproduce the ledger's
/// own multisig address byte for byte.
pub fn derive_address(config: &MultisigConfig) -> Address {
    compute_address(&config.signers, config.threshold)
}

fn compute_address(signers: &[Signer], threshold: u16) -> Address {
    let mut hasher = Blake2b256::new();
    hasher.update([MULTISIG_SCHEME_FLAG]);
    hasher.update(threshold.to_le_bytes());
    for signer in signers {
        hasher.update([signer.public_key.flag()]);
        hasher.update(signer.public_key.as_bytes());
        hasher.update([signer.weight]);
    }
    Address::from_digest(hasher)
}

/// One signer's signature over one exact payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature {
    pub signer: PublicKey,
    pub signature: Signature,
}

impl PartialSignature {
    pub fn from_bytes(signer: PublicKey, bytes: &[u8]) -> Result<Self, AuthorizationError> {
        let signature =
            Signature::from_slice(bytes).map_err(|_| AuthorizationError::SignatureMismatch {
                signer: signer.to_hex(),
            })?;
        Ok(Self { signer, signature })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<(), AuthorizationError> {
        if self.signer.verify(payload, &self.signature) {
            Ok(())
        } else {
            Err(AuthorizationError::SignatureMismatch {
                signer: self.signer.to_hex(),
            })
        }
    }

    /// `flag || signature || public key`, base64 encoded.
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(1 + SIGNATURE_LEN + PUBLIC_KEY_LEN);
        bytes.push(self.signer.flag());
        bytes.extend_from_slice(&self.signature.to_bytes());
        bytes.extend_from_slice(self.signer.as_bytes());
        BASE64.encode(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ValidationError::Encoding(format!("partial signature: {e}")))?;
        if bytes.len() != 1 + SIGNATURE_LEN + PUBLIC_KEY_LEN {
            return Err(ValidationError::Encoding(format!(
                "partial signature is {} bytes, expected {}",
                bytes.len(),
                1 + SIGNATURE_LEN + PUBLIC_KEY_LEN
            )));
        }
        if bytes[0] != ED25519_SCHEME_FLAG {
            return Err(ValidationError::Encoding(format!(
                "unsupported signature scheme flag {:#04x}",
                bytes[0]
            )));
        }

        let signature = Signature::from_slice(&bytes[1..1 + SIGNATURE_LEN])
            .map_err(|e| ValidationError::Encoding(e.to_string()))?;
        let signer = PublicKey::from_bytes(&bytes[1 + SIGNATURE_LEN..])?;
        Ok(Self { signer, signature })
    }
}

/// Threshold-satisfying authorization for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedAuthorization {
    address: Address,
    bitmap: u16,
    signatures: Vec<Signature>,
}

impl AggregatedAuthorization {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Bit `i` is set when signer `i` of the config participated.
    pub fn bitmap(&self) -> u16 {
        self.bitmap
    }

    /// Signatures in config order.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn signer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..16).filter(move |i| self.bitmap & (1 << i) != 0)
    }

    /// `bitmap (u16 LE) || for each participant in config order: flag || signature`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.signatures.len() * (1 + SIGNATURE_LEN));
        bytes.extend_from_slice(&self.bitmap.to_le_bytes());
        for signature in &self.signatures {
            bytes.push(ED25519_SCHEME_FLAG);
            bytes.extend_from_slice(&signature.to_bytes());
        }
        bytes
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Decode an artifact produced for `config`. Structure only; call
    /// [`AggregatedAuthorization::verify`] before trusting it.
    pub fn from_bytes(config: &MultisigConfig, bytes: &[u8]) -> Result<Self, AuthorizationError> {
        let malformed = |reason: String| AuthorizationError::MalformedArtifact(reason);

        if bytes.len() < 2 {
            return Err(malformed("missing participation bitmap".to_string()));
        }
        let bitmap = u16::from_le_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];
        if body.len() % (1 + SIGNATURE_LEN) != 0 {
            return Err(malformed(format!(
                "signature section of {} bytes is not a whole number of entries",
                body.len()
            )));
        }

        let signatures = body
            .chunks_exact(1 + SIGNATURE_LEN)
            .map(|chunk| {
                if chunk[0] != ED25519_SCHEME_FLAG {
                    return Err(malformed(format!(
                        "unsupported signature scheme flag {:#04x}",
                        chunk[0]
                    )));
                }
                Signature::from_slice(&chunk[1..]).map_err(|e| malformed(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            address: config.address(),
            bitmap,
            signatures,
        })
    }

    pub fn from_base64(config: &MultisigConfig, encoded: &str) -> Result<Self, AuthorizationError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AuthorizationError::MalformedArtifact(e.to_string()))?;
        Self::from_bytes(config, &bytes)
    }

    /// Re-check the artifact against `config` and `payload`, returning the
    /// participating weight.
    pub fn verify(&self, config: &MultisigConfig, payload: &[u8]) -> Result<u32, AuthorizationError> {
        if self.address != config.address() {
            return Err(AuthorizationError::MalformedArtifact(format!(
                "artifact was built for {}, not {}",
                self.address,
                config.address()
            )));
        }

        let out_of_range = self.bitmap >> config.signers().len();
        if out_of_range != 0 {
            return Err(AuthorizationError::MalformedArtifact(format!(
                "bitmap {:#06x} references signers beyond the {} configured",
                self.bitmap,
                config.signers().len()
            )));
        }

        let indices: Vec<usize> = self.signer_indices().collect();
        if indices.len() != self.signatures.len() {
            return Err(AuthorizationError::MalformedArtifact(format!(
                "bitmap marks {} signers but {} signatures are present",
                indices.len(),
                self.signatures.len()
            )));
        }

        let mut accumulated = 0_u32;
        for (index, signature) in indices.iter().zip(&self.signatures) {
            let signer = &config.signers()[*index];
            if !signer.public_key.verify(payload, signature) {
                return Err(AuthorizationError::SignatureMismatch {
                    signer: signer.public_key.to_hex(),
                });
            }
            accumulated += signer.weight as u32;
        }

        let required = config.threshold() as u32;
        if accumulated < required {
            return Err(AuthorizationError::InsufficientWeight {
                accumulated,
                required,
                missing: missing_signers(config, &indices),
            });
        }

        Ok(accumulated)
    }
}

fn missing_signers(config: &MultisigConfig, present: &[usize]) -> Vec<String> {
    config
        .signers()
        .iter()
        .enumerate()
        .filter(|(index, _)| !present.contains(index))
        .map(|(_, signer)| signer.public_key.to_hex())
        .collect()
}

/// Combine partial signatures into one authorization for `payload`.
///
/// Fails on the first duplicate signer, unknown signer or invalid signature,
/// and when the distinct valid weight is below the threshold. The artifact is
/// laid out in config order regardless of the order of `signatures`.
pub fn aggregate(
    config: &MultisigConfig,
    payload: &[u8],
    signatures: &[PartialSignature],
) -> Result<AggregatedAuthorization, AuthorizationError> {
    let mut seen = HashSet::with_capacity(signatures.len());
    for partial in signatures {
        if !seen.insert(partial.signer) {
            return Err(AuthorizationError::DuplicateSigner {
                signer: partial.signer.to_hex(),
            });
        }
    }

    let mut by_position = BTreeMap::new();
    for partial in signatures {
        let position = config.position_of(&partial.signer).ok_or_else(|| {
            AuthorizationError::UnknownSigner {
                signer: partial.signer.to_hex(),
                address: config.address().to_string(),
            }
        })?;
        partial.verify(payload)?;
        by_position.insert(position, partial.signature);
    }

    let accumulated = by_position
        .keys()
        .map(|index| config.signers()[*index].weight as u32)
        .sum::<u32>();
    let required = config.threshold() as u32;
    let present: Vec<usize> = by_position.keys().copied().collect();

    if accumulated < required {
        return Err(AuthorizationError::InsufficientWeight {
            accumulated,
            required,
            missing: missing_signers(config, &present),
        });
    }

    let bitmap = present.iter().fold(0_u16, |bits, index| bits | (1 << index));
    info!(
        address = %config.address(),
        accumulated,
        required,
        participants = present.len(),
        "multisig authorization aggregated"
    );

    Ok(AggregatedAuthorization {
        address: config.address(),
        bitmap,
        signatures: by_position.into_values().collect(),
    })
}

/// Ask `agent` to sign `payload` as `signer` and verify the result locally.
pub async fn collect_signature(
    config: &MultisigConfig,
    payload: &[u8],
    signer: &PublicKey,
    agent: &dyn SignerAgent,
    policy: &ExternalCallPolicy,
) -> Result<PartialSignature, TollgateError> {
    if config.position_of(signer).is_none() {
        return Err(AuthorizationError::UnknownSigner {
            signer: signer.to_hex(),
            address: config.address().to_string(),
        }
        .into());
    }

    let bytes = policy.bounded("sign", agent.sign(payload, signer)).await?;
    let partial = PartialSignature::from_bytes(*signer, &bytes)?;
    partial.verify(payload)?;
    debug!(signer = %signer, "partial signature verified");
    Ok(partial)
}

/// Progress of signature collection for one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Unsigned,
    PartiallySigned { accumulated: u32, required: u32 },
    Satisfied { accumulated: u32 },
}

/// Accumulates verified partial signatures for one immutable payload.
///
/// There is no failure state: a collection that never reaches the threshold
/// stays `PartiallySigned` until the caller abandons it.
#[derive(Debug)]
pub struct SignatureCollector<'a> {
    config: &'a MultisigConfig,
    payload: Arc<[u8]>,
    collected: BTreeMap<usize, PartialSignature>,
}

impl<'a> SignatureCollector<'a> {
    pub fn new(config: &'a MultisigConfig, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            config,
            payload: payload.into(),
            collected: BTreeMap::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn accumulated_weight(&self) -> u32 {
        self.collected
            .keys()
            .map(|index| self.config.signers()[*index].weight as u32)
            .sum()
    }

    pub fn state(&self) -> CollectionState {
        let accumulated = self.accumulated_weight();
        let required = self.config.threshold() as u32;
        if self.collected.is_empty() {
            CollectionState::Unsigned
        } else if accumulated >= required {
            CollectionState::Satisfied { accumulated }
        } else {
            CollectionState::PartiallySigned {
                accumulated,
                required,
            }
        }
    }

    pub fn missing_signers(&self) -> Vec<PublicKey> {
        self.config
            .signers()
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.collected.contains_key(index))
            .map(|(_, signer)| signer.public_key)
            .collect()
    }

    /// Verify and record one signature.
    pub fn accept(&mut self, partial: PartialSignature) -> Result<CollectionState, AuthorizationError> {
        let position = self.config.position_of(&partial.signer).ok_or_else(|| {
            AuthorizationError::UnknownSigner {
                signer: partial.signer.to_hex(),
                address: self.config.address().to_string(),
            }
        })?;
        if self.collected.contains_key(&position) {
            return Err(AuthorizationError::DuplicateSigner {
                signer: partial.signer.to_hex(),
            });
        }
        partial.verify(&self.payload)?;

        debug!(signer = %partial.signer, position, "signature accepted");
        self.collected.insert(position, partial);
        Ok(self.state())
    }

    /// Request signatures from every listed signer concurrently.
    ///
    /// Successful signatures are recorded; per-signer failures are returned
    /// alongside rather than discarding the ones that succeeded.
    pub async fn collect_all(
        &mut self,
        agent: &dyn SignerAgent,
        signers: &[PublicKey],
        policy: &ExternalCallPolicy,
    ) -> Vec<(PublicKey, TollgateError)> {
        let payload = Arc::clone(&self.payload);
        let config = self.config;
        let results = join_all(signers.iter().map(|signer| {
            let payload = Arc::clone(&payload);
            async move {
                let result = collect_signature(config, &payload, signer, agent, policy).await;
                (*signer, result)
            }
        }))
        .await;

        let mut failures = Vec::new();
        for (signer, result) in results {
            match result.and_then(|partial| self.accept(partial).map_err(TollgateError::from)) {
                Ok(_) => {}
                Err(err) => {
                    warn!(signer = %signer, error = %err, "signature collection failed");
                    failures.push((signer, err));
                }
            }
        }
        failures
    }

    pub fn finish(&self) -> Result<AggregatedAuthorization, AuthorizationError> {
        let partials: Vec<PartialSignature> = self.collected.values().cloned().collect();
        aggregate(self.config, &self.payload, &partials)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer as _, SigningKey};
    use crate::error::ExternalError;

    pub(crate) fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub(crate) fn public_key(seed: u8) -> PublicKey {
        PublicKey(signing_key(seed).verifying_key())
    }

    pub(crate) fn config(weights: &[u8], threshold: u16) -> MultisigConfig {
        let signers = weights
            .iter()
            .enumerate()
            .map(|(i, w)| Signer::new(public_key(i as u8 + 1), *w))
            .collect();
        MultisigConfig::new(signers, threshold).unwrap()
    }

    pub(crate) fn sign(seed: u8, payload: &[u8]) -> PartialSignature {
        let key = signing_key(seed);
        PartialSignature {
            signer: PublicKey(key.verifying_key()),
            signature: key.sign(payload),
        }
    }

    struct SeedAgent;

    #[async_trait]
    impl SignerAgent for SeedAgent {
        async fn sign(&self, payload: &[u8], signer: &PublicKey) -> Result<Vec<u8>, ExternalError> {
            for seed in 1..=10 {
                let key = signing_key(seed);
                if key.verifying_key().as_bytes() == signer.as_bytes() {
                    return Ok(key.sign(payload).to_bytes().to_vec());
                }
            }
            Err(ExternalError::Signer {
                signer: signer.to_hex(),
                message: "no key".to_string(),
            })
        }
    }

    struct WrongPayloadAgent;

    #[async_trait]
    impl SignerAgent for WrongPayloadAgent {
        async fn sign(&self, _payload: &[u8], signer: &PublicKey) -> Result<Vec<u8>, ExternalError> {
            SeedAgent.sign(b"something else", signer).await
        }
    }

    #[test]
    fn config_construction_rejects_degenerate_sets() {
        assert_eq!(
            MultisigConfig::new(vec![], 1).unwrap_err(),
            ValidationError::EmptySignerSet
        );
        assert_eq!(
            MultisigConfig::new(vec![Signer::new(public_key(1), 1)], 0).unwrap_err(),
            ValidationError::ZeroThreshold
        );
        assert_eq!(
            MultisigConfig::new(vec![Signer::new(public_key(1), 0)], 1).unwrap_err(),
            ValidationError::ZeroWeight { index: 0 }
        );
        assert!(matches!(
            MultisigConfig::new(
                vec![Signer::new(public_key(1), 1), Signer::new(public_key(2), 2)],
                4
            ),
            Err(ValidationError::UnreachableThreshold {
                threshold: 4,
                total_weight: 3
            })
        ));
        assert!(matches!(
            MultisigConfig::new(
                vec![Signer::new(public_key(1), 1), Signer::new(public_key(1), 2)],
                2
            ),
            Err(ValidationError::DuplicatePublicKey { .. })
        ));
        let eleven = (1..=11).map(|s| Signer::new(public_key(s), 1)).collect();
        assert!(matches!(
            MultisigConfig::new(eleven, 1),
            Err(ValidationError::TooManySigners { count: 11, .. })
        ));
    }

    #[test]
    fn address_is_deterministic_and_order_sensitive() {
        let a = config(&[1, 1, 1], 2);
        let b = config(&[1, 1, 1], 2);
        assert_eq!(a.address(), b.address());
        assert_eq!(derive_address(&a), a.address());

        let mut reversed: Vec<Signer> = a.signers().to_vec();
        reversed.reverse();
        let c = MultisigConfig::new(reversed, 2).unwrap();
        assert_ne!(a.address(), c.address());
        assert_ne!(a, c);

        let d = config(&[1, 1, 1], 3);
        assert_ne!(a.address(), d.address());
        let e = config(&[1, 1, 2], 2);
        assert_ne!(a.address(), e.address());
    }

    #[test]
    fn addresses_match_ledger_vectors() {
        let key = public_key(7);
        assert_eq!(
            key.to_hex(),
            "0xea4a6c63e29c520abef5507b132ec5f9954776aebebe7b92421eea691446d22c"
        );
        assert_eq!(
            key.address().to_string(),
            "0xa0ccc8bcc83f6c628340134f8546a21e0618fd1aaa02432bba454c4a2c2233da"
        );

        let single = MultisigConfig::new(vec![Signer::new(key, 1)], 1).unwrap();
        assert_eq!(
            single.address().to_string(),
            "0x753c9a11d715e2813d10814e052e37a0caff0aa0507a3f066c39b50709bad164"
        );
        assert_eq!(
            config(&[1, 1, 1], 2).address().to_string(),
            "0xc89be3da99a6d04b32f1d18490210046412411d185a4817d62bb49d60f3d4d9d"
        );
    }

    #[test]
    fn address_round_trips_through_text() {
        let address = config(&[1, 2], 2).address();
        let parsed: Address = address.to_string().parse().unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn config_serde_revalidates() {
        let original = config(&[1, 2], 3);
        let json = serde_json::to_string(&original).unwrap();
        let back: MultisigConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);

        let bad = json.replace("\"threshold\":3", "\"threshold\":9");
        assert!(serde_json::from_str::<MultisigConfig>(&bad).is_err());
    }

    #[test]
    fn public_keys_parse_hex_and_flagged_base64() {
        let key = public_key(7);
        assert_eq!(PublicKey::parse(&key.to_hex()).unwrap(), key);
        let flagged = BASE64.encode(key.to_flagged_bytes());
        assert_eq!(PublicKey::parse(&flagged).unwrap(), key);
        let mut wrong_flag = key.to_flagged_bytes();
        wrong_flag[0] = 0x01;
        assert!(PublicKey::parse(&BASE64.encode(wrong_flag)).is_err());
    }

    #[test]
    fn aggregate_orders_by_config_not_arrival() {
        let cfg = config(&[1, 1, 1], 2);
        let payload = b"update default fees";
        let auth = aggregate(&cfg, payload, &[sign(3, payload), sign(1, payload)]).unwrap();

        assert_eq!(auth.bitmap(), 0b101);
        assert_eq!(auth.signatures()[0], sign(1, payload).signature);
        assert_eq!(auth.signatures()[1], sign(3, payload).signature);
        assert_eq!(auth.verify(&cfg, payload).unwrap(), 2);
    }

    #[test]
    fn aggregate_reports_exact_shortfall() {
        let cfg = config(&[1, 2, 3], 5);
        let payload = b"withdraw";
        let err = aggregate(&cfg, payload, &[sign(2, payload)]).unwrap_err();
        match err {
            AuthorizationError::InsufficientWeight {
                accumulated,
                required,
                ref missing,
            } => {
                assert_eq!((accumulated, required), (2, 5));
                assert_eq!(err.shortfall(), 3);
                assert_eq!(missing.len(), 2);
                assert!(missing.contains(&public_key(1).to_hex()));
                assert!(missing.contains(&public_key(3).to_hex()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn aggregate_rejects_duplicates_even_when_invalid() {
        let cfg = config(&[1, 1], 1);
        let payload = b"p";
        let forged = PartialSignature {
            signer: public_key(1),
            signature: sign(2, payload).signature,
        };
        let err = aggregate(&cfg, payload, &[forged, sign(1, payload)]).unwrap_err();
        assert!(matches!(err, AuthorizationError::DuplicateSigner { .. }));
    }

    #[test]
    fn aggregate_rejects_signature_over_other_payload() {
        let cfg = config(&[1, 1], 1);
        let err = aggregate(&cfg, b"real", &[sign(1, b"other")]).unwrap_err();
        assert!(matches!(err, AuthorizationError::SignatureMismatch { .. }));
    }

    #[test]
    fn aggregate_rejects_outsiders() {
        let cfg = config(&[1, 1], 1);
        let err = aggregate(&cfg, b"p", &[sign(9, b"p")]).unwrap_err();
        assert!(matches!(err, AuthorizationError::UnknownSigner { .. }));
    }

    #[test]
    fn artifact_wire_form_round_trips_and_detects_tampering() {
        let cfg = config(&[2, 1, 1], 3);
        let payload = b"enable version 2";
        let auth = aggregate(&cfg, payload, &[sign(1, payload), sign(2, payload)]).unwrap();

        let bytes = auth.to_bytes();
        assert_eq!(&bytes[..2], &0b011_u16.to_le_bytes());
        assert_eq!(bytes.len(), 2 + 2 * 65);

        let decoded = AggregatedAuthorization::from_base64(&cfg, &auth.to_base64()).unwrap();
        assert_eq!(decoded, auth);
        assert_eq!(decoded.verify(&cfg, payload).unwrap(), 3);

        let mut tampered = bytes.clone();
        tampered[0] = 0b110;
        let tampered = AggregatedAuthorization::from_bytes(&cfg, &tampered).unwrap();
        assert!(tampered.verify(&cfg, payload).is_err());

        assert!(decoded.verify(&cfg, b"enable version 3").is_err());
    }

    #[test]
    fn partial_signature_base64_round_trip() {
        let partial = sign(4, b"payload");
        let decoded = PartialSignature::from_base64(&partial.to_base64()).unwrap();
        assert_eq!(decoded, partial);
        assert!(PartialSignature::from_base64("AAAA").is_err());
    }

    #[test]
    fn collector_walks_the_state_machine() {
        let cfg = config(&[1, 1, 1], 2);
        let payload = b"create tickets".to_vec();
        let mut collector = SignatureCollector::new(&cfg, payload.clone());
        assert_eq!(collector.state(), CollectionState::Unsigned);
        assert!(collector.finish().is_err());

        let state = collector.accept(sign(2, &payload)).unwrap();
        assert_eq!(
            state,
            CollectionState::PartiallySigned {
                accumulated: 1,
                required: 2
            }
        );
        assert!(matches!(
            collector.accept(sign(2, &payload)),
            Err(AuthorizationError::DuplicateSigner { .. })
        ));
        assert!(collector.accept(sign(3, b"tampered")).is_err());
        assert_eq!(collector.missing_signers(), vec![public_key(1), public_key(3)]);

        let state = collector.accept(sign(1, &payload)).unwrap();
        assert_eq!(state, CollectionState::Satisfied { accumulated: 2 });
        assert_eq!(collector.finish().unwrap().bitmap(), 0b011);
    }

    #[tokio::test]
    async fn collect_signature_verifies_agent_output() {
        let cfg = config(&[1, 1], 2);
        let policy = ExternalCallPolicy::default();
        let payload = b"bytes";

        let partial = collect_signature(&cfg, payload, &public_key(1), &SeedAgent, &policy)
            .await
            .unwrap();
        assert!(partial.verify(payload).is_ok());

        let err = collect_signature(&cfg, payload, &public_key(1), &WrongPayloadAgent, &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TollgateError::Authorization(AuthorizationError::SignatureMismatch { .. })
        ));

        let err = collect_signature(&cfg, payload, &public_key(9), &SeedAgent, &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TollgateError::Authorization(AuthorizationError::UnknownSigner { .. })
        ));
    }

    #[tokio::test]
    async fn collect_all_keeps_partial_progress() {
        let cfg = config(&[1, 1, 1], 2);
        let mut collector = SignatureCollector::new(&cfg, b"batch".to_vec());
        let outsider = public_key(42);
        let failures = collector
            .collect_all(
                &SeedAgent,
                &[public_key(1), outsider, public_key(3)],
                &ExternalCallPolicy::default(),
            )
            .await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, outsider);
        assert_eq!(collector.state(), CollectionState::Satisfied { accumulated: 2 });
    }
}
