//! Command implementations. Each returns the text to print.

use crate::config::TollgateConfig;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Subcommand;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tollgate_adapters::{InMemoryLedger, LocalKeySigner};
use tollgate_core::{
    aggregate, build_pool_fee_config, collect_signature, encode_rate_decimal, issue_tickets,
    load_tickets, locate_fee_bags, parse_ticket_ids, reconcile_from_ledger, ActionType,
    AggregatedAuthorization, CapabilityCredential, FeeBag, PartialSignature, RequestAssembler,
};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the configured multisig address and signer set
    Address,

    /// Encode percentages onto the on-ledger fee grid
    EncodeFee {
        #[arg(required = true, allow_hyphen_values = true)]
        percents: Vec<String>,
    },

    /// Validate the configured default and pool-specific fee configs
    FeeConfig,

    /// Assemble a ticket-creation request for offline signing
    CreateTickets {
        #[arg(long)]
        action: ActionType,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Sign a request payload with a local key
    Sign {
        /// Base64 payload printed by a request-building command
        #[arg(long)]
        payload: String,

        /// Hex-encoded 32-byte ed25519 seed
        #[arg(long, env = "TOLLGATE_SIGNER_KEY", hide_env_values = true)]
        key: String,
    },

    /// Verify and combine partial signatures into one authorization
    Combine {
        #[arg(long)]
        payload: String,

        #[arg(long = "sig", required = true)]
        signatures: Vec<String>,
    },

    /// Reconcile a fee bag against tickets using a ledger fixture
    PlanWithdrawals {
        #[arg(long)]
        bag: FeeBag,

        /// Comma-separated ticket ids
        #[arg(long)]
        tickets: String,

        #[arg(long)]
        fixture: PathBuf,
    },
}

pub async fn execute(command: &Command, config: &TollgateConfig) -> Result<String> {
    match command {
        Command::Address => address(config),
        Command::EncodeFee { percents } => encode_fee(percents),
        Command::FeeConfig => fee_config(config),
        Command::CreateTickets { action, count } => create_tickets(config, *action, *count),
        Command::Sign { payload, key } => sign(config, payload, key).await,
        Command::Combine {
            payload,
            signatures,
        } => combine(config, payload, signatures),
        Command::PlanWithdrawals {
            bag,
            tickets,
            fixture,
        } => plan_withdrawals(config, *bag, tickets, fixture).await,
    }
}

fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload.trim())
        .context("payload is not valid base64")
}

fn address(config: &TollgateConfig) -> Result<String> {
    let multisig = config.multisig_config()?;
    let mut out = String::new();
    writeln!(out, "address:   {}", multisig.address())?;
    writeln!(
        out,
        "threshold: {} of {}",
        multisig.threshold(),
        multisig.total_weight()
    )?;
    for (index, signer) in multisig.signers().iter().enumerate() {
        writeln!(
            out,
            "signer {index}: {} weight {} (address {})",
            signer.public_key,
            signer.weight,
            signer.public_key.address()
        )?;
    }
    Ok(out)
}

fn encode_fee(percents: &[String]) -> Result<String> {
    let mut out = String::new();
    let mut rejected = 0;
    for input in percents {
        match encode_rate_decimal(input) {
            Ok(rate) => writeln!(out, "{input}% -> {}", rate.raw())?,
            Err(err) => {
                rejected += 1;
                writeln!(out, "{input}% -> rejected: {err}")?;
            }
        }
    }
    if rejected > 0 {
        bail!("{out}{rejected} of {} values rejected", percents.len());
    }
    Ok(out)
}

fn fee_config(config: &TollgateConfig) -> Result<String> {
    let mut out = String::new();
    let mut failed = false;

    match &config.fees.default {
        Some(params) => match build_pool_fee_config(params) {
            Ok(encoded) => writeln!(out, "default: {:?}", encoded.raw_values())?,
            Err(err) => {
                failed = true;
                writeln!(out, "default: {err}")?;
            }
        },
        None => writeln!(out, "default: not configured")?,
    }

    for entry in &config.fees.pools {
        let label = format!("{} ({}/{})", entry.pool, entry.base_asset, entry.quote_asset);
        match entry.encode() {
            Ok(encoded) => writeln!(out, "{label}: {:?}", encoded.raw_values())?,
            Err(err) => {
                failed = true;
                writeln!(out, "{label}: {err}")?;
            }
        }
    }

    if failed {
        bail!("{out}fee configuration is invalid");
    }
    Ok(out)
}

fn create_tickets(config: &TollgateConfig, action: ActionType, count: usize) -> Result<String> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let objects = config.protocol_objects()?.clone();
    let capability = CapabilityCredential::new(objects.admin_cap.clone());
    let assembler = RequestAssembler::new(objects, config.multisig_config()?);

    let mut builder = assembler.builder();
    builder.create_tickets(&issue_tickets(action, count, &capability));
    let bundle = builder.build()?;

    let mut out = String::new();
    writeln!(out, "sender:  {}", bundle.sender())?;
    writeln!(out, "tickets: {count} x {action} ({})", action.move_helper())?;
    writeln!(out, "digest:  {}", bundle.digest())?;
    writeln!(out, "payload: {}", bundle.payload_base64())?;
    Ok(out)
}

async fn sign(config: &TollgateConfig, payload: &str, key: &str) -> Result<String> {
    let multisig = config.multisig_config()?;
    let payload = decode_payload(payload)?;
    let signer = LocalKeySigner::from_seed_hex(key)?;
    let public_key = signer
        .public_keys()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no signing key loaded"))?;

    let partial = collect_signature(
        &multisig,
        &payload,
        &public_key,
        &signer,
        &config.call_policy(),
    )
    .await?;
    Ok(format!("{}\n", partial.to_base64()))
}

fn combine(config: &TollgateConfig, payload: &str, signatures: &[String]) -> Result<String> {
    let multisig = config.multisig_config()?;
    let payload = decode_payload(payload)?;
    let partials = signatures
        .iter()
        .map(|encoded| PartialSignature::from_base64(encoded))
        .collect::<Result<Vec<_>, _>>()?;

    let authorization = aggregate(&multisig, &payload, &partials)?;
    let weight = authorization.verify(&multisig, &payload)?;
    render_authorization(&authorization, weight, multisig.threshold())
}

fn render_authorization(
    authorization: &AggregatedAuthorization,
    weight: u32,
    threshold: u16,
) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "address:       {}", authorization.address())?;
    writeln!(out, "weight:        {weight} (threshold {threshold})")?;
    writeln!(out, "bitmap:        {:#012b}", authorization.bitmap())?;
    writeln!(out, "authorization: {}", authorization.to_base64())?;
    Ok(out)
}

async fn plan_withdrawals(
    config: &TollgateConfig,
    bag: FeeBag,
    tickets: &str,
    fixture: &Path,
) -> Result<String> {
    let objects = config.protocol_objects()?;
    let policy = config.call_policy();
    let ledger = InMemoryLedger::from_fixture_path(fixture)?;

    let ids = parse_ticket_ids(tickets, 1)?;
    let tickets = load_tickets(&ledger, &ids, &policy).await?;
    let bags = locate_fee_bags(&ledger, &objects.treasury, &policy).await?;
    let plan = reconcile_from_ledger(&ledger, bags.get(bag), bag.action(), tickets, &policy).await?;

    let mut out = String::new();
    if plan.is_empty() {
        writeln!(out, "{} is empty, nothing to withdraw", bag.field_name())?;
        return Ok(out);
    }
    for planned in &plan.withdrawals {
        writeln!(out, "withdraw {} with ticket {}", planned.entry, planned.ticket.id)?;
    }
    for deferred in &plan.deferred {
        writeln!(out, "deferred {}: {}", deferred.entry, deferred.reason)?;
    }
    for unused in &plan.unused_tickets {
        writeln!(out, "unused ticket {}", unused.id)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SEEDS: [[u8; 32]; 2] = [[7; 32], [8; 32]];

    fn seed_hex(seed: [u8; 32]) -> String {
        seed.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn config_text() -> String {
        let mut text = String::from(
            r#"
[objects]
package = "0xabc"
treasury = "0x71"
multisig_config = "0x72"
admin_cap = "0x73"
trading_fee_config = "0x74"
pool_creation_config = "0x75"
loyalty_program = "0x76"
loyalty_admin_cap = "0x77"

[multisig]
threshold = 2
"#,
        );
        for seed in SEEDS {
            let key = LocalKeySigner::from_seed(seed).public_keys()[0];
            text.push_str(&format!(
                "\n[[multisig.signers]]\npublic_key = \"{}\"\nweight = 1\n",
                key.to_hex()
            ));
        }
        text
    }

    fn load(text: &str) -> (TollgateConfig, tempfile::NamedTempFile) {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let config = TollgateConfig::load(Some(file.path())).unwrap();
        (config, file)
    }

    fn field<'a>(output: &'a str, name: &str) -> &'a str {
        output
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(str::trim)
            .unwrap()
    }

    #[tokio::test]
    async fn encode_fee_reports_each_value() {
        let ok = execute(
            &Command::EncodeFee {
                percents: vec!["0.2".into(), "25".into()],
            },
            &TollgateConfig::default(),
        )
        .await
        .unwrap();
        assert!(ok.contains("0.2% -> 2000000"));
        assert!(ok.contains("25% -> 250000000"));

        let err = execute(
            &Command::EncodeFee {
                percents: vec!["0.1999999".into(), "0.07".into()],
            },
            &TollgateConfig::default(),
        )
        .await
        .unwrap_err()
        .to_string();
        assert!(err.contains("0.07% -> 700000"));
        assert!(err.contains("1 of 2 values rejected"));
    }

    #[tokio::test]
    async fn tickets_sign_and_combine() {
        let (config, _file) = load(&config_text());

        let built = execute(
            &Command::CreateTickets {
                action: ActionType::WithdrawProtocolFee,
                count: 2,
            },
            &config,
        )
        .await
        .unwrap();
        let payload = field(&built, "payload:").to_string();

        let mut signatures = Vec::new();
        for seed in SEEDS {
            let signed = execute(
                &Command::Sign {
                    payload: payload.clone(),
                    key: seed_hex(seed),
                },
                &config,
            )
            .await
            .unwrap();
            signatures.push(signed.trim().to_string());
        }

        let combined = execute(
            &Command::Combine {
                payload: payload.clone(),
                signatures: signatures.clone(),
            },
            &config,
        )
        .await
        .unwrap();
        assert!(combined.contains("weight:        2 (threshold 2)"));
        assert_eq!(
            field(&combined, "address:"),
            config.multisig_config().unwrap().address().to_string()
        );

        let short = execute(
            &Command::Combine {
                payload,
                signatures: signatures[..1].to_vec(),
            },
            &config,
        )
        .await
        .unwrap_err();
        assert!(short.to_string().contains("short by 1"));
    }

    #[tokio::test]
    async fn outsider_key_cannot_sign() {
        let (config, _file) = load(&config_text());
        let err = execute(
            &Command::Sign {
                payload: BASE64.encode(b"anything"),
                key: seed_hex([9; 32]),
            },
            &config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("is not a member"));
    }

    #[tokio::test]
    async fn plan_withdrawals_from_fixture() {
        let (config, _file) = load(&config_text());
        let fixture = r#"{
            "objects": [
                {
                    "id": "0x71",
                    "type_tag": "0xabc::treasury::Treasury",
                    "version": 1,
                    "fields": {
                        "protocol_fees": { "fields": { "id": { "id": "0xb1" } } },
                        "deep_reserves_coverage_fees": { "fields": { "id": { "id": "0xb2" } } }
                    }
                },
                {
                    "id": "0x501",
                    "type_tag": "0xabc::ticket::Ticket",
                    "version": 1,
                    "fields": { "ticket_type": "WithdrawCoverageFee", "created_at_ms": 1700000000000 }
                }
            ],
            "balances": {
                "0xb2": [
                    { "asset_type": "0x2::sui::SUI", "raw_amount": 500 },
                    { "asset_type": "0xdee::deep::DEEP", "raw_amount": 42 }
                ]
            },
            "metadata": {
                "0x2::sui::SUI": { "symbol": "SUI", "decimals": 2 },
                "0xdee::deep::DEEP": { "symbol": "DEEP", "decimals": 0 }
            }
        }"#;
        let mut fixture_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        fixture_file.write_all(fixture.as_bytes()).unwrap();

        let out = execute(
            &Command::PlanWithdrawals {
                bag: FeeBag::CoverageFees,
                tickets: "0x501".into(),
                fixture: fixture_file.path().to_path_buf(),
            },
            &config,
        )
        .await
        .unwrap();

        assert!(out.contains("withdraw 5 SUI with ticket"));
        assert!(out.contains("deferred 42 DEEP"));
    }

    #[tokio::test]
    async fn fee_config_without_fees_is_fine() {
        let (config, _file) = load(&config_text());
        let out = execute(&Command::FeeConfig, &config).await.unwrap();
        assert!(out.contains("default: not configured"));
    }
}
