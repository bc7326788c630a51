//! Fixed-point fee rate codec.
//!
//! Fee parameters travel on-ledger as integers where `10_000_000` raw units are
//! one percent and `1_000_000_000` is one hundred percent. The program only
//! accepts multiples of [`FEE_PRECISION_MULTIPLE`], so every conversion from a
//! human percentage is rounded to the nearest raw unit (half away from zero)
//! and then checked against that grid. Off-grid inputs are rejected, never
//! snapped.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw units per one percent.
pub const FEE_SCALE: u64 = 10_000_000;

/// Raw value of 100%.
pub const PRECISION_MAX: u64 = 1_000_000_000;

/// Minimum granularity in raw units (0.0001%).
pub const FEE_PRECISION_MULTIPLE: u64 = 1_000;

const FEE_SCALE_DIGITS: usize = 7;

/// A validated fee rate on the quantization grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct FeeRate(u64);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);
    pub const MAX: FeeRate = FeeRate(PRECISION_MAX);

    /// Accept an already-scaled raw value, applying the same grid and range checks.
    pub fn from_raw(raw: u64) -> Result<Self, ValidationError> {
        check_grid(raw as i128, || format_raw_percent(raw as i128))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Lossy percentage, for display and arithmetic outside the ledger.
    pub fn as_percent(self) -> f64 {
        decode_rate(self)
    }

    /// Exact decimal rendering of the percentage, without the `%` sign.
    pub fn percent_string(self) -> String {
        format_raw_percent(self.0 as i128)
    }
}

impl TryFrom<u64> for FeeRate {
    type Error = ValidationError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<FeeRate> for u64 {
    fn from(rate: FeeRate) -> Self {
        rate.0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent_string())
    }
}

/// Encode a human percentage (`0.2` for 0.2%, `100` for 100%).
///
/// The scaled value is rounded before the grid check so binary floating-point
/// noise such as `0.2 * 10_000_000 = 1999999.9999…` still lands on `2_000_000`,
/// while an intended value like `0.1999999` (raw `1_999_999`) is rejected.
pub fn encode_rate(percent: f64) -> Result<FeeRate, ValidationError> {
    if !percent.is_finite() {
        return Err(ValidationError::NonFinitePercent { percent });
    }

    let scaled = (percent * FEE_SCALE as f64).round();
    // `as` saturates; anything past u64 is out of range regardless of grid.
    let raw = scaled as i128;
    if raw.unsigned_abs() > u64::MAX as u128 {
        return Err(ValidationError::Range {
            percent: percent.to_string(),
            raw,
            max: PRECISION_MAX,
        });
    }

    check_grid(raw, || percent.to_string())
}

/// Encode a decimal percentage string exactly, without going through `f64`.
///
/// Accepts an optional sign and an optional trailing `%`. Digits past the
/// seventh fractional place are rounded half away from zero, matching
/// [`encode_rate`].
pub fn encode_rate_decimal(input: &str) -> Result<FeeRate, ValidationError> {
    let raw = parse_decimal_raw(input)?;
    check_grid(raw, || input.trim().trim_end_matches('%').to_string())
}

/// Decode a rate back into a percentage.
pub fn decode_rate(rate: FeeRate) -> f64 {
    rate.0 as f64 / FEE_SCALE as f64
}

fn check_grid(raw: i128, percent: impl Fn() -> String) -> Result<FeeRate, ValidationError> {
    if raw % FEE_PRECISION_MULTIPLE as i128 != 0 {
        return Err(ValidationError::Precision {
            percent: percent(),
            raw,
            granularity: FEE_PRECISION_MULTIPLE,
        });
    }

    if raw < 0 || raw > PRECISION_MAX as i128 {
        return Err(ValidationError::Range {
            percent: percent(),
            raw,
            max: PRECISION_MAX,
        });
    }

    Ok(FeeRate(raw as u64))
}

fn parse_decimal_raw(input: &str) -> Result<i128, ValidationError> {
    let malformed = |reason: &str| ValidationError::MalformedPercent {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim().trim_end_matches('%').trim_end();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (unsigned, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(malformed("no digits"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed("expected decimal digits"));
    }
    if int_part.trim_start_matches('0').len() > 18 {
        return Err(malformed("magnitude too large"));
    }

    let whole: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| malformed("integer part does not parse"))?
    };

    let (kept, rest) = frac_part.split_at(frac_part.len().min(FEE_SCALE_DIGITS));
    let mut fraction: i128 = if kept.is_empty() {
        0
    } else {
        kept.parse()
            .map_err(|_| malformed("fraction does not parse"))?
    };
    for _ in kept.len()..FEE_SCALE_DIGITS {
        fraction *= 10;
    }

    let mut magnitude = whole * FEE_SCALE as i128 + fraction;
    if rest.as_bytes().first().is_some_and(|digit| *digit >= b'5') {
        magnitude += 1;
    }

    Ok(if negative { -magnitude } else { magnitude })
}

fn format_raw_percent(raw: i128) -> String {
    let sign = if raw < 0 { "-" } else { "" };
    let magnitude = raw.unsigned_abs();
    let whole = magnitude / FEE_SCALE as u128;
    let fraction = magnitude % FEE_SCALE as u128;
    if fraction == 0 {
        return format!("{sign}{whole}");
    }
    let digits = format!("{fraction:0width$}", width = FEE_SCALE_DIGITS);
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}

/// Fields of a [`PoolFeeConfig`], in on-ledger argument order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolFeeField {
    PrimaryAssetTaker,
    PrimaryAssetMaker,
    InputAssetTaker,
    InputAssetMaker,
    MaxDiscount,
}

impl PoolFeeField {
    pub const ALL: [PoolFeeField; 5] = [
        Self::PrimaryAssetTaker,
        Self::PrimaryAssetMaker,
        Self::InputAssetTaker,
        Self::InputAssetMaker,
        Self::MaxDiscount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PrimaryAssetTaker => "primary_asset_taker_rate",
            Self::PrimaryAssetMaker => "primary_asset_maker_rate",
            Self::InputAssetTaker => "input_asset_taker_rate",
            Self::InputAssetMaker => "input_asset_maker_rate",
            Self::MaxDiscount => "max_discount_rate",
        }
    }
}

impl fmt::Display for PoolFeeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-facing pool fee input, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolFeeParams {
    pub primary_asset_taker_rate: f64,
    pub primary_asset_maker_rate: f64,
    pub input_asset_taker_rate: f64,
    pub input_asset_maker_rate: f64,
    pub max_discount_rate: f64,
}

impl PoolFeeParams {
    pub fn get(&self, field: PoolFeeField) -> f64 {
        match field {
            PoolFeeField::PrimaryAssetTaker => self.primary_asset_taker_rate,
            PoolFeeField::PrimaryAssetMaker => self.primary_asset_maker_rate,
            PoolFeeField::InputAssetTaker => self.input_asset_taker_rate,
            PoolFeeField::InputAssetMaker => self.input_asset_maker_rate,
            PoolFeeField::MaxDiscount => self.max_discount_rate,
        }
    }
}

/// One atomic unit of pool fee configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFeeConfig {
    pub primary_asset_taker_rate: FeeRate,
    pub primary_asset_maker_rate: FeeRate,
    pub input_asset_taker_rate: FeeRate,
    pub input_asset_maker_rate: FeeRate,
    pub max_discount_rate: FeeRate,
}

impl PoolFeeConfig {
    pub fn get(&self, field: PoolFeeField) -> FeeRate {
        match field {
            PoolFeeField::PrimaryAssetTaker => self.primary_asset_taker_rate,
            PoolFeeField::PrimaryAssetMaker => self.primary_asset_maker_rate,
            PoolFeeField::InputAssetTaker => self.input_asset_taker_rate,
            PoolFeeField::InputAssetMaker => self.input_asset_maker_rate,
            PoolFeeField::MaxDiscount => self.max_discount_rate,
        }
    }

    /// Raw values in argument order.
    pub fn raw_values(&self) -> [u64; 5] {
        PoolFeeField::ALL.map(|field| self.get(field).raw())
    }
}

/// Encode all five fields, reporting every field that fails.
pub fn build_pool_fee_config(params: &PoolFeeParams) -> Result<PoolFeeConfig, ValidationError> {
    let mut encoded = [FeeRate::ZERO; 5];
    let mut failures = Vec::new();

    for (slot, field) in encoded.iter_mut().zip(PoolFeeField::ALL) {
        match encode_rate(params.get(field)) {
            Ok(rate) => *slot = rate,
            Err(err) => failures.push((field, Box::new(err))),
        }
    }

    if !failures.is_empty() {
        return Err(ValidationError::PoolFeeConfig { failures });
    }

    let [primary_asset_taker_rate, primary_asset_maker_rate, input_asset_taker_rate, input_asset_maker_rate, max_discount_rate] =
        encoded;
    Ok(PoolFeeConfig {
        primary_asset_taker_rate,
        primary_asset_maker_rate,
        input_asset_taker_rate,
        input_asset_maker_rate,
        max_discount_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> PoolFeeParams {
        PoolFeeParams {
            primary_asset_taker_rate: 0.06,
            primary_asset_maker_rate: 0.03,
            input_asset_taker_rate: 0.05,
            input_asset_maker_rate: 0.02,
            max_discount_rate: 25.0,
        }
    }

    #[test]
    fn boundaries_encode_exactly() {
        assert_eq!(encode_rate(0.0).unwrap().raw(), 0);
        assert_eq!(encode_rate(100.0).unwrap().raw(), PRECISION_MAX);
        assert_eq!(encode_rate(0.0001).unwrap().raw(), FEE_PRECISION_MULTIPLE);
    }

    #[test]
    fn float_noise_is_tolerated() {
        assert_eq!(encode_rate(0.2).unwrap().raw(), 2_000_000);
        assert_eq!(encode_rate(0.07).unwrap().raw(), 700_000);
        assert_eq!(encode_rate(0.06).unwrap().raw(), 600_000);
        assert_eq!(encode_rate(0.29).unwrap().raw(), 2_900_000);
        assert_eq!(encode_rate(25.0).unwrap().raw(), 250_000_000);
    }

    #[test]
    fn off_grid_values_fail_with_precision_error() {
        let err = encode_rate(0.1999999).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Precision { raw: 1_999_999, .. }
        ));

        assert!(matches!(
            encode_rate(0.00015),
            Err(ValidationError::Precision { raw: 1_500, .. })
        ));
    }

    #[test]
    fn ties_round_half_away_from_zero() {
        // 2^-8 percent scales to exactly 39062.5 raw units.
        let err = encode_rate(0.00390625).unwrap_err();
        assert!(matches!(err, ValidationError::Precision { raw: 39_063, .. }));

        let err = encode_rate(-0.00390625).unwrap_err();
        assert!(matches!(err, ValidationError::Precision { raw: -39_063, .. }));

        let err = encode_rate_decimal("0.00000005").unwrap_err();
        assert!(matches!(err, ValidationError::Precision { raw: 1, .. }));
    }

    #[test]
    fn grid_check_runs_before_range_check() {
        assert!(matches!(
            encode_rate(100.00001),
            Err(ValidationError::Precision { .. })
        ));
        assert!(matches!(
            encode_rate(100.0001),
            Err(ValidationError::Range {
                raw: 1_000_001_000,
                ..
            })
        ));
        assert!(matches!(
            encode_rate(-0.0001),
            Err(ValidationError::Range { raw: -1_000, .. })
        ));
    }

    #[test]
    fn non_finite_and_huge_inputs_are_rejected() {
        assert!(matches!(
            encode_rate(f64::NAN),
            Err(ValidationError::NonFinitePercent { .. })
        ));
        assert!(matches!(
            encode_rate(f64::INFINITY),
            Err(ValidationError::NonFinitePercent { .. })
        ));
        assert!(matches!(
            encode_rate(1e300),
            Err(ValidationError::Range { .. })
        ));
    }

    #[test]
    fn decimal_strings_encode_without_float_error() {
        assert_eq!(encode_rate_decimal("0.2").unwrap().raw(), 2_000_000);
        assert_eq!(encode_rate_decimal("0.2%").unwrap().raw(), 2_000_000);
        assert_eq!(encode_rate_decimal("100").unwrap().raw(), PRECISION_MAX);
        assert_eq!(encode_rate_decimal(".5").unwrap().raw(), 5_000_000);
        assert_eq!(encode_rate_decimal("0.00009999").unwrap().raw(), 1_000);
        assert!(matches!(
            encode_rate_decimal("0.1999999"),
            Err(ValidationError::Precision { raw: 1_999_999, .. })
        ));
        assert!(matches!(
            encode_rate_decimal("abc"),
            Err(ValidationError::MalformedPercent { .. })
        ));
        assert!(matches!(
            encode_rate_decimal("-"),
            Err(ValidationError::MalformedPercent { .. })
        ));
    }

    #[test]
    fn raw_values_are_revalidated() {
        assert!(FeeRate::from_raw(250_000_000).is_ok());
        assert!(FeeRate::from_raw(1_999_999).is_err());
        assert!(FeeRate::from_raw(PRECISION_MAX + FEE_PRECISION_MULTIPLE).is_err());
        assert!(serde_json::from_str::<FeeRate>("1999999").is_err());
        assert_eq!(serde_json::from_str::<FeeRate>("600000").unwrap().raw(), 600_000);
    }

    #[test]
    fn display_is_exact() {
        assert_eq!(encode_rate(0.06).unwrap().to_string(), "0.06%");
        assert_eq!(FeeRate::MAX.to_string(), "100%");
        assert_eq!(FeeRate::ZERO.to_string(), "0%");
        assert_eq!(encode_rate(12.3456).unwrap().percent_string(), "12.3456");
    }

    #[test]
    fn round_trip_stays_within_granularity() {
        for percent in [0.0, 0.0001, 0.06, 0.2, 12.3456, 99.9999, 100.0] {
            let decoded = decode_rate(encode_rate(percent).unwrap());
            assert!((decoded - percent).abs() < 0.0001 / 2.0);
        }
    }

    #[test]
    fn pool_fee_config_in_argument_order() {
        let config = build_pool_fee_config(&default_params()).unwrap();
        assert_eq!(
            config.raw_values(),
            [600_000, 300_000, 500_000, 200_000, 250_000_000]
        );
    }

    #[test]
    fn pool_fee_config_reports_each_failing_field() {
        let mut params = default_params();
        params.primary_asset_maker_rate = 0.000_01;
        params.max_discount_rate = 120.0;

        match build_pool_fee_config(&params) {
            Err(ValidationError::PoolFeeConfig { failures }) => {
                let fields: Vec<_> = failures.iter().map(|(field, _)| *field).collect();
                assert_eq!(
                    fields,
                    vec![PoolFeeField::PrimaryAssetMaker, PoolFeeField::MaxDiscount]
                );
                assert!(matches!(*failures[0].1, ValidationError::Precision { .. }));
                assert!(matches!(*failures[1].1, ValidationError::Range { .. }));
            }
            other => panic!("expected field failures, got {other:?}"),
        }
    }
}
