//! Rounding / anomaly heuristic
//!
//! Looks at how "round" the filtered amounts are. Natural amounts have a
//! roughly uniform last digit and few trailing zeros; negotiated or padded
//! amounts cluster on round thousands and millions.
//!
//! The score is a weighted mix of two saturating signals:
//!
//! ```text
//! dev    = ½ Σ |share(digit d) − 0.1|                 (total variation distance)
//! excess = max(0, share(≥ k trailing zeros) − expected)
//! score  = 100 · (wd·min(1, dev/sd) + wz·min(1, excess/sz)) / (wd + wz)
//! ```
//!
//! Every threshold lives in [`RoundingPolicy`], loaded from the `[rounding]`
//! config table.

use crate::query::histogram::AmountSample;
use crate::types::MINOR_PER_MAJOR;
use serde::{Deserialize, Serialize};

/// Highest trailing-zero bucket; it also counts amounts with more zeros
pub const MAX_TRAILING_ZEROS: usize = 9;

/// A named "rounded to" bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundingBucket {
    /// Display label
    pub label: String,
    /// Whole-unit divisor an amount must be a multiple of
    pub divisor: u64,
    /// Share above which the bucket alone flags the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspicious_share: Option<f64>,
}

impl RoundingBucket {
    fn new(label: &str, divisor: u64, suspicious_share: Option<f64>) -> Self {
        Self {
            label: label.to_string(),
            divisor,
            suspicious_share,
        }
    }
}

/// Thresholds and weights of the heuristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundingPolicy {
    /// Rounding buckets, smallest divisor first
    pub buckets: Vec<RoundingBucket>,
    /// Weight of the last-digit signal
    pub digit_weight: f64,
    /// Weight of the trailing-zero signal
    pub trailing_zero_weight: f64,
    /// Deviation at which the digit signal saturates
    pub digit_deviation_saturation: f64,
    /// Deviation that alone flags the sample
    pub digit_deviation_threshold: f64,
    /// Trailing zeros an amount needs to count as "round"
    pub trailing_zero_minimum: u32,
    /// Share of round amounts expected in natural data
    pub trailing_zero_expected_share: f64,
    /// Excess share at which the trailing-zero signal saturates
    pub trailing_zero_saturation: f64,
    /// Score at or above which the sample is suspicious
    pub suspicion_threshold: f64,
    /// Smallest sample that can be flagged
    pub minimum_sample: u64,
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        Self {
            buckets: vec![
                RoundingBucket::new("thousand", 1_000, None),
                RoundingBucket::new("ten_thousand", 10_000, None),
                RoundingBucket::new("hundred_thousand", 100_000, Some(0.35)),
                RoundingBucket::new("million", 1_000_000, Some(0.20)),
            ],
            digit_weight: 0.6,
            trailing_zero_weight: 0.4,
            digit_deviation_saturation: 0.5,
            digit_deviation_threshold: 0.15,
            trailing_zero_minimum: 3,
            trailing_zero_expected_share: 0.001,
            trailing_zero_saturation: 0.5,
            suspicion_threshold: 50.0,
            minimum_sample: 30,
        }
    }
}

impl RoundingPolicy {
    /// Validate the policy table
    pub fn validate(&self) -> Result<(), String> {
        if self.buckets.is_empty() {
            return Err("rounding.buckets must not be empty".to_string());
        }
        for bucket in &self.buckets {
            if bucket.divisor == 0 {
                return Err(format!("rounding bucket '{}' has a zero divisor", bucket.label));
            }
            if let Some(share) = bucket.suspicious_share {
                if !(share > 0.0 && share <= 1.0) {
                    return Err(format!(
                        "rounding bucket '{}' suspicious_share must be in (0, 1]",
                        bucket.label
                    ));
                }
            }
        }
        if self.digit_weight < 0.0
            || self.trailing_zero_weight < 0.0
            || self.digit_weight + self.trailing_zero_weight <= 0.0
        {
            return Err("rounding weights must be non-negative with a positive sum".to_string());
        }
        if self.digit_deviation_saturation <= 0.0 || self.trailing_zero_saturation <= 0.0 {
            return Err("rounding saturations must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&self.suspicion_threshold) {
            return Err("rounding.suspicion_threshold must be within 0..=100".to_string());
        }
        if self.trailing_zero_minimum as usize > MAX_TRAILING_ZEROS {
            return Err(format!(
                "rounding.trailing_zero_minimum must be at most {}",
                MAX_TRAILING_ZEROS
            ));
        }
        Ok(())
    }
}

/// Count and share of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketShare {
    /// Bucket label
    pub label: String,
    /// Whole-unit divisor
    pub divisor: u64,
    /// Amounts that are a multiple of the divisor
    pub count: u64,
    /// `count / totalContracts`
    pub share: f64,
    /// Whether the share is above the bucket's suspicious share
    pub exceeded: bool,
}

/// Count and share of one histogram position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitShare {
    /// Digit, or number of trailing zeros
    pub value: u8,
    /// Amounts at this position
    pub count: u64,
    /// `count / totalContracts`
    pub share: f64,
}

/// Response of the rounding patterns operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundingReport {
    /// Non-null, non-zero amounts analysed
    pub total_contracts: u64,
    /// Rounded-to buckets
    pub rounding_buckets: Vec<BucketShare>,
    /// Trailing zeros 0..=9 (9 means nine or more)
    pub trailing_zeros_distribution: Vec<DigitShare>,
    /// Units digit 0..=9
    pub last_digit_distribution: Vec<DigitShare>,
    /// Total variation distance of the last digit from uniform
    pub last_digit_deviation: f64,
    /// Share of round amounts above the expected share
    pub trailing_zero_excess: f64,
    /// Composite score in [0, 100]
    pub suspicion_score: f64,
    /// Whether the sample is flagged
    pub is_suspicious: bool,
    /// Signals that triggered the flag
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reasons: Vec<String>,
}

fn trailing_zeros(whole: u64) -> usize {
    if whole == 0 {
        return 0;
    }
    let mut n = 0;
    let mut v = whole;
    while v % 10 == 0 && n < MAX_TRAILING_ZEROS {
        v /= 10;
        n += 1;
    }
    n
}

fn share(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Analyse the amounts of a sample
pub fn rounding_patterns(sample: &AmountSample, policy: &RoundingPolicy) -> RoundingReport {
    let mut zeros = [0u64; MAX_TRAILING_ZEROS + 1];
    let mut digits = [0u64; 10];
    let mut buckets = vec![0u64; policy.buckets.len()];
    let mut total = 0u64;

    for &minor in &sample.values {
        if minor == 0 {
            continue;
        }
        total += 1;
        let abs = minor.unsigned_abs();
        let whole = abs / MINOR_PER_MAJOR as u64;
        let fractional = abs % MINOR_PER_MAJOR as u64 != 0;

        digits[(whole % 10) as usize] += 1;
        if fractional {
            zeros[0] += 1;
            continue;
        }
        zeros[trailing_zeros(whole)] += 1;
        for (i, bucket) in policy.buckets.iter().enumerate() {
            if whole % bucket.divisor == 0 {
                buckets[i] += 1;
            }
        }
    }

    let deviation = 0.5 * digits.iter().map(|c| (share(*c, total) - 0.1).abs()).sum::<f64>();
    let round_count: u64 = zeros[policy.trailing_zero_minimum as usize..].iter().sum();
    let excess = (share(round_count, total) - policy.trailing_zero_expected_share).max(0.0);

    let digit_signal = (deviation / policy.digit_deviation_saturation).min(1.0);
    let zero_signal = (excess / policy.trailing_zero_saturation).min(1.0);
    let weights = policy.digit_weight + policy.trailing_zero_weight;
    let score = if total == 0 {
        0.0
    } else {
        round_tenth(
            100.0 * (policy.digit_weight * digit_signal + policy.trailing_zero_weight * zero_signal)
                / weights,
        )
    };

    let rounding_buckets: Vec<BucketShare> = policy
        .buckets
        .iter()
        .zip(&buckets)
        .map(|(bucket, count)| {
            let s = share(*count, total);
            BucketShare {
                label: bucket.label.clone(),
                divisor: bucket.divisor,
                count: *count,
                share: s,
                exceeded: bucket.suspicious_share.is_some_and(|limit| s > limit),
            }
        })
        .collect();

    let mut reasons = Vec::new();
    if total >= policy.minimum_sample {
        if score >= policy.suspicion_threshold {
            reasons.push(format!("suspicion score {:.1} >= {}", score, policy.suspicion_threshold));
        }
        for b in rounding_buckets.iter().filter(|b| b.exceeded) {
            reasons.push(format!("{:.1}% of amounts rounded to {}", b.share * 100.0, b.label));
        }
        if deviation > policy.digit_deviation_threshold {
            reasons.push(format!("last digit deviation {:.3} from uniform", deviation));
        }
    }

    let distribution = |counts: &[u64]| -> Vec<DigitShare> {
        counts
            .iter()
            .enumerate()
            .map(|(value, count)| DigitShare {
                value: value as u8,
                count: *count,
                share: share(*count, total),
            })
            .collect()
    };

    RoundingReport {
        total_contracts: total,
        rounding_buckets,
        trailing_zeros_distribution: distribution(&zeros),
        last_digit_distribution: distribution(&digits),
        last_digit_deviation: deviation,
        trailing_zero_excess: excess,
        suspicion_score: score,
        is_suspicious: !reasons.is_empty(),
        reasons,
    }
}
