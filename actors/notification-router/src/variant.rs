//! Deterministic A/B variant assignment
//!
//! Users are bucketed by a hash of their id, so the same user lands in the
//! same variant on every host and after every restart. The first assignment
//! for a (test, user) pair is memoized and wins over later split edits.

use routing_common::{
    ABTest, RoutingResult, TestStatus, TrafficAllocation, UserAssignment, Validate, ValidationError,
    ValidationResult,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::runtime::AssignmentStore;

/// Two-sided significance level used by `two_proportion_test`
pub const SIGNIFICANCE_LEVEL: f64 = 0.05;

/// First four bytes of SHA-256 over the id, big-endian
pub fn stable_hash(user_id: &str) -> u32 {
    let digest = Sha256::digest(user_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Bucket in 0..100
pub fn bucket_for(user_id: &str) -> u8 {
    (stable_hash(user_id) % 100) as u8
}

/// Variant whose cumulative share first exceeds the bucket
pub fn variant_for_bucket(split: &[TrafficAllocation], bucket: u8) -> Option<&str> {
    let mut cumulative = 0.0;
    for allocation in split {
        cumulative += allocation.percentage;
        if cumulative > f64::from(bucket) {
            return Some(allocation.variant.as_str());
        }
    }
    None
}

/// Pick a variant for the user; rounding misses fall back to the first entry
pub fn assign<'a>(split: &'a [TrafficAllocation], user_id: &str) -> Option<&'a str> {
    variant_for_bucket(split, bucket_for(user_id))
        .or_else(|| split.first().map(|allocation| allocation.variant.as_str()))
}

pub struct VariantAssigner {
    store: Arc<dyn AssignmentStore>,
}

impl VariantAssigner {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self { store }
    }

    /// Memoized assignment for the user.
    ///
    /// An existing assignment is returned whatever the test's status or
    /// current split; a new one needs a valid, active test.
    pub async fn assign_for_test(&self, test: &ABTest, user_id: &str) -> RoutingResult<UserAssignment> {
        if let Some(variant) = self.store.get_assignment(&test.id, user_id).await? {
            debug!("Reusing assignment {} for {} in test {}", variant, user_id, test.id);
            return Ok(UserAssignment {
                test_id: test.id.clone(),
                user_id: user_id.to_string(),
                variant,
            });
        }

        if test.status != TestStatus::Active {
            return Err(ValidationError::TestNotActive {
                test_id: test.id.clone(),
                status: test.status.to_string(),
            }
            .into());
        }
        test.validate()?;

        let candidate = assign(&test.traffic_split, user_id)
            .or_else(|| test.variants.first().map(|v| v.name.as_str()))
            .ok_or(ValidationError::InsufficientVariants { count: 0 })?;

        let variant = self.store.get_or_insert(&test.id, user_id, candidate).await?;
        debug!(
            "Assigned {} to variant {} in test {} (bucket {})",
            user_id,
            variant,
            test.id,
            bucket_for(user_id)
        );

        Ok(UserAssignment {
            test_id: test.id.clone(),
            user_id: user_id.to_string(),
            variant,
        })
    }
}

/// Conversions observed for one arm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionSample {
    pub conversions: u64,
    pub trials: u64,
}

impl ConversionSample {
    pub fn new(conversions: u64, trials: u64) -> Self {
        Self { conversions, trials }
    }

    fn rate(&self) -> f64 {
        self.conversions as f64 / self.trials as f64
    }

    fn validate(&self, field: &str) -> ValidationResult<()> {
        if self.trials == 0 {
            return Err(ValidationError::InvalidParameter {
                field: field.to_string(),
                reason: "needs at least one trial".to_string(),
            });
        }
        if self.conversions > self.trials {
            return Err(ValidationError::InvalidParameter {
                field: field.to_string(),
                reason: format!("{} conversions out of {} trials", self.conversions, self.trials),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SignificanceResult {
    pub z: f64,
    pub p_value: f64,
    pub significant: bool,
    /// Relative change of the treatment rate over control; absent when the
    /// control rate is zero
    pub lift: Option<f64>,
}

/// Pooled two-proportion z-test, two-sided
pub fn two_proportion_test(
    control: ConversionSample,
    treatment: ConversionSample,
) -> ValidationResult<SignificanceResult> {
    control.validate("control")?;
    treatment.validate("treatment")?;

    let p1 = control.rate();
    let p2 = treatment.rate();
    let n1 = control.trials as f64;
    let n2 = treatment.trials as f64;
    let pooled = (control.conversions + treatment.conversions) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();

    let (z, p_value) = if se > 0.0 {
        let z = (p2 - p1) / se;
        (z, 2.0 * (1.0 - standard_normal_cdf(z.abs())))
    } else {
        (0.0, 1.0)
    };

    Ok(SignificanceResult {
        z,
        p_value: p_value.clamp(0.0, 1.0),
        significant: p_value < SIGNIFICANCE_LEVEL,
        lift: (p1 > 0.0).then(|| (p2 - p1) / p1),
    })
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

// Abramowitz & Stegun 7.1.26, max error 1.5e-7
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
