//! Validation utilities for routing inputs
//!
//! Malformed input to the pure parts of the engine (clock times, timezones,
//! A/B test definitions, optimizer parameters) is rejected here, synchronously,
//! before any store is touched.

use crate::{ABTest, ChannelStats, NotificationRequest, QuietHours, UserChannelPreferences};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

/// Allowed drift when checking that a traffic split sums to 100
pub const SPLIT_TOLERANCE: f64 = 0.01;

/// Validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid format for field {field}: {reason}")]
    InvalidFormat { field: String, reason: String },

    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Unknown channel: {0}")]
    InvalidChannel(String),

    #[error("A/B test needs at least 2 variants, got {count}")]
    InsufficientVariants { count: usize },

    #[error("Invalid traffic split: {0}")]
    InvalidTrafficSplit(String),

    #[error("Invalid parameter {field}: {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("A/B test {test_id} is {status}, new assignments require an active test")]
    TestNotActive { test_id: String, status: String },

    #[error("unknown optimization type: {0}")]
    UnknownOptimizationType(String),
}

/// Validation result type
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validating routing-related data
pub trait Validate {
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for NotificationRequest {
    fn validate(&self) -> ValidationResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "user_id".to_string(),
            });
        }

        Ok(())
    }
}

impl Validate for QuietHours {
    fn validate(&self) -> ValidationResult<()> {
        parse_clock_time(&self.start)?;
        parse_clock_time(&self.end)?;
        Ok(())
    }
}

impl Validate for UserChannelPreferences {
    fn validate(&self) -> ValidationResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "user_id".to_string(),
            });
        }

        parse_timezone(&self.timezone)?;

        if let Some(quiet_hours) = &self.quiet_hours {
            quiet_hours.validate()?;
        }

        Ok(())
    }
}

impl Validate for ABTest {
    fn validate(&self) -> ValidationResult<()> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "id".to_string(),
            });
        }

        if self.variants.len() < 2 {
            return Err(ValidationError::InsufficientVariants {
                count: self.variants.len(),
            });
        }

        let mut variant_names = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "variants[].name".to_string(),
                });
            }
            if !variant_names.insert(variant.name.as_str()) {
                return Err(ValidationError::InvalidTrafficSplit(format!(
                    "duplicate variant '{}'",
                    variant.name
                )));
            }
        }

        let mut split_names = HashSet::new();
        let mut total = 0.0;
        for allocation in &self.traffic_split {
            if !allocation.percentage.is_finite() || allocation.percentage < 0.0 {
                return Err(ValidationError::InvalidTrafficSplit(format!(
                    "percentage for '{}' must be a non-negative number",
                    allocation.variant
                )));
            }
            if !split_names.insert(allocation.variant.as_str()) {
                return Err(ValidationError::InvalidTrafficSplit(format!(
                    "variant '{}' allocated twice",
                    allocation.variant
                )));
            }
            if !variant_names.contains(allocation.variant.as_str()) {
                return Err(ValidationError::InvalidTrafficSplit(format!(
                    "'{}' is not a declared variant",
                    allocation.variant
                )));
            }
            total += allocation.percentage;
        }

        if let Some(missing) = variant_names.iter().find(|name| !split_names.contains(*name)) {
            return Err(ValidationError::InvalidTrafficSplit(format!(
                "variant '{}' has no traffic allocation",
                missing
            )));
        }

        if (total - 100.0).abs() > SPLIT_TOLERANCE {
            return Err(ValidationError::InvalidTrafficSplit(format!(
                "percentages sum to {}, expected 100",
                total
            )));
        }

        Ok(())
    }
}

impl Validate for ChannelStats {
    fn validate(&self) -> ValidationResult<()> {
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(ValidationError::InvalidFormat {
                field: "success_rate".to_string(),
                reason: format!("must be within 0..=1, got {}", self.success_rate),
            });
        }
        if !self.avg_delivery_time_secs.is_finite() || self.avg_delivery_time_secs < 0.0 {
            return Err(ValidationError::InvalidFormat {
                field: "avg_delivery_time_secs".to_string(),
                reason: format!("must be a non-negative number, got {}", self.avg_delivery_time_secs),
            });
        }
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(ValidationError::InvalidFormat {
                field: "cost".to_string(),
                reason: format!("must be a non-negative number, got {}", self.cost),
            });
        }

        Ok(())
    }
}

/// Parse an `HH:MM` clock time into minute-of-day
pub fn parse_clock_time(time: &str) -> ValidationResult<u16> {
    let time_regex = Regex::new(r"^([01]?[0-9]|2[0-3]):([0-5][0-9])$")
        .map_err(|_| ValidationError::InvalidTimeFormat("Regex compilation failed".to_string()))?;

    let captures = time_regex.captures(time.trim()).ok_or_else(|| {
        ValidationError::InvalidTimeFormat(format!("Time must be in HH:MM format, got: {}", time))
    })?;

    let hours: u16 = captures[1]
        .parse()
        .map_err(|_| ValidationError::InvalidTimeFormat(time.to_string()))?;
    let minutes: u16 = captures[2]
        .parse()
        .map_err(|_| ValidationError::InvalidTimeFormat(time.to_string()))?;

    Ok(hours * 60 + minutes)
}

/// Parse an IANA timezone name
pub fn parse_timezone(timezone: &str) -> ValidationResult<Tz> {
    if timezone.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "timezone".to_string(),
        });
    }

    timezone
        .trim()
        .parse::<Tz>()
        .map_err(|_| ValidationError::InvalidTimezone(format!("'{}' is not a valid IANA timezone", timezone)))
}
