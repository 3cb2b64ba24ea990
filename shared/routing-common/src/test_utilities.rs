//! Test fixtures shared by the routing crates
//!
//! Compiled for this crate's own tests and, through the `test-utils`
//! feature, for the engine and provider test suites.

use crate::{
    ABTest, ChannelKind, ChannelStats, NotificationRequest, NotificationType, TestStatus,
    TrafficAllocation, UserChannelPreferences, Variant,
};
use chrono::{DateTime, TimeZone, Utc};

/// User id used by every fixture
pub const TEST_USER_ID: &str = "test_user_123";

/// Create a test notification request with no explicit channel
pub fn create_test_request(notification_type: NotificationType) -> NotificationRequest {
    NotificationRequest::new(TEST_USER_ID, notification_type)
        .with_priority(1)
        .with_payload(serde_json::json!({
            "subject": "Test notification",
            "body": "This is a test notification message"
        }))
}

/// Preferences with email + push enabled and quiet hours 22:00-08:00 UTC
pub fn create_test_preferences() -> UserChannelPreferences {
    UserChannelPreferences::new(TEST_USER_ID, [ChannelKind::Email, ChannelKind::Push])
        .with_quiet_hours("22:00", "08:00")
        .with_timezone("UTC")
}

/// Preferences with every channel enabled and no quiet hours
pub fn create_all_channel_preferences() -> UserChannelPreferences {
    UserChannelPreferences::new(TEST_USER_ID, ChannelKind::ALL)
}

/// A fixed instant on 2024-03-15 at the given UTC clock time
pub fn utc_at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, hour, minute, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A two-arm A/B test with the given split for control/treatment
pub fn create_test_ab_test(control_pct: f64, treatment_pct: f64) -> ABTest {
    ABTest {
        id: "welcome_subject_line".to_string(),
        variants: vec![
            Variant {
                name: "control".to_string(),
                configuration: serde_json::json!({"subject": "Welcome aboard"}),
            },
            Variant {
                name: "treatment".to_string(),
                configuration: serde_json::json!({"subject": "You're in!"}),
            },
        ],
        traffic_split: vec![
            TrafficAllocation {
                variant: "control".to_string(),
                percentage: control_pct,
            },
            TrafficAllocation {
                variant: "treatment".to_string(),
                percentage: treatment_pct,
            },
        ],
        status: TestStatus::Active,
    }
}

/// Channel stats fixture
pub fn create_channel_stats(success_rate: f64, avg_delivery_time_secs: f64, cost: f64) -> ChannelStats {
    ChannelStats {
        success_rate,
        avg_delivery_time_secs,
        cost,
    }
}
