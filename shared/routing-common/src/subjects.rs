//! NATS subject patterns for routing
//!
//! ```text
//! notifications.route.request                    # Routing requests from the host
//! notifications.route.decision.{user_id}         # Routing decisions (observability)
//! notifications.optimize.request                 # Optimization requests
//! notifications.optimize.result.{notification}   # Optimization results (observability)
//! notifications.send.immediate.{channel}         # Hand-off to transport providers
//! ```

/// Routing request subject
pub const ROUTE_REQUEST: &str = "notifications.route.request";

/// Optimization request subject
pub const OPTIMIZE_REQUEST: &str = "notifications.optimize.request";

/// Immediate notification subject - for real-time delivery
///
/// Example: `notifications.send.immediate.email`
pub fn send_immediate(channel: &str) -> String {
    format!("notifications.send.immediate.{}", channel)
}

/// Routing decision subject
///
/// Example: `notifications.route.decision.user-uuid-12345`
pub fn route_decision(user_id: &str) -> String {
    format!("notifications.route.decision.{}", subject_token(user_id))
}

/// Optimization result subject
///
/// Example: `notifications.optimize.result.notification-uuid-12345`
pub fn optimize_result(notification_id: &str) -> String {
    format!("notifications.optimize.result.{}", subject_token(notification_id))
}

/// Encode an id as a single subject token.
///
/// Bytes outside `[A-Za-z0-9_-]` become `%XX`, so separators, wildcards and
/// whitespace cannot leak into the subject. An empty id becomes `_`.
pub fn subject_token(raw: &str) -> String {
    if raw.is_empty() {
        return "_".to_string();
    }

    let mut token = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            token.push(char::from(byte));
        } else {
            token.push_str(&format!("%{:02X}", byte));
        }
    }
    token
}

/// Pattern for all routing decisions
pub fn pattern_route_decision_all() -> &'static str {
    "notifications.route.decision.>"
}

/// Pattern for all optimization results
pub fn pattern_optimize_result_all() -> &'static str {
    "notifications.optimize.result.>"
}
