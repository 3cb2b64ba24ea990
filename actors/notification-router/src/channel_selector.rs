//! Channel ranking by notification type

use routing_common::{ChannelKind, NotificationType};
use std::collections::BTreeSet;

/// Chosen channel and whether it came from an explicit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSelection {
    pub channel: ChannelKind,
    pub explicit: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelSelector;

impl ChannelSelector {
    pub fn new() -> Self {
        Self
    }

    /// Priority score of a channel for a notification type
    pub fn score(&self, channel: ChannelKind, notification_type: NotificationType) -> u8 {
        let overridden = match (notification_type, channel) {
            (NotificationType::Urgent, ChannelKind::Sms) => Some(5),
            (NotificationType::Urgent, ChannelKind::Push) => Some(4),
            (NotificationType::Transactional, ChannelKind::Email) => Some(3),
            (NotificationType::Transactional, ChannelKind::Push) => Some(2),
            (NotificationType::Marketing, ChannelKind::Email) => Some(2),
            (NotificationType::Marketing, ChannelKind::Push) => Some(1),
            _ => None,
        };

        overridden.unwrap_or(match channel {
            ChannelKind::Email => 1,
            ChannelKind::Sms => 3,
            ChannelKind::Push => 2,
            ChannelKind::Webhook => 4,
        })
    }

    /// Explicit request wins when enabled, otherwise the highest score.
    /// Ties go to the channel declared first.
    pub fn select(
        &self,
        requested: Option<ChannelKind>,
        notification_type: NotificationType,
        enabled: &BTreeSet<ChannelKind>,
    ) -> Option<ChannelSelection> {
        if let Some(channel) = requested.filter(|c| enabled.contains(c)) {
            return Some(ChannelSelection {
                channel,
                explicit: true,
            });
        }

        // BTreeSet iterates in declaration order; keep the first of equal scores
        let mut best: Option<(ChannelKind, u8)> = None;
        for &channel in enabled {
            let score = self.score(channel, notification_type);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((channel, score));
            }
        }

        best.map(|(channel, _)| ChannelSelection {
            channel,
            explicit: false,
        })
    }

    pub fn select_channel(
        &self,
        requested: Option<ChannelKind>,
        notification_type: NotificationType,
        enabled: &BTreeSet<ChannelKind>,
    ) -> Option<ChannelKind> {
        self.select(requested, notification_type, enabled)
            .map(|selection| selection.channel)
    }
}
