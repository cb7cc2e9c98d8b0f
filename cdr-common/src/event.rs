use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enumeration of the CEL event types the reconciler cares about.
/// BridgeStart/BridgeEnter open a bridge, BridgeEnd/BridgeExit close one. Every other CEL
/// event type (CHAN_START, ANSWER, HANGUP, ...) is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    BridgeStart,
    BridgeEnter,
    BridgeEnd,
    BridgeExit,
    Other(String),
}

impl EventType {
    pub fn is_starting(&self) -> bool {
        matches!(self, EventType::BridgeStart | EventType::BridgeEnter)
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, EventType::BridgeEnd | EventType::BridgeExit)
    }

    /// The name Asterisk writes in the `eventtype` column.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::BridgeStart => "BRIDGE_START",
            EventType::BridgeEnter => "BRIDGE_ENTER",
            EventType::BridgeEnd => "BRIDGE_END",
            EventType::BridgeExit => "BRIDGE_EXIT",
            EventType::Other(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "BRIDGE_START" => EventType::BridgeStart,
            "BRIDGE_ENTER" => EventType::BridgeEnter,
            "BRIDGE_END" => EventType::BridgeEnd,
            "BRIDGE_EXIT" => EventType::BridgeExit,
            other => EventType::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `cel` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub event_type: EventType,
    pub unique_id: String,
    pub event_time: DateTime<Utc>,
    pub channel_name: String,
    pub peer_channel_name: String,
    pub caller_id_number: String,
    pub caller_id_name: String,
    pub context: String,
}

impl RawEvent {
    /// A row on `channel` with no peer and no caller id.
    pub fn new(
        id: i64,
        event_type: EventType,
        unique_id: &str,
        channel: &str,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            unique_id: unique_id.to_owned(),
            event_time,
            channel_name: channel.to_owned(),
            peer_channel_name: String::new(),
            caller_id_number: String::new(),
            caller_id_name: String::new(),
            context: String::new(),
        }
    }

    pub fn with_peer(mut self, peer: &str) -> Self {
        self.peer_channel_name = peer.to_owned();
        self
    }

    pub fn with_caller(mut self, number: &str, name: &str, context: &str) -> Self {
        self.caller_id_number = number.to_owned();
        self.caller_id_name = name.to_owned();
        self.context = context.to_owned();
        self
    }
}

/// Channel name prefixes that mark internal transfer legs (`Local/` channels by default).
/// Events on these channels are never treated as call boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExclusions {
    prefixes: Vec<String>,
}

impl ChannelExclusions {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    /// Parse a comma separated list of prefixes, ignoring blank entries.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn is_excluded(&self, channel: &str) -> bool {
        self.prefixes.iter().any(|p| channel.starts_with(p.as_str()))
    }

    /// SQL `LIKE` patterns matching the excluded prefixes. `%` and `_` in a prefix are escaped.
    pub fn like_patterns(&self) -> Vec<String> {
        self.prefixes
            .iter()
            .map(|p| {
                let escaped = p
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                format!("{escaped}%")
            })
            .collect()
    }

    /// Whether `event` may close a call: a terminating event with a peer, neither side excluded.
    pub fn admits_boundary(&self, event: &RawEvent) -> bool {
        event.event_type.is_terminating()
            && !event.peer_channel_name.is_empty()
            && !self.is_excluded(&event.channel_name)
            && !self.is_excluded(&event.peer_channel_name)
    }
}

impl Default for ChannelExclusions {
    fn default() -> Self {
        Self::new(vec!["Local/".to_owned()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(event_type: EventType, channel: &str, peer: &str) -> RawEvent {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        RawEvent::new(1, event_type, "u1", channel, at).with_peer(peer)
    }

    #[test]
    fn test_event_type_round_trips_known_names() {
        for name in ["BRIDGE_START", "BRIDGE_ENTER", "BRIDGE_END", "BRIDGE_EXIT"] {
            let parsed = EventType::from(name);
            assert_eq!(parsed.as_str(), name);
        }
        let other = EventType::from("HANGUP");
        assert_eq!(other, EventType::Other("HANGUP".to_owned()));
        assert!(!other.is_starting());
        assert!(!other.is_terminating());
    }

    #[test]
    fn test_default_exclusions_reject_local_channels() {
        let exclusions = ChannelExclusions::default();

        assert!(exclusions.admits_boundary(&event(EventType::BridgeEnd, "SIP/100-1", "SIP/200-2")));
        assert!(!exclusions.admits_boundary(&event(
            EventType::BridgeEnd,
            "Local/100@from-internal-1;1",
            "SIP/200-2"
        )));
        assert!(!exclusions.admits_boundary(&event(
            EventType::BridgeExit,
            "SIP/100-1",
            "Local/200@from-queue-3;2"
        )));
        assert!(!exclusions.admits_boundary(&event(EventType::BridgeEnd, "SIP/100-1", "")));
        assert!(!exclusions.admits_boundary(&event(EventType::BridgeStart, "SIP/100-1", "SIP/2")));
    }

    #[test]
    fn test_parse_exclusions_and_like_patterns() {
        let exclusions = ChannelExclusions::parse(" Local/ , ,Parked_/");
        assert!(exclusions.is_excluded("Parked_/1"));
        assert_eq!(
            exclusions.like_patterns(),
            vec!["Local/%".to_owned(), "Parked\\_/%".to_owned()]
        );
    }
}
