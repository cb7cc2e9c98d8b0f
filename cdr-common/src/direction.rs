use std::collections::HashSet;

use crate::call::Direction;

pub const DEFAULT_OUTGOING_CONTEXTS: &[&str] = &["from-internal"];
pub const DEFAULT_INCOMING_CONTEXTS: &[&str] =
    &["from-digital", "from-analog", "from-trunk", "from-pstn"];

/// Maps the dialplan context of a call's source peer to a direction.
/// Membership is exact and case sensitive; outgoing is checked before incoming.
#[derive(Debug, Clone)]
pub struct DirectionClassifier {
    outgoing: HashSet<String>,
    incoming: HashSet<String>,
}

impl DirectionClassifier {
    /// Build a classifier from the built-in contexts plus comma separated operator lists.
    pub fn new(additional_outgoing: &str, additional_incoming: &str) -> Self {
        Self {
            outgoing: merge(DEFAULT_OUTGOING_CONTEXTS, additional_outgoing),
            incoming: merge(DEFAULT_INCOMING_CONTEXTS, additional_incoming),
        }
    }

    pub fn classify(&self, context: &str) -> Direction {
        if self.outgoing.contains(context) {
            Direction::Outgoing
        } else if self.incoming.contains(context) {
            Direction::Incoming
        } else {
            Direction::Unknown
        }
    }
}

impl Default for DirectionClassifier {
    fn default() -> Self {
        Self::new("", "")
    }
}

fn merge(defaults: &[&str], additional: &str) -> HashSet<String> {
    defaults
        .iter()
        .map(|s| s.to_string())
        .chain(
            additional
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        )
        .collect()
}
