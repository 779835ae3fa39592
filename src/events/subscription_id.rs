use std::fmt;
use std::str::FromStr;

use crate::error::ClientError;

pub const DELIMITER: char = '|';
pub const WILDCARD: &str = "*";

/// Matches every event.
pub const SUBSCRIPTION_ALL: &str = "*|*|*|*";

/// Four-part event address: `receiver|component|operation|unique`.
///
/// Each segment is a literal (possibly empty) or [`WILDCARD`]. Events are
/// addressed with literal ids; subscriptions may use wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    raw: String,
    segments: [String; 4],
}

impl SubscriptionId {
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let parts: Vec<&str> = raw.split(DELIMITER).collect();
        let [receiver, component, operation, unique] = parts.as_slice() else {
            return Err(ClientError::Misuse(format!(
                "Subscription id {:?} must have exactly 4 segments",
                raw
            )));
        };
        Ok(Self {
            raw: raw.to_string(),
            segments: [
                receiver.to_string(),
                component.to_string(),
                operation.to_string(),
                unique.to_string(),
            ],
        })
    }

    pub fn all() -> Self {
        let star = || WILDCARD.to_string();
        Self {
            raw: SUBSCRIPTION_ALL.to_string(),
            segments: [star(), star(), star(), star()],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn receiver(&self) -> &str {
        &self.segments[0]
    }

    pub fn component(&self) -> &str {
        &self.segments[1]
    }

    pub fn operation(&self) -> &str {
        &self.segments[2]
    }

    pub fn unique(&self) -> &str {
        &self.segments[3]
    }

    /// Whether an event addressed to `event` belongs to this subscription.
    pub fn matches(&self, event: &SubscriptionId) -> bool {
        self.segments
            .iter()
            .zip(event.segments.iter())
            .all(|(ours, theirs)| ours == WILDCARD || ours == theirs)
    }
}

impl FromStr for SubscriptionId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> SubscriptionId {
        SubscriptionId::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_segments() {
        let parsed = id("|testcase|test|update");
        assert_eq!(parsed.receiver(), "");
        assert_eq!(parsed.component(), "testcase");
        assert_eq!(parsed.operation(), "test");
        assert_eq!(parsed.unique(), "update");
        assert_eq!(parsed.to_string(), "|testcase|test|update");
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        for raw in ["", "a|b|c", "a|b|c|d|e", "a.b.c.d"] {
            assert!(
                matches!(SubscriptionId::parse(raw), Err(ClientError::Misuse(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_matching() {
        let event = id("a|b|c|d");
        assert!(id("a|b|c|d").matches(&event));
        assert!(id("*|b|c|d").matches(&event));
        assert!(!id("a|b|c|d").matches(&id("a|x|c|d")));
        assert!(!id("a|*|c|e").matches(&event));
        assert!(SubscriptionId::all().matches(&event));
        assert!(id(SUBSCRIPTION_ALL).matches(&id("|testcase|test|update")));
    }

    #[test]
    fn test_empty_segment_is_literal() {
        assert!(id("|c|o|u").matches(&id("|c|o|u")));
        assert!(!id("|c|o|u").matches(&id("r|c|o|u")));
    }
}
