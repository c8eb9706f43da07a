use std::fmt;

/// Compiled subscription pattern.
///
/// Only three shapes match anything: an exact topic, the lone `*`, and a
/// `prefix.*` suffix wildcard. Every other shape compiles to `Inert` and
/// never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    Exact(String),
    Any,
    /// Stored with the trailing dot, so `order.*` never matches `orderline.created`.
    Prefix(String),
    Inert(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            return TopicPattern::Any;
        }

        if let Some(prefix) = pattern.strip_suffix(".*") {
            if !prefix.is_empty() && !prefix.contains('*') {
                return TopicPattern::Prefix(format!("{}.", prefix));
            }
            return TopicPattern::Inert(pattern.to_string());
        }

        if pattern.is_empty() || pattern.contains('*') {
            return TopicPattern::Inert(pattern.to_string());
        }

        TopicPattern::Exact(pattern.to_string())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            TopicPattern::Exact(topic) => topic == event_type,
            TopicPattern::Any => true,
            TopicPattern::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            TopicPattern::Inert(_) => false,
        }
    }

    /// Whether this pattern can ever match an event.
    pub fn is_inert(&self) -> bool {
        matches!(self, TopicPattern::Inert(_))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(topic) => write!(f, "{}", topic),
            TopicPattern::Any => write!(f, "*"),
            TopicPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            TopicPattern::Inert(raw) => write!(f, "{}", raw),
        }
    }
}

/// Match an event type against a raw pattern string.
pub fn topic_matches(event_type: &str, pattern: &str) -> bool {
    TopicPattern::parse(pattern).matches(event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        for topic in ["order.created", "a", "x.y.z", ""] {
            assert!(topic_matches(topic, "*"));
        }
    }

    #[test]
    fn exact_topic_matches_itself() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.updated"));
    }

    #[test]
    fn prefix_wildcard_requires_separator() {
        assert!(topic_matches("order.created", "order.*"));
        assert!(topic_matches("order.item.added", "order.*"));
        assert!(!topic_matches("orderline.created", "order.*"));
        assert!(!topic_matches("order", "order.*"));
    }

    #[test]
    fn other_shapes_never_match() {
        assert!(TopicPattern::parse("order.*.created").is_inert());
        assert!(TopicPattern::parse("*.created").is_inert());
        assert!(TopicPattern::parse(".*").is_inert());
        assert!(TopicPattern::parse("").is_inert());
        assert!(!topic_matches("order.x.created", "order.*.created"));
        assert!(!topic_matches("a.created", "*.created"));
    }

    #[test]
    fn display_round_trips_prefix() {
        assert_eq!(TopicPattern::parse("order.*").to_string(), "order.*");
    }
}
