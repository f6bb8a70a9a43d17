//! Topic naming scheme.
//!
//! One events topic and one commands topic per domain:
//! `mercato.<domain>.events` / `mercato.<domain>.commands`. Partition keys
//! are always the aggregate key, so per-entity ordering holds within a topic.

/// Domains with their own topic pair.
pub const DOMAINS: &[&str] = &[
    "identity",
    "catalog",
    "order",
    "payment",
    "inventory",
    "shipping",
    "notification",
    "analytics",
];

pub fn events_topic(prefix: &str, domain: &str) -> String {
    format!("{prefix}.{domain}.events")
}

pub fn commands_topic(prefix: &str, domain: &str) -> String {
    format!("{prefix}.{domain}.commands")
}

/// Derive the domain from an event type string ("payment.charged" -> "payment").
pub fn domain_of(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or("unknown")
}

/// Topic an event type is published to ("payment.charged" ->
/// "mercato.payment.events" under the "mercato" prefix).
pub fn topic_for_event(prefix: &str, event_type: &str) -> String {
    events_topic(prefix, domain_of(event_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_mapping() {
        assert_eq!(
            topic_for_event("mercato", "payment.charged"),
            "mercato.payment.events"
        );
        assert_eq!(
            topic_for_event("mercato", "order.submitted"),
            "mercato.order.events"
        );
        assert_eq!(
            commands_topic("mercato", "inventory"),
            "mercato.inventory.commands"
        );
    }

    #[test]
    fn unknown_domain_falls_through() {
        assert_eq!(domain_of("weird"), "weird");
        assert_eq!(topic_for_event("mercato", "weird"), "mercato.weird.events");
    }
}
