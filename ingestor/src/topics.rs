//! Topic grammar shared with the irrigation firmware.
//!
//! Inbound:
//! - `irrig/<device>/status`
//! - `irrig/<device>/telemetry`
//! - `claim/hello/<device>`
//!
//! Outbound:
//! - `irrig/<device>/cmd`

pub const ROOT: &str = "irrig";
pub const CLAIM_ROOT: &str = "claim";
pub const CLAIM_HELLO: &str = "hello";

pub const STATUS_WILDCARD: &str = "irrig/+/status";
pub const TELEMETRY_WILDCARD: &str = "irrig/+/telemetry";
pub const CLAIM_WILDCARD: &str = "claim/hello/+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    Telemetry,
    Claim,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Status => "status",
            TopicKind::Telemetry => "telemetry",
            TopicKind::Claim => "claim",
        }
    }
}

/// A topic that matched the grammar, borrowing the device id from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub kind: TopicKind,
    pub device_id: &'a str,
}

/// Match a topic against the inbound grammar, in priority order.
///
/// Returns `None` for anything that is not exactly one of the known
/// three-level patterns with a non-empty device level.
pub fn classify(topic: &str) -> Option<Route<'_>> {
    let mut levels = topic.split('/');
    let (first, second, third) = (levels.next()?, levels.next()?, levels.next()?);
    if levels.next().is_some() {
        return None;
    }

    let route = match (first, second, third) {
        (ROOT, id, "status") => Route {
            kind: TopicKind::Status,
            device_id: id,
        },
        (ROOT, id, "telemetry") => Route {
            kind: TopicKind::Telemetry,
            device_id: id,
        },
        (CLAIM_ROOT, CLAIM_HELLO, id) => Route {
            kind: TopicKind::Claim,
            device_id: id,
        },
        _ => return None,
    };

    if route.device_id.is_empty() {
        return None;
    }
    Some(route)
}

pub fn command_topic(device_id: &str) -> String {
    format!("{}/{}/cmd", ROOT, device_id)
}

/// Subscriptions used when none are configured.
pub fn default_subscriptions() -> Vec<String> {
    vec![
        STATUS_WILDCARD.to_string(),
        TELEMETRY_WILDCARD.to_string(),
        CLAIM_WILDCARD.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        let route = classify("irrig/DEV1/status").unwrap();
        assert_eq!(route.kind, TopicKind::Status);
        assert_eq!(route.device_id, "DEV1");
    }

    #[test]
    fn test_classify_telemetry() {
        let route = classify("irrig/ABCD-1234/telemetry").unwrap();
        assert_eq!(route.kind, TopicKind::Telemetry);
        assert_eq!(route.device_id, "ABCD-1234");
    }

    #[test]
    fn test_classify_claim() {
        let route = classify("claim/hello/esp32-dce98e").unwrap();
        assert_eq!(route.kind, TopicKind::Claim);
        assert_eq!(route.device_id, "esp32-dce98e");
    }

    #[test]
    fn test_classify_rejects_unknown_topics() {
        assert_eq!(classify("irrig/DEV1/cmd"), None);
        assert_eq!(classify("telemetry/dev-1"), None);
        assert_eq!(classify("irrig/DEV1/status/extra"), None);
        assert_eq!(classify("prefix/irrig/DEV1/status"), None);
        assert_eq!(classify("claim/bye/DEV1"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_classify_rejects_empty_device_id() {
        assert_eq!(classify("irrig//status"), None);
        assert_eq!(classify("claim/hello/"), None);
    }

    #[test]
    fn test_device_named_like_a_keyword() {
        // the device level is taken positionally
        let route = classify("irrig/status/telemetry").unwrap();
        assert_eq!(route.kind, TopicKind::Telemetry);
        assert_eq!(route.device_id, "status");
    }

    #[test]
    fn test_command_topic() {
        assert_eq!(command_topic("DEV1"), "irrig/DEV1/cmd");
        // commands are outbound only
        assert_eq!(classify(&command_topic("DEV1")), None);
    }
}
