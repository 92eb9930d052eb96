use crate::errors::{Error, Result};
use crate::model::PumpAction;
use rumqttc::QoS;

const MAX_TOPIC_LEN: usize = 65535;

/// Validates a pump request from the API.
///
/// `duration` only matters for `start` and must be a positive number of
/// milliseconds when given.
pub fn validate_pump_request(
    action: Option<&str>,
    duration: Option<i64>,
) -> Result<(PumpAction, Option<u64>)> {
    let action: PumpAction = action
        .ok_or_else(|| Error::Validation("Action must be \"start\" or \"stop\"".to_string()))?
        .parse()
        .map_err(|_| Error::Validation("Action must be \"start\" or \"stop\"".to_string()))?;

    let duration = match (action, duration) {
        (PumpAction::Start, Some(ms)) if ms <= 0 => {
            return Err(Error::Validation(format!(
                "Duration {} must be a positive number of milliseconds",
                ms
            )));
        }
        (PumpAction::Start, Some(ms)) => Some(ms as u64),
        _ => None,
    };

    Ok((action, duration))
}

/// Maps a requested QoS level onto the MQTT one. Absent means QoS 1.
pub fn validate_qos(level: Option<u8>) -> Result<QoS> {
    match level {
        None | Some(1) => Ok(QoS::AtLeastOnce),
        Some(0) => Ok(QoS::AtMostOnce),
        Some(2) => Ok(QoS::ExactlyOnce),
        Some(other) => Err(Error::Validation(format!(
            "QoS {} is invalid, expected 0, 1 or 2",
            other
        ))),
    }
}

/// Validates a topic name used for publishing: no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    validate_topic_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(Error::Validation(
            "Topic name cannot contain wildcards".to_string(),
        ));
    }

    Ok(())
}

/// Validates a subscription filter.
///
/// `+` must fill a whole level, `#` must fill the last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    validate_topic_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(Error::Validation(
                "Multi-level wildcard must be the last level".to_string(),
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(Error::Validation(
                "Single-level wildcard must occupy an entire level".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_topic_common(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Validation("Topic is required".to_string()));
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::Validation("Topic exceeds maximum length".to_string()));
    }

    if topic.contains('\0') {
        return Err(Error::Validation(
            "Topic cannot contain null character".to_string(),
        ));
    }

    Ok(())
}
