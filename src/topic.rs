use std::fmt;

use thiserror::Error;

/// First segment of every device topic.
pub const TOPIC_PREFIX: &str = "plant-monitoring";
/// Last segment of every device topic.
pub const TOPIC_SUFFIX: &str = "telemetry";
/// Filter covering every device topic on the broker.
pub const WILDCARD_FILTER: &str = "plant-monitoring/#";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic segment {segment} must not be empty")]
    EmptySegment { segment: &'static str },
    #[error("topic segment {segment} contains a reserved character ('/', '+' or '#'): {value:?}")]
    ReservedCharacter { segment: &'static str, value: String },
    #[error("topic {0:?} does not match 'plant-monitoring/<location>/<name>/telemetry'")]
    Pattern(String),
}

/// A validated device topic of the shape `plant-monitoring/<location>/<name>/telemetry`.
///
/// The same structure is enforced by the `check_topic` constraint on `devices`;
/// validating here lets operator commands fail before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceTopic {
    location: String,
    name: String,
}

impl DeviceTopic {
    pub fn new(location: &str, name: &str) -> Result<Self, TopicError> {
        Ok(Self {
            location: segment("location", location.trim())?,
            name: segment("name", name.trim())?,
        })
    }

    /// Parse a full topic string.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            [TOPIC_PREFIX, location, name, TOPIC_SUFFIX] => {
                Self::new(location, name).map_err(|_| TopicError::Pattern(topic.to_owned()))
            }
            _ => Err(TopicError::Pattern(topic.to_owned())),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeviceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOPIC_PREFIX}/{}/{}/{TOPIC_SUFFIX}", self.location, self.name)
    }
}

fn segment(which: &'static str, value: &str) -> Result<String, TopicError> {
    if value.is_empty() {
        return Err(TopicError::EmptySegment { segment: which });
    }
    if value.contains(['/', '+', '#']) {
        return Err(TopicError::ReservedCharacter {
            segment: which,
            value: value.to_owned(),
        });
    }
    Ok(value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_topic_from_components() {
        let t = DeviceTopic::new("living-room", "scarlet-star-1").unwrap();
        assert_eq!(
            t.to_string(),
            "plant-monitoring/living-room/scarlet-star-1/telemetry"
        );
    }

    #[test]
    fn components_are_trimmed() {
        let t = DeviceTopic::new("  kitchen ", " basil\n").unwrap();
        assert_eq!(t.to_string(), "plant-monitoring/kitchen/basil/telemetry");
    }

    #[test]
    fn empty_component_is_rejected() {
        assert_eq!(
            DeviceTopic::new("", "basil").unwrap_err(),
            TopicError::EmptySegment { segment: "location" }
        );
    }

    #[test]
    fn slash_or_wildcard_in_component_is_rejected() {
        assert!(matches!(
            DeviceTopic::new("kitchen/shelf", "basil"),
            Err(TopicError::ReservedCharacter { segment: "location", .. })
        ));
        assert!(matches!(
            DeviceTopic::new("kitchen", "#"),
            Err(TopicError::ReservedCharacter { segment: "name", .. })
        ));
    }

    #[test]
    fn parse_accepts_well_formed_topic() {
        let t = DeviceTopic::parse("plant-monitoring/living-room/scarlet-star-1/telemetry").unwrap();
        assert_eq!(t.location(), "living-room");
        assert_eq!(t.name(), "scarlet-star-1");
    }

    #[test]
    fn parse_rejects_wrong_shape() {
        for bad in [
            "unknown/topic",
            "plant-monitoring/living-room/telemetry",
            "plant-monitoring/a/b/status",
            "other/a/b/telemetry",
            "plant-monitoring/a/b/c/telemetry",
            "plant-monitoring//b/telemetry",
        ] {
            assert!(
                matches!(DeviceTopic::parse(bad), Err(TopicError::Pattern(_))),
                "{bad} should be rejected"
            );
        }
    }
}
