//! Tag values and the well-known tag names of the coordination protocol.

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Barrier mask tag. Each controller ORs its assigned bit in after a
/// completed control cycle; the driver waits for the full mask and resets
/// it to zero before the next iteration.
pub const CONTROL: &str = "CONTROL";

/// Global iteration counter. Written only by the driver, read by every
/// controller; the single source of simulation time.
pub const TIME: &str = "TIME";

/// Actuator-side attack flag, written by the controller executing an
/// override so recorders can label affected rows.
pub const ATT_ACTUATOR: &str = "ATT_1";

/// Sensor-side attack flag, written by the driver for concealment-style
/// attack kinds. Deliberately a separate tag from [`ATT_ACTUATOR`]: the
/// component that raises it is not the component executing the override.
pub const ATT_SENSOR: &str = "ATT_2";

/// Flow companion tag for a link: the status tag is the bare link name,
/// the realized flow lives under `<link>F`.
pub fn flow_tag(link: &str) -> String {
    format!("{link}F")
}

/// A scalar tag value.
///
/// Physical quantities (levels, pressures, flows) are analog; actuator
/// statuses, the barrier mask, counters and flags are discrete.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    /// Continuous physical quantity.
    Analog(f64),
    /// Integer status code, counter or bitmask.
    Discrete(i64),
}

impl TagValue {
    /// Encodes to the canonical text form stored in the backend.
    ///
    /// Discrete values print as plain integers; analog values always carry
    /// a fractional or exponent part so the two halves of the codec never
    /// collide (`7` is discrete, `7.0` is analog).
    pub fn encode(&self) -> String {
        match self {
            TagValue::Discrete(v) => v.to_string(),
            TagValue::Analog(v) => format!("{v:?}"),
        }
    }

    /// Decodes the canonical text form.
    pub fn decode(tag: &str, raw: &str) -> Result<Self, StoreError> {
        if let Ok(v) = raw.parse::<i64>() {
            return Ok(TagValue::Discrete(v));
        }
        raw.parse::<f64>()
            .map(TagValue::Analog)
            .map_err(|_| StoreError::Codec {
                tag: tag.to_string(),
                raw: raw.to_string(),
            })
    }

    /// The value as a physical quantity.
    pub fn as_analog(&self) -> f64 {
        match self {
            TagValue::Analog(v) => *v,
            TagValue::Discrete(v) => *v as f64,
        }
    }

    /// The value normalized to an integer status code.
    ///
    /// Analog readings of a status tag (as produced by some solvers) are
    /// truncated here, at the boundary, so nothing downstream branches on
    /// the representation.
    pub fn as_status_code(&self) -> i64 {
        match self {
            TagValue::Discrete(v) => *v,
            TagValue::Analog(v) => *v as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips_discrete() {
        let v = TagValue::Discrete(42);
        assert_eq!(TagValue::decode("X", &v.encode()).unwrap(), v);
    }

    #[test]
    fn codec_round_trips_analog() {
        for v in [0.5, 7.0, -3.25, 1e-9] {
            let tag = TagValue::Analog(v);
            assert_eq!(TagValue::decode("X", &tag.encode()).unwrap(), tag);
        }
    }

    #[test]
    fn whole_analog_stays_analog() {
        // 7.0 must not decode back as Discrete(7)
        let encoded = TagValue::Analog(7.0).encode();
        assert_eq!(
            TagValue::decode("T1", &encoded).unwrap(),
            TagValue::Analog(7.0)
        );
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = TagValue::decode("V2", "open").unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }

    #[test]
    fn status_normalization_truncates_analog() {
        assert_eq!(TagValue::Analog(1.0).as_status_code(), 1);
        assert_eq!(TagValue::Discrete(0).as_status_code(), 0);
    }

    #[test]
    fn flow_tag_convention() {
        assert_eq!(flow_tag("PU4"), "PU4F");
    }
}
