//! Dual-threshold hysteresis control rules.

use serde::{Deserialize, Serialize};

use crate::PlcError;

/// One actuator's control rule: turn ON below `low_mark`, OFF above
/// `high_mark`, hold in between. The dead band between the two marks is
/// what prevents chattering around a single setpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisRule {
    /// Sensor tag the rule reads (tank level).
    pub sensor: String,
    /// Actuator tag the rule commands (pump or valve status).
    pub actuator: String,
    /// Below this level the actuator is commanded ON (1).
    pub low_mark: f64,
    /// Above this level the actuator is commanded OFF (0).
    pub high_mark: f64,
}

impl HysteresisRule {
    pub fn validate(&self) -> Result<(), PlcError> {
        if self.low_mark < self.high_mark {
            Ok(())
        } else {
            Err(PlcError::InvalidRule {
                actuator: self.actuator.clone(),
                low: self.low_mark,
                high: self.high_mark,
            })
        }
    }

    /// The commanded status for the given level, holding `current` while
    /// the level sits strictly between the two marks.
    pub fn evaluate(&self, level: f64, current: i64) -> i64 {
        if level < self.low_mark {
            1
        } else if level > self.high_mark {
            0
        } else {
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rule() -> HysteresisRule {
        HysteresisRule {
            sensor: "T2".to_string(),
            actuator: "V2".to_string(),
            low_mark: 0.5,
            high_mark: 5.5,
        }
    }

    #[test]
    fn round_trip_never_toggles_in_the_dead_band() {
        let r = rule();
        // level crosses low, wanders the band, crosses high, wanders, low again
        let levels = [0.3, 1.0, 3.0, 5.0, 6.0, 4.0, 2.0, 0.4];
        let mut cmd = 0;
        let mut seen = Vec::new();
        for level in levels {
            cmd = r.evaluate(level, cmd);
            seen.push(cmd);
        }
        assert_eq!(seen, vec![1, 1, 1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn rejects_inverted_marks() {
        let mut r = rule();
        r.low_mark = 6.0;
        assert!(matches!(r.validate(), Err(PlcError::InvalidRule { .. })));
    }

    proptest! {
        // Inside the dead band the command is always held, whatever the
        // starting state.
        #[test]
        fn dead_band_holds_state(level in 0.5f64..=5.5, current in 0i64..=1) {
            let r = rule();
            prop_assume!(level > r.low_mark && level < r.high_mark);
            prop_assert_eq!(r.evaluate(level, current), current);
        }

        // Outside the band the command depends only on the level.
        #[test]
        fn outside_band_is_stateless(level in -10.0f64..20.0, current in 0i64..=1) {
            let r = rule();
            if level < r.low_mark {
                prop_assert_eq!(r.evaluate(level, current), 1);
            } else if level > r.high_mark {
                prop_assert_eq!(r.evaluate(level, current), 0);
            }
        }
    }
}
