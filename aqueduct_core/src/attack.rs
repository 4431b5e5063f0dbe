//! Deterministic, iteration-windowed attack injection.
//!
//! An attack descriptor is loaded once at startup and is immutable for the
//! rest of the run. The injector itself is a pure function of the global
//! iteration counter and the descriptor - no clock, no randomness - so a
//! run with the same configuration replays the same attack exactly.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::PlcError;

/// Override command applied to a target actuator while an attack window is
/// active. Parsed leniently: an unrecognized command string in the
/// configuration downgrades to a warning and the nominal control decision
/// is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackCommand {
    /// Force the actuator open (status 1).
    Open,
    /// Force the actuator closed (status 0).
    Close,
    /// Flip the actuator's current status.
    Toggle,
    /// Suppress the controller's write for this tick; the previous value
    /// persists in the store.
    Maintain,
}

impl AttackCommand {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Open" => Some(Self::Open),
            "Close" => Some(Self::Close),
            "Toggle" => Some(Self::Toggle),
            "Maintain" => Some(Self::Maintain),
            _ => None,
        }
    }

    /// The status value to force, given the actuator's current status.
    /// `None` means no write this tick (`Maintain`).
    pub fn apply(&self, current: i64) -> Option<i64> {
        match self {
            Self::Open => Some(1),
            Self::Close => Some(0),
            Self::Toggle => Some(if current == 0 { 1 } else { 0 }),
            Self::Maintain => None,
        }
    }
}

/// How the attack presents itself; concealment kinds require the
/// sensor-side flag to be raised by a different component than the one
/// executing the override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttackKind {
    #[serde(rename = "device", alias = "device_attack")]
    Device,
    #[serde(rename = "network", alias = "network_attack")]
    Network,
    #[default]
    #[serde(rename = "none")]
    None,
}

/// A scripted override of nominal control behavior, active over the
/// half-open iteration window `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackDescriptor {
    pub name: String,
    /// Target actuator tags. Only controllers owning one of these apply
    /// the override.
    pub actuators: Vec<String>,
    /// Raw command string; resolved at apply time so typos stay non-fatal.
    pub command: String,
    /// First iteration the override applies to (inclusive).
    pub start: u64,
    /// First iteration the override no longer applies to (exclusive).
    pub end: u64,
    #[serde(rename = "type", default)]
    pub kind: AttackKind,
}

impl AttackDescriptor {
    /// The parsed command, warning once per call on an unknown string.
    pub fn parsed_command(&self) -> Option<AttackCommand> {
        let cmd = AttackCommand::parse(&self.command);
        if cmd.is_none() {
            warn!(attack = %self.name, command = %self.command, "unsupported attack command, keeping nominal decision");
        }
        cmd
    }

    /// Whether any target actuator belongs to the given owned set.
    pub fn targets_any(&self, owned: &HashSet<String>) -> bool {
        self.actuators.iter().any(|a| owned.contains(a))
    }
}

/// Injector verdict for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackDecision {
    /// Before the window: nothing to do.
    Inactive,
    /// Inside `[start, end)`: apply the override.
    Activate(AttackCommand),
    /// At or past `end`: the override has no further effect; the flag
    /// tags must read 0 again.
    Deactivate,
}

/// The pure decision function: `(iteration, descriptor) → verdict`.
pub fn decide(iteration: u64, descriptor: &AttackDescriptor) -> AttackDecision {
    if iteration < descriptor.start {
        AttackDecision::Inactive
    } else if iteration < descriptor.end {
        match descriptor.parsed_command() {
            Some(cmd) => AttackDecision::Activate(cmd),
            None => AttackDecision::Inactive,
        }
    } else {
        AttackDecision::Deactivate
    }
}

/// Whether the flag tags should read 1 at this iteration.
pub fn flag_value(iteration: u64, descriptor: &AttackDescriptor) -> i64 {
    if iteration >= descriptor.start && iteration < descriptor.end {
        1
    } else {
        0
    }
}

#[derive(Debug, Deserialize)]
struct AttackFile {
    attacks: Vec<AttackDescriptor>,
}

/// Loads the named descriptor from an `attacks:` YAML file.
///
/// A missing file or an unknown name is an invalid configuration: fatal at
/// startup, before any partial run is attempted.
pub fn load_descriptor(path: &Path, name: &str) -> Result<AttackDescriptor, PlcError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PlcError::Configuration(format!("cannot read attack file {}: {e}", path.display()))
    })?;
    let file: AttackFile = serde_yaml::from_str(&raw).map_err(|e| {
        PlcError::Configuration(format!("malformed attack file {}: {e}", path.display()))
    })?;
    file.attacks
        .into_iter()
        .find(|a| a.name == name)
        .ok_or_else(|| {
            PlcError::Configuration(format!("no attack named {name:?} in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(command: &str, start: u64, end: u64) -> AttackDescriptor {
        AttackDescriptor {
            name: "close_v2".to_string(),
            actuators: vec!["V2".to_string()],
            command: command.to_string(),
            start,
            end,
            kind: AttackKind::Device,
        }
    }

    #[test]
    fn window_is_half_open() {
        let d = descriptor("Close", 3, 6);
        assert_eq!(decide(2, &d), AttackDecision::Inactive);
        assert_eq!(decide(3, &d), AttackDecision::Activate(AttackCommand::Close));
        assert_eq!(decide(5, &d), AttackDecision::Activate(AttackCommand::Close));
        assert_eq!(decide(6, &d), AttackDecision::Deactivate);
        assert_eq!(decide(100, &d), AttackDecision::Deactivate);
    }

    #[test]
    fn toggle_twice_restores_original() {
        for original in [0, 1] {
            let once = AttackCommand::Toggle.apply(original).unwrap();
            let twice = AttackCommand::Toggle.apply(once).unwrap();
            assert_eq!(twice, original);
        }
    }

    #[test]
    fn maintain_issues_no_write() {
        assert_eq!(AttackCommand::Maintain.apply(0), None);
        assert_eq!(AttackCommand::Maintain.apply(1), None);
    }

    #[test]
    fn open_close_force_status() {
        assert_eq!(AttackCommand::Open.apply(0), Some(1));
        assert_eq!(AttackCommand::Close.apply(1), Some(0));
    }

    #[test]
    fn unknown_command_is_non_fatal() {
        let d = descriptor("Explode", 0, 10);
        assert_eq!(decide(5, &d), AttackDecision::Inactive);
    }

    #[test]
    fn flag_tracks_window() {
        let d = descriptor("Close", 3, 6);
        assert_eq!(flag_value(2, &d), 0);
        assert_eq!(flag_value(3, &d), 1);
        assert_eq!(flag_value(5, &d), 1);
        assert_eq!(flag_value(6, &d), 0);
    }

    #[test]
    fn targets_intersects_owned_set() {
        let d = descriptor("Close", 0, 1);
        let mut owned = HashSet::new();
        owned.insert("PU4".to_string());
        assert!(!d.targets_any(&owned));
        owned.insert("V2".to_string());
        assert!(d.targets_any(&owned));
    }

    #[test]
    fn loads_named_descriptor_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attacks.yaml");
        std::fs::write(
            &path,
            "attacks:\n  - name: close_v2\n    actuators: [V2]\n    command: Close\n    start: 3\n    end: 6\n    type: device_attack\n",
        )
        .unwrap();
        let d = load_descriptor(&path, "close_v2").unwrap();
        assert_eq!(d.actuators, vec!["V2".to_string()]);
        assert_eq!(d.kind, AttackKind::Device);
        assert!(load_descriptor(&path, "missing").is_err());
    }
}
