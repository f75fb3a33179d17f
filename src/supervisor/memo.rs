//! The shared memo (spec §3, §5): a process-wide mapping keyed by script
//! name that scripts use to publish status and that the façade reads to
//! report and toggle supervisor state.
//!
//! Per Design Notes §9, the two-process (worker + API) split in the
//! original is collapsed into one process hosting both the script loop
//! tasks and the façade-facing API task, sharing one `Mutex`-protected
//! [`Memo`] rather than a cross-process manager. Critical sections are
//! single-field reads/writes with no `.await` held across the lock, so a
//! synchronous `std::sync::Mutex` is used rather than an async one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Outcome recorded by a script after each tick (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Completed normally.
    Ok,
    /// The device backend failed to answer or errored.
    DevbackError,
    /// The monitor service failed to answer or errored.
    MonitorError,
    /// The health state machine reached a hard failure verdict.
    Failure,
}

/// The result of the most recent tick of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    /// What happened.
    pub statuscode: CheckStatus,
    /// When it happened (epoch seconds).
    pub timestamp: i64,
}

/// One script's slice of the shared memo.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMemo {
    /// Whether the manager should keep this script's loop running.
    pub enable: bool,
    /// Tick cadence, in seconds.
    pub repeat_every: f64,
    /// Outcome of the most recent tick, if any has run yet.
    pub last_check: Option<CheckResult>,
    /// Operator target voltage (relax, reducer).
    pub target_voltage: Option<f64>,
    /// Multiplier applied to `target_voltage` while the interlock is
    /// engaged (relax, reducer).
    pub voltage_modifier: Option<f64>,
    /// Length of the active dip phase, in seconds (reducer only).
    pub reducing_period: Option<f64>,
}

impl ScriptMemo {
    /// A freshly-disabled slice with the given cadence.
    pub fn new(repeat_every: f64) -> Self {
        Self {
            enable: false,
            repeat_every,
            last_check: None,
            target_voltage: None,
            voltage_modifier: None,
            reducing_period: None,
        }
    }
}

/// MChS UDP sink addressing, held as a distinguished top-level memo entry
/// (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct MchsMemo {
    /// Destination host/IP for the ACK/NACK datagram.
    pub udp_ip: String,
    /// Destination port.
    pub udp_port: u16,
    /// Identifier embedded in the datagram payload.
    pub client_id: String,
}

/// The shared memo: per-script slices plus the MChS addressing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Memo {
    scripts: HashMap<String, ScriptMemo>,
    /// MChS sink addressing.
    pub mchs: MchsMemo,
}

impl Memo {
    /// Builds an empty memo with the given MChS addressing.
    pub fn new(mchs: MchsMemo) -> Self {
        Self {
            scripts: HashMap::new(),
            mchs,
        }
    }

    /// Inserts or replaces a script's slice.
    pub fn set_script(&mut self, name: impl Into<String>, slice: ScriptMemo) {
        self.scripts.insert(name.into(), slice);
    }

    /// Reads a script's slice, if registered.
    pub fn script(&self, name: &str) -> Option<&ScriptMemo> {
        self.scripts.get(name)
    }

    /// Mutably reads a script's slice, if registered.
    pub fn script_mut(&mut self, name: &str) -> Option<&mut ScriptMemo> {
        self.scripts.get_mut(name)
    }

    /// Names of every registered script.
    pub fn script_names(&self) -> Vec<String> {
        self.scripts.keys().cloned().collect()
    }
}

/// A memo shared between the script loop tasks and the façade-facing API.
pub type SharedMemo = Arc<Mutex<Memo>>;

/// Wraps a fresh [`Memo`] for sharing.
pub fn shared(memo: Memo) -> SharedMemo {
    Arc::new(Mutex::new(memo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_a_script_slice() {
        let mchs = MchsMemo {
            udp_ip: "127.0.0.1".into(),
            udp_port: 9999,
            client_id: "hv01".into(),
        };
        let mut memo = Memo::new(mchs);
        memo.set_script("health", ScriptMemo::new(1.0));
        assert!(memo.script("health").unwrap().enable == false);
        memo.script_mut("health").unwrap().enable = true;
        assert!(memo.script("health").unwrap().enable);
    }
}
