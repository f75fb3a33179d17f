//! `HealthControl` (spec §4.5.2) — the per-channel status/current/trip-time
//! state machine, grounded on
//! `caen_tools/SystemCheck/scripts/health.py`. This implements the
//! "last-breath" variant (spec §9 Open Question: adopted as authoritative).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::receipt::{now_ts, Receipt};
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::mchs::MchsEmitter;
use crate::supervisor::script::{Script, ScriptHandle};
use crate::transport::client::AsyncClient;

/// `ChStatus` bit for "ON".
pub const BIT_ON: u16 = 1 << 0;
/// `ChStatus` bit for "ramping up".
pub const BIT_RAMPING_UP: u16 = 1 << 1;
/// `ChStatus` bit for "ramping down".
pub const BIT_RAMPING_DOWN: u16 = 1 << 2;
/// `ChStatus` bit for "over-voltage".
pub const BIT_OVER_VOLTAGE: u16 = 1 << 3;
/// `ChStatus` bit for "under-voltage".
pub const BIT_UNDER_VOLTAGE: u16 = 1 << 4;
/// Mask covering all ten fault bits (3..=12).
pub const FAULT_BITS_MASK: u16 = 0b0111_1111_1111_1000;
/// Mask covering every fault bit except over/under-voltage.
const OTHER_FAULT_BITS_MASK: u16 = FAULT_BITS_MASK & !(BIT_OVER_VOLTAGE | BIT_UNDER_VOLTAGE);

/// `true` iff no fault bit (3..=12) is set — "good status" (spec §3).
pub fn is_good_status(ch_status: u16) -> bool {
    ch_status & FAULT_BITS_MASK == 0
}

/// `true` iff the channel's only fault is over- or under-voltage.
pub fn is_over_or_under_voltage_only(ch_status: u16) -> bool {
    (ch_status & (BIT_OVER_VOLTAGE | BIT_UNDER_VOLTAGE)) != 0 && (ch_status & OTHER_FAULT_BITS_MASK) == 0
}

/// `true` iff the channel is ramping (up or down).
pub fn is_ramping(ch_status: u16) -> bool {
    ch_status & (BIT_RAMPING_UP | BIT_RAMPING_DOWN) != 0
}

/// Per-channel ramp-down tolerance state, owned exclusively by
/// [`HealthControl`] (spec §3 ownership note).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampDownInfo {
    /// Currently inside the ramp-down grace window.
    pub is_rdown: bool,
    /// Configured trip time for this channel, in seconds.
    pub trip_time: f64,
    /// When the current grace window started (epoch seconds).
    pub timestamp: Option<i64>,
    /// A one-shot grace period is currently active.
    pub last_breath: bool,
}

impl RampDownInfo {
    /// A freshly-reset state for a channel with the given trip time.
    pub fn new(trip_time: f64) -> Self {
        Self {
            is_rdown: false,
            trip_time,
            timestamp: None,
            last_breath: false,
        }
    }

    fn reset(&mut self) {
        self.is_rdown = false;
        self.timestamp = None;
        self.last_breath = false;
    }

    /// Advances the FSM for one tick given the channel's current
    /// `ChStatus`, returning whether the channel counts as "good" this
    /// tick (spec §4.5.2 step 3 table).
    pub fn advance(&mut self, ch_status: u16, now: i64) -> bool {
        if is_good_status(ch_status) {
            self.reset();
            return true;
        }
        if !is_over_or_under_voltage_only(ch_status) {
            self.reset();
            return false;
        }

        let rdown_bit = ch_status & BIT_RAMPING_DOWN != 0;

        if rdown_bit {
            if self.timestamp.is_none() && !self.is_rdown && !self.last_breath {
                self.timestamp = Some(now);
                self.is_rdown = true;
                return true;
            }
            if self.is_rdown {
                let started = self.timestamp.unwrap_or(now);
                return (now - started) < self.trip_time as i64;
            }
            // Ramp-down bit reasserted from a last-breath state: start a
            // fresh grace window.
            self.timestamp = Some(now);
            self.is_rdown = true;
            self.last_breath = false;
            true
        } else {
            if !self.last_breath {
                self.last_breath = true;
                self.timestamp = Some(now);
                self.is_rdown = false;
                return true;
            }
            let started = self.timestamp.unwrap_or(now);
            let within = (now - started) < self.trip_time as i64;
            if !within {
                self.reset();
            }
            within
        }
    }
}

/// Current limits for one channel (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentLimit {
    /// Limit while the channel is ramping.
    pub volt_change: f64,
    /// Limit while the channel is steady.
    pub steady: f64,
}

/// Per-channel configuration loaded from the health config JSON.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Channel alias -> current limits.
    pub max_currents: HashMap<String, CurrentLimit>,
    /// Channel alias -> ramp-down trip time, seconds.
    pub ramp_down_trip_time: HashMap<String, f64>,
    /// `M <= low_voltage_mlt` counts as the low-voltage condition.
    pub low_voltage_mlt: f64,
}

/// Overall verdict for one tick (spec §4.5.2 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Everything nominal.
    Ack,
    /// Status/current ok, but ramping or low-voltage.
    Nack,
    /// Status or current check failed.
    Failure,
}

/// The channel status/current/trip-time state machine.
pub struct HealthControl {
    memo: SharedMemo,
    client: AsyncClient,
    mchs: Arc<MchsEmitter>,
    config: HealthConfig,
    sender: String,
    rampdown: StdMutex<HashMap<String, RampDownInfo>>,
    dependents: Vec<Arc<ScriptHandle>>,
    last_verdict: StdMutex<Option<HealthVerdict>>,
}

impl std::fmt::Debug for HealthControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthControl").finish_non_exhaustive()
    }
}

impl HealthControl {
    /// Builds a health script. `dependents` are stopped on `FAILURE`
    /// (spec §4.5.2: "typically relax+reducer").
    pub fn new(
        memo: SharedMemo,
        client: AsyncClient,
        mchs: Arc<MchsEmitter>,
        config: HealthConfig,
        dependents: Vec<Arc<ScriptHandle>>,
    ) -> Self {
        Self {
            memo,
            client,
            mchs,
            config,
            sender: "check/health".to_string(),
            rampdown: StdMutex::new(HashMap::new()),
            dependents,
            last_verdict: StdMutex::new(None),
        }
    }

    /// The verdict from the most recently completed tick, for tests.
    pub fn last_verdict(&self) -> Option<HealthVerdict> {
        *self.last_verdict.lock().expect("mutex poisoned")
    }

    fn current_limit(&self, alias: &str) -> Option<CurrentLimit> {
        self.config.max_currents.get(alias).copied()
    }

    fn trip_time(&self, alias: &str) -> f64 {
        self.config.ramp_down_trip_time.get(alias).copied().unwrap_or(0.0)
    }

    fn record(&self, status: CheckStatus) {
        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: status,
                timestamp: now_ts(),
            });
        }
    }

    async fn evaluate(&self, params: &serde_json::Map<String, Value>) -> HealthVerdict {
        let now = now_ts();
        let mut any_ramping = false;
        let mut status_ok = true;
        let mut current_ok = true;
        let (mut v_set_sum, mut v_def_sum) = (0.0, 0.0);

        let mut rampdown = self.rampdown.lock().expect("rampdown mutex poisoned");

        for (alias, fields) in params {
            let ch_status = fields.get("ChStatus").and_then(Value::as_u64).unwrap_or(0) as u16;
            let v_set = fields.get("VSet").and_then(Value::as_f64).unwrap_or(0.0);
            let v_def = fields.get("VDef").and_then(Value::as_f64).unwrap_or(0.0);
            v_set_sum += v_set;
            v_def_sum += v_def;

            if is_ramping(ch_status) {
                any_ramping = true;
            }

            let state = rampdown.entry(alias.clone()).or_insert_with(|| RampDownInfo::new(self.trip_time(alias)));
            if !state.advance(ch_status, now) {
                status_ok = false;
            }

            let imon_range = fields.get("ImonRange").and_then(Value::as_u64).unwrap_or(0);
            let current = if imon_range == 0 {
                fields.get("IMonH").and_then(Value::as_f64).unwrap_or(0.0)
            } else {
                fields.get("IMonL").and_then(Value::as_f64).unwrap_or(0.0)
            };

            match self.current_limit(alias) {
                None => current_ok = false,
                Some(limit) => {
                    let ceiling = if is_ramping(ch_status) { limit.volt_change } else { limit.steady };
                    if current >= ceiling {
                        current_ok = false;
                    }
                }
            }
        }
        drop(rampdown);

        let ratio = if v_def_sum == 0.0 { 0.0 } else { v_set_sum / v_def_sum };
        let low_voltage = ratio <= self.config.low_voltage_mlt;

        if !status_ok || !current_ok {
            HealthVerdict::Failure
        } else if any_ramping || low_voltage {
            HealthVerdict::Nack
        } else {
            HealthVerdict::Ack
        }
    }

    async fn handle_failure(&self) {
        for dependent in &self.dependents {
            dependent.stop().await;
        }
        self.mchs.set_flag("healthok", false);

        let down = Receipt::new(&self.sender, "device_backend", "down", json!({}));
        let timed_out = match self.client.query(down.clone()).await {
            Ok(answered) => answered.response.is_some_and(|resp| resp.statuscode == 503),
            Err(_) => true,
        };
        if timed_out {
            tracing::warn!("health: down receipt timed out, retrying once");
            let _ = self.client.query(down).await;
        }
    }
}

#[async_trait]
impl Script for HealthControl {
    fn name(&self) -> &str {
        "check/health"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let select = ["IMonH", "IMonL", "ImonRange", "ChStatus", "VSet", "VDef"];
        let receipt = Receipt::new(&self.sender, "device_backend", "params", json!({ "select_params": select }));
        let answered = match self.client.query(receipt).await {
            Ok(answered) => answered,
            Err(err) => {
                tracing::warn!(error = %err, "health: device query failed");
                self.record(CheckStatus::DevbackError);
                return;
            }
        };

        let Some(response) = answered.response.filter(|r| r.is_ok()) else {
            self.record(CheckStatus::DevbackError);
            return;
        };
        let Some(params) = response.body.get("params").and_then(Value::as_object) else {
            self.record(CheckStatus::DevbackError);
            return;
        };

        let verdict = self.evaluate(params).await;
        *self.last_verdict.lock().expect("mutex poisoned") = Some(verdict);

        match verdict {
            HealthVerdict::Failure => {
                self.handle_failure().await;
                self.record(CheckStatus::Failure);
            }
            HealthVerdict::Ack | HealthVerdict::Nack => {
                self.mchs.set_flag("healthok", true);
                self.record(CheckStatus::Ok);
            }
        }
    }

    async fn on_stop(&self) {
        self.mchs.pop_flag("healthok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_benign_steady_is_good() {
        let mut state = RampDownInfo::new(5.0);
        assert!(state.advance(BIT_ON, 0));
        assert!(!state.is_rdown);
    }

    #[test]
    fn scenario_b_ramping_up_is_good_status() {
        let mut state = RampDownInfo::new(5.0);
        let ch_status = BIT_ON | BIT_RAMPING_UP;
        assert!(state.advance(ch_status, 0));
        assert!(is_ramping(ch_status));
    }

    #[test]
    fn scenario_c_over_voltage_grace_then_trip() {
        let mut state = RampDownInfo::new(5.0);
        let ch_status = BIT_ON | BIT_OVER_VOLTAGE | BIT_RAMPING_DOWN;

        assert!(state.advance(ch_status, 0));
        assert!(state.is_rdown);
        assert!(state.advance(ch_status, 2));
        assert!(!state.advance(ch_status, 6));
    }

    #[test]
    fn scenario_d_last_breath_then_trip() {
        let mut state = RampDownInfo::new(5.0);
        let rdown_status = BIT_ON | BIT_OVER_VOLTAGE | BIT_RAMPING_DOWN;
        assert!(state.advance(rdown_status, 0));

        let last_breath_status = BIT_ON | BIT_OVER_VOLTAGE;
        assert!(state.advance(last_breath_status, 2));
        assert!(state.last_breath);

        assert!(state.advance(last_breath_status, 4));
        assert!(!state.advance(last_breath_status, 8));
    }

    #[test]
    fn leaving_over_under_voltage_resets_state() {
        let mut state = RampDownInfo::new(5.0);
        state.advance(BIT_ON | BIT_OVER_VOLTAGE | BIT_RAMPING_DOWN, 0);
        assert!(state.advance(BIT_ON, 1));
        assert!(!state.is_rdown);
        assert!(!state.last_breath);
        assert!(state.timestamp.is_none());
    }

    #[test]
    fn other_fault_bits_are_immediately_faulty() {
        let mut state = RampDownInfo::new(5.0);
        let over_temperature_bit = 1 << 9;
        assert!(!state.advance(BIT_ON | over_temperature_bit, 0));
    }
}
