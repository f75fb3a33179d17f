//! `ReducerControl` (spec §4.5.5) — the scheduled voltage dip, grounded
//! on `caen_tools/SystemCheck/scripts/reducer.py`. Mutates
//! [`super::relax::RelaxControl`]'s memo slice directly for the duration
//! of the dip rather than message-passing, per the original's "cyclic
//! coupling" shape (spec §9 design note records this as an accepted
//! deviation from the suggested message-passing rewrite, kept because
//! behaviour must remain bit-identical to the scenario in spec §8F).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::interlock::InterlockSource;
use crate::receipt::{now_ts, Receipt};
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::mchs::MchsEmitter;
use crate::supervisor::script::Script;
use crate::transport::client::AsyncClient;

/// Ramp settle time after restoring the operator target voltage.
pub const RESTORE_RAMP_WAIT: Duration = Duration::from_secs(30);

/// Memo key [`RelaxControl`](super::relax::RelaxControl) is registered under.
pub const RELAX_KEY: &str = "check/autopilot/relax";

/// Periodically dips the voltage to `reduced_voltage` for the tail of
/// each cycle, unless the interlock is already handling the reduction.
pub struct ReducerControl {
    memo: SharedMemo,
    client: AsyncClient,
    source: Box<dyn InterlockSource>,
    mchs: Arc<MchsEmitter>,
    reduced_voltage: f64,
    sender: String,
}

impl std::fmt::Debug for ReducerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerControl").finish_non_exhaustive()
    }
}

impl ReducerControl {
    /// Builds a reducer script that dips to `reduced_voltage`.
    pub fn new(memo: SharedMemo, client: AsyncClient, source: Box<dyn InterlockSource>, mchs: Arc<MchsEmitter>, reduced_voltage: f64) -> Self {
        Self {
            memo,
            client,
            source,
            mchs,
            reduced_voltage,
            sender: "check/autopilot/reducer".to_string(),
        }
    }

    fn reducing_period(&self) -> f64 {
        self.memo
            .lock()
            .expect("memo mutex poisoned")
            .script(self.name())
            .and_then(|s| s.reducing_period)
            .unwrap_or(0.0)
    }

    fn repeat_every(&self) -> f64 {
        self.memo.lock().expect("memo mutex poisoned").script(self.name()).map_or(0.0, |s| s.repeat_every)
    }

    fn stash_relax(&self) -> (Option<f64>, Option<f64>) {
        let mut memo = self.memo.lock().expect("memo mutex poisoned");
        let Some(relax) = memo.script_mut(RELAX_KEY) else {
            return (None, None);
        };
        let stashed = (relax.target_voltage, relax.voltage_modifier);
        relax.target_voltage = Some(self.reduced_voltage);
        relax.voltage_modifier = Some(1.0);
        stashed
    }

    fn restore_relax(&self, stashed: (Option<f64>, Option<f64>)) {
        if let Some(relax) = self.memo.lock().expect("memo mutex poisoned").script_mut(RELAX_KEY) {
            relax.target_voltage = stashed.0;
            relax.voltage_modifier = stashed.1;
        }
    }

    async fn set_voltage(&self, target_voltage: f64) {
        let receipt = Receipt::new(
            &self.sender,
            "device_backend",
            "set_voltage",
            json!({ "target_voltage": target_voltage, "from_user": false }),
        );
        let _ = self.client.query(receipt).await;
    }

    fn record(&self, status: CheckStatus) {
        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: status,
                timestamp: now_ts(),
            });
        }
    }
}

#[async_trait]
impl Script for ReducerControl {
    fn name(&self) -> &str {
        "check/autopilot/reducer"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let reducing_period = self.reducing_period();
        let idle = (self.repeat_every() - reducing_period).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(idle)).await;

        if self.source.read_state().await.current_state {
            self.record(CheckStatus::Ok);
            return;
        }

        let stashed = self.stash_relax();
        self.set_voltage(self.reduced_voltage).await;
        tokio::time::sleep(Duration::from_secs_f64(reducing_period)).await;

        self.restore_relax(stashed);

        if self.source.read_state().await.current_state {
            self.mchs.set_flag("noreducing", true);
            self.record(CheckStatus::Ok);
            return;
        }

        let restore_target = stashed.0.unwrap_or(0.0);
        self.set_voltage(restore_target).await;
        tokio::time::sleep(RESTORE_RAMP_WAIT).await;
        self.mchs.set_flag("noreducing", true);
        self.record(CheckStatus::Ok);
    }

    async fn on_stop(&self) {
        self.mchs.pop_flag("noreducing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::FakeInterlockSource;
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};
    use std::collections::HashMap;

    #[tokio::test]
    async fn scenario_f_scheduled_dip_stashes_and_restores_relax() {
        let mchs_memo = MchsMemo { udp_ip: "127.0.0.1".into(), udp_port: 1, client_id: "t".into() };
        let mut memo = Memo::new(mchs_memo);
        memo.set_script(RELAX_KEY, ScriptMemo { target_voltage: Some(100.0), voltage_modifier: Some(1.0), ..ScriptMemo::new(300.0) });
        memo.set_script(
            "check/autopilot/reducer",
            ScriptMemo { reducing_period: Some(0.01), ..ScriptMemo::new(0.02) },
        );
        let memo = shared(memo);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interlock");
        std::fs::write(&path, "0").unwrap();

        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let mchs = Arc::new(MchsEmitter::bind("t", "127.0.0.1", addr.port()).await.unwrap());

        let client = AsyncClient::new(HashMap::new());
        let reducer = ReducerControl::new(memo.clone(), client, Box::new(FakeInterlockSource::new(&path)), mchs, 40.0);

        let (stashed_target, stashed_modifier) = reducer.stash_relax();
        assert_eq!(stashed_target, Some(100.0));
        assert_eq!(stashed_modifier, Some(1.0));
        {
            let locked = memo.lock().unwrap();
            let relax = locked.script(RELAX_KEY).unwrap();
            assert_eq!(relax.target_voltage, Some(40.0));
            assert_eq!(relax.voltage_modifier, Some(1.0));
        }

        reducer.restore_relax((stashed_target, stashed_modifier));
        let locked = memo.lock().unwrap();
        let relax = locked.script(RELAX_KEY).unwrap();
        assert_eq!(relax.target_voltage, Some(100.0));
    }
}
