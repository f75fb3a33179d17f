//! `RelaxControl` (spec §4.5.4) — the interlock reactor, grounded on
//! `caen_tools/SystemCheck/scripts/relax.py`. Holds `target_voltage` and
//! `voltage_modifier` in its own memo slice; [`super::reducer::ReducerControl`]
//! stashes and overwrites these values directly while the scheduled dip is
//! active (spec §9 "cyclic coupling" design note) — this script always
//! reads them fresh from the memo rather than caching them.

use async_trait::async_trait;
use serde_json::json;

use crate::interlock::InterlockSource;
use crate::receipt::{now_ts, Receipt};
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::script::Script;
use crate::transport::client::AsyncClient;

/// Voltage differences smaller than this are treated as already-converged
/// (spec §4.5.4).
pub const VOLTAGE_EPSILON: f64 = 1e-4;

/// Reacts to the interlock by scaling the operator's target voltage.
pub struct RelaxControl {
    memo: SharedMemo,
    client: AsyncClient,
    source: Box<dyn InterlockSource>,
    sender: String,
}

impl std::fmt::Debug for RelaxControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaxControl").finish_non_exhaustive()
    }
}

impl RelaxControl {
    /// Builds a relax script over its own interlock source instance.
    pub fn new(memo: SharedMemo, client: AsyncClient, source: Box<dyn InterlockSource>) -> Self {
        Self {
            memo,
            client,
            source,
            sender: "check/autopilot/relax".to_string(),
        }
    }

    fn memo_targets(&self) -> (f64, f64) {
        let memo = self.memo.lock().expect("memo mutex poisoned");
        let slice = memo.script(self.name());
        (
            slice.and_then(|s| s.target_voltage).unwrap_or(0.0),
            slice.and_then(|s| s.voltage_modifier).unwrap_or(1.0),
        )
    }

    fn record(&self, status: CheckStatus) {
        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: status,
                timestamp: now_ts(),
            });
        }
    }

    async fn set_voltage(&self, target_voltage: f64) -> bool {
        let receipt = Receipt::new(
            &self.sender,
            "device_backend",
            "set_voltage",
            json!({ "target_voltage": target_voltage, "from_user": false }),
        );
        match self.client.query(receipt).await {
            Ok(answered) => answered.response.is_some_and(|r| r.is_ok()),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Script for RelaxControl {
    fn name(&self) -> &str {
        "check/autopilot/relax"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let get_voltage = Receipt::new(&self.sender, "device_backend", "get_voltage", json!({}));
        let current_multiplier = match self.client.query(get_voltage).await {
            Ok(answered) => answered.response.and_then(|r| r.body.get("voltage").and_then(|v| v.as_f64())),
            Err(_) => None,
        };
        let Some(current_multiplier) = current_multiplier else {
            self.record(CheckStatus::DevbackError);
            return;
        };

        let interlock = self.source.read_state().await;
        let (target_voltage, voltage_modifier) = self.memo_targets();
        let reduced = target_voltage * voltage_modifier;

        let ok = if interlock.current_state {
            if (current_multiplier - reduced).abs() > VOLTAGE_EPSILON {
                self.set_voltage(reduced).await
            } else {
                true
            }
        } else if (current_multiplier - target_voltage).abs() > VOLTAGE_EPSILON {
            self.set_voltage(target_voltage).await
        } else {
            true
        };

        self.record(if ok { CheckStatus::Ok } else { CheckStatus::DevbackError });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::FakeInterlockSource;
    use crate::services::{ChannelSample, DeviceBackend, FakeDriver};
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};
    use crate::transport::server::RouterServer;
    use std::collections::HashMap;

    async fn spawn_device_backend() -> String {
        let mut channels = HashMap::new();
        channels.insert(
            "ch0".to_string(),
            ChannelSample { v_mon: 100.0, v_set: 100.0, v_def: 100.0, i_mon_h: 1.0, i_mon_l: 0.0, imon_range: 0, ch_status: 1 },
        );
        let backend = DeviceBackend::new(Box::new(FakeDriver::new(channels)));
        let mut server = RouterServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            while let Some(inbound) = server.recv_receipt().await {
                let answered = backend.handle(inbound.receipt().clone()).await;
                server.send_receipt(&inbound, answered).await;
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn scenario_e_interlock_reactor_reduces_then_restores() {
        let addr = spawn_device_backend().await;
        let mut endpoints = HashMap::new();
        endpoints.insert("device_backend".to_string(), addr);
        let client = AsyncClient::new(endpoints);

        let mchs = MchsMemo { udp_ip: "127.0.0.1".into(), udp_port: 1, client_id: "t".into() };
        let mut memo = Memo::new(mchs);
        memo.set_script(
            "check/autopilot/relax",
            ScriptMemo { target_voltage: Some(100.0), voltage_modifier: Some(0.4), ..ScriptMemo::new(1.0) },
        );
        let memo = shared(memo);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interlock");
        std::fs::write(&path, "1").unwrap();
        let relax = RelaxControl::new(memo, client, Box::new(FakeInterlockSource::new(&path)));

        relax.exec_function().await;
        assert_eq!(relax.record_for_test(), Some(CheckStatus::Ok));

        std::fs::write(&path, "0").unwrap();
        relax.exec_function().await;
        assert_eq!(relax.record_for_test(), Some(CheckStatus::Ok));
    }

    impl RelaxControl {
        fn record_for_test(&self) -> Option<CheckStatus> {
            self.memo.lock().unwrap().script(self.name()).and_then(|s| s.last_check).map(|c| c.statuscode)
        }
    }
}
