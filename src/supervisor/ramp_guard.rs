//! `RampGuard` (spec §4.5.6) — a thin ramping probe, grounded on
//! `caen_tools/SystemCheck/scripts/ramp_guard.py`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::receipt::{now_ts, Receipt};
use crate::supervisor::health::is_ramping;
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::mchs::MchsEmitter;
use crate::supervisor::script::Script;
use crate::transport::client::AsyncClient;

/// Reports `noramping = ¬is_ramping` to MChS from `ChStatus` alone.
pub struct RampGuard {
    memo: SharedMemo,
    client: AsyncClient,
    mchs: Arc<MchsEmitter>,
    sender: String,
}

impl std::fmt::Debug for RampGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RampGuard").finish_non_exhaustive()
    }
}

impl RampGuard {
    /// Builds a ramp guard.
    pub fn new(memo: SharedMemo, client: AsyncClient, mchs: Arc<MchsEmitter>) -> Self {
        Self {
            memo,
            client,
            mchs,
            sender: "check/autopilot/ramp_guard".to_string(),
        }
    }
}

#[async_trait]
impl Script for RampGuard {
    fn name(&self) -> &str {
        "check/autopilot/ramp_guard"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let receipt = Receipt::new(&self.sender, "device_backend", "params", json!({ "select_params": ["ChStatus"] }));
        let answered = match self.client.query(receipt).await {
            Ok(answered) => answered,
            Err(_) => {
                self.record(CheckStatus::DevbackError);
                return;
            }
        };

        let Some(params) = answered
            .response
            .filter(|r| r.is_ok())
            .and_then(|r| r.body.get("params").and_then(Value::as_object).cloned())
        else {
            self.record(CheckStatus::DevbackError);
            return;
        };

        let any_ramping = params
            .values()
            .filter_map(|fields| fields.get("ChStatus").and_then(Value::as_u64))
            .any(|ch_status| is_ramping(ch_status as u16));

        self.mchs.set_flag("noramping", !any_ramping);
        self.record(CheckStatus::Ok);
    }

    async fn on_stop(&self) {
        self.mchs.pop_flag("noramping");
    }
}

impl RampGuard {
    fn record(&self, status: CheckStatus) {
        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: status,
                timestamp: now_ts(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ChannelSample, DeviceBackend, FakeDriver};
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};
    use crate::supervisor::health::{BIT_ON, BIT_RAMPING_UP};
    use crate::transport::server::RouterServer;
    use std::collections::HashMap;

    #[tokio::test]
    async fn noramping_false_while_a_channel_ramps() {
        let mut channels = HashMap::new();
        channels.insert(
            "ch0".to_string(),
            ChannelSample { v_mon: 50.0, v_set: 100.0, v_def: 100.0, i_mon_h: 1.0, i_mon_l: 0.0, imon_range: 0, ch_status: BIT_ON | BIT_RAMPING_UP },
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

        let mut endpoints = HashMap::new();
        endpoints.insert("device_backend".to_string(), addr.to_string());
        let client = AsyncClient::new(endpoints);

        let mchs_memo = MchsMemo { udp_ip: "127.0.0.1".into(), udp_port: 1, client_id: "t".into() };
        let mut memo = Memo::new(mchs_memo);
        memo.set_script("check/autopilot/ramp_guard", ScriptMemo::new(1.0));
        let memo = shared(memo);

        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mchs_addr = receiver.local_addr().unwrap();
        let mchs = Arc::new(MchsEmitter::bind("t", "127.0.0.1", mchs_addr.port()).await.unwrap());

        let guard = RampGuard::new(memo, client, mchs.clone());
        guard.exec_function().await;

        mchs.send_state().await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"NACK t");
    }
}
