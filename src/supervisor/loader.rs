//! `LoaderControl` (spec §4.5.1) — pulls telemetry from the device and
//! ships it to the monitor, grounded on
//! `caen_tools/SystemCheck/scripts/loader.py`.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::json;

use crate::receipt::{now_ts, Receipt};
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::script::Script;
use crate::transport::client::AsyncClient;

/// Fields pulled from `device_backend.params` each tick.
pub const SELECT_PARAMS: &[&str] = &["VMon", "IMonH", "IMonL", "ChStatus", "ImonRange"];

/// Pulls the selected parameter set from the device and archives it.
pub struct LoaderControl {
    memo: SharedMemo,
    client: AsyncClient,
    sender: String,
    last_statuscode: StdMutex<Option<CheckStatus>>,
}

impl std::fmt::Debug for LoaderControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderControl").finish_non_exhaustive()
    }
}

impl LoaderControl {
    /// Builds a loader script that talks to device/monitor through `client`.
    pub fn new(memo: SharedMemo, client: AsyncClient) -> Self {
        Self {
            memo,
            client,
            sender: "check/loader".to_string(),
            last_statuscode: StdMutex::new(None),
        }
    }

    /// The outcome of the most recently completed tick, for tests.
    pub fn last_statuscode(&self) -> Option<CheckStatus> {
        *self.last_statuscode.lock().expect("mutex poisoned")
    }

    fn record(&self, status: CheckStatus) {
        *self.last_statuscode.lock().expect("mutex poisoned") = Some(status);
        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: status,
                timestamp: now_ts(),
            });
        }
    }
}

#[async_trait]
impl Script for LoaderControl {
    fn name(&self) -> &str {
        "check/loader"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let params_receipt = Receipt::new(
            &self.sender,
            "device_backend",
            "params",
            json!({ "select_params": SELECT_PARAMS }),
        );
        let answered = match self.client.query(params_receipt).await {
            Ok(answered) => answered,
            Err(err) => {
                tracing::warn!(error = %err, "loader: device query failed");
                self.record(CheckStatus::DevbackError);
                return;
            }
        };

        let Some(response) = answered.response else {
            self.record(CheckStatus::DevbackError);
            return;
        };
        if !response.is_ok() {
            self.record(CheckStatus::DevbackError);
            return;
        }

        let send_params = Receipt::new(
            &self.sender,
            "monitor",
            "send_params",
            json!({ "params": response.body["params"], "measurement_time": now_ts() }),
        );
        let answered = match self.client.query(send_params).await {
            Ok(answered) => answered,
            Err(err) => {
                tracing::warn!(error = %err, "loader: monitor query failed");
                self.record(CheckStatus::MonitorError);
                return;
            }
        };

        match answered.response {
            Some(response) if response.is_ok() => self.record(CheckStatus::Ok),
            _ => self.record(CheckStatus::MonitorError),
        }
    }
}
