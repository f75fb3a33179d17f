//! The supervisor's API-facing `system_check` worker identity (spec
//! §4.5, §6): answers receipts about supervisor state so the façade (or
//! any other client) can read a memo snapshot and flip a script's
//! `enable` flag without going through the manager's own tick.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::receipt::{Receipt, ReceiptResponse};
use crate::supervisor::memo::SharedMemo;

/// Answers `snapshot` / `set_enabled` receipts against a [`SharedMemo`].
#[derive(Debug, Clone)]
pub struct SupervisorApi {
    memo: SharedMemo,
}

impl SupervisorApi {
    /// Builds an API handler over `memo`.
    pub fn new(memo: SharedMemo) -> Self {
        Self { memo }
    }

    /// Dispatches one receipt and returns it with `.response` filled in.
    pub fn handle(&self, receipt: Receipt) -> Receipt {
        let response = match receipt.title.as_str() {
            "snapshot" => self.handle_snapshot(),
            "set_enabled" => self.handle_set_enabled(&receipt.params),
            other => ReceiptResponse::not_found(format!("unknown title: {other}")),
        };
        receipt.with_response(response)
    }

    fn handle_snapshot(&self) -> ReceiptResponse {
        let memo = self.memo.lock().expect("memo mutex poisoned");
        let scripts: serde_json::Map<String, Value> = memo
            .script_names()
            .into_iter()
            .filter_map(|name| {
                let slice = memo.script(&name)?;
                Some((
                    name,
                    json!({
                        "enable": slice.enable,
                        "repeat_every": slice.repeat_every,
                        "last_check": slice.last_check.map(|c| json!({
                            "statuscode": format!("{:?}", c.statuscode),
                            "timestamp": c.timestamp,
                        })),
                    }),
                ))
            })
            .collect();
        ReceiptResponse::ok(json!({ "scripts": scripts }))
    }

    fn handle_set_enabled(&self, params: &Value) -> ReceiptResponse {
        let Some(script) = params.get("script").and_then(Value::as_str) else {
            return ReceiptResponse::application_error("missing script");
        };
        let Some(enable) = params.get("enable").and_then(Value::as_bool) else {
            return ReceiptResponse::application_error("missing enable");
        };

        let mut memo = self.memo.lock().expect("memo mutex poisoned");
        match memo.script_mut(script) {
            Some(slice) => {
                slice.enable = enable;
                ReceiptResponse::ok(json!({ "script": script, "enable": enable }))
            }
            None => ReceiptResponse::not_found(format!("unknown script: {script}")),
        }
    }
}

#[async_trait]
impl crate::transport::server::ReceiptDispatch for SupervisorApi {
    async fn dispatch(&self, receipt: Receipt) -> Receipt {
        self.handle(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};

    fn api() -> SupervisorApi {
        let mchs = MchsMemo { udp_ip: "127.0.0.1".into(), udp_port: 1, client_id: "t".into() };
        let mut memo = Memo::new(mchs);
        memo.set_script("check/health", ScriptMemo::new(1.0));
        SupervisorApi::new(shared(memo))
    }

    #[test]
    fn snapshot_lists_registered_scripts() {
        let api = api();
        let receipt = Receipt::new("facade", "system_check", "snapshot", json!({}));
        let answered = api.handle(receipt);
        assert!(answered.response.unwrap().body["scripts"]["check/health"].is_object());
    }

    #[test]
    fn set_enabled_flips_the_memo_flag() {
        let api = api();
        let receipt = Receipt::new("facade", "system_check", "set_enabled", json!({"script": "check/health", "enable": true}));
        let answered = api.handle(receipt);
        assert!(answered.response.unwrap().is_ok());
        assert!(api.memo.lock().unwrap().script("check/health").unwrap().enable);
    }

    #[test]
    fn set_enabled_unknown_script_is_404() {
        let api = api();
        let receipt = Receipt::new("facade", "system_check", "set_enabled", json!({"script": "nope", "enable": true}));
        let answered = api.handle(receipt);
        assert_eq!(answered.response.unwrap().statuscode, 404);
    }
}
