//! The `device_backend` worker (spec §4.3).
//!
//! Wraps an opaque [`DeviceDriver`] and answers receipts addressed to
//! `device_backend`. Owns the two pieces of process-local state the
//! original `DeviceBackend.back` module keeps outside the shared memo:
//! whether user-originated voltage changes are currently allowed, and
//! the last voltage a user asked for.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::receipt::{Receipt, ReceiptResponse};

/// One channel's telemetry fields, as read from the driver (spec §3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    /// Measured voltage.
    pub v_mon: f64,
    /// Set voltage.
    pub v_set: f64,
    /// Rated voltage.
    pub v_def: f64,
    /// High-range current.
    pub i_mon_h: f64,
    /// Low-range current.
    pub i_mon_l: f64,
    /// `0` = high range in use, `1` = low range in use.
    pub imon_range: u8,
    /// 15-bit status word.
    pub ch_status: u16,
}

impl ChannelSample {
    /// Serializes the fields named by `select`, or all fields if `None`.
    pub fn to_selected_json(&self, select: Option<&[String]>) -> Value {
        let all: Vec<(&str, Value)> = vec![
            ("VMon", json!(self.v_mon)),
            ("VSet", json!(self.v_set)),
            ("VDef", json!(self.v_def)),
            ("IMonH", json!(self.i_mon_h)),
            ("IMonL", json!(self.i_mon_l)),
            ("ImonRange", json!(self.imon_range)),
            ("ChStatus", json!(self.ch_status)),
        ];
        match select {
            None => Value::Object(all.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
            Some(fields) => Value::Object(
                all.into_iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == k))
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
        }
    }
}

/// The physical-device boundary this service drives. A real implementation
/// talks to CAEN hardware; [`FakeDriver`] below is a deterministic stand-in
/// for tests.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Commands every channel to `target_voltage`.
    async fn set_voltage(&self, target_voltage: f64) -> anyhow::Result<()>;

    /// Reads the current per-channel telemetry, keyed by channel alias.
    async fn read_channels(&self) -> anyhow::Result<HashMap<String, ChannelSample>>;
}

/// An in-memory [`DeviceDriver`] for tests: channels ramp instantly to
/// whatever voltage was last commanded, status always `ON` (bit 0).
#[derive(Debug)]
pub struct FakeDriver {
    channels: Mutex<HashMap<String, ChannelSample>>,
}

impl FakeDriver {
    /// Builds a driver seeded with the given channel samples.
    pub fn new(channels: HashMap<String, ChannelSample>) -> Self {
        Self {
            channels: Mutex::new(channels),
        }
    }

    /// Overwrites one channel's sample directly (test setup helper).
    #[allow(clippy::missing_panics_doc, reason = "test-only helper, poisoned mutex is a test bug")]
    pub fn set_channel(&self, alias: &str, sample: ChannelSample) {
        self.channels.lock().expect("fake driver mutex poisoned").insert(alias.to_string(), sample);
    }
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    async fn set_voltage(&self, target_voltage: f64) -> anyhow::Result<()> {
        let mut channels = self.channels.lock().expect("fake driver mutex poisoned");
        for sample in channels.values_mut() {
            sample.v_set = target_voltage;
            sample.v_mon = target_voltage;
        }
        Ok(())
    }

    async fn read_channels(&self) -> anyhow::Result<HashMap<String, ChannelSample>> {
        Ok(self.channels.lock().expect("fake driver mutex poisoned").clone())
    }
}

/// Production placeholder: documents where the real CAEN SDK driver
/// plugs in without pulling a vendor SDK into this crate. Every call
/// fails with an application error rather than silently pretending to
/// drive hardware.
#[derive(Debug, Default)]
pub struct UnimplementedDriver;

#[async_trait]
impl DeviceDriver for UnimplementedDriver {
    async fn set_voltage(&self, _target_voltage: f64) -> anyhow::Result<()> {
        anyhow::bail!("no CAEN driver wired in; replace UnimplementedDriver with the real SDK binding")
    }

    async fn read_channels(&self) -> anyhow::Result<HashMap<String, ChannelSample>> {
        anyhow::bail!("no CAEN driver wired in; replace UnimplementedDriver with the real SDK binding")
    }
}

/// The `device_backend` service: dispatches receipts to the driver and
/// tracks `ENABLE_USER_SET` / `USER_TARGET_VOLTAGE`.
pub struct DeviceBackend {
    driver: Box<dyn DeviceDriver>,
    enable_user_set: Mutex<bool>,
    user_target_voltage: Mutex<f64>,
}

impl std::fmt::Debug for DeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBackend").finish_non_exhaustive()
    }
}

impl DeviceBackend {
    /// Builds a backend around `driver`, with user-set enabled by default.
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            enable_user_set: Mutex::new(true),
            user_target_voltage: Mutex::new(0.0),
        }
    }

    /// Dispatches one receipt and returns it with `.response` filled in.
    pub async fn handle(&self, receipt: Receipt) -> Receipt {
        let response = match receipt.title.as_str() {
            "status" => ReceiptResponse::ok(json!({})),
            "params" => self.handle_params(&receipt.params).await,
            "set_voltage" => self.handle_set_voltage(&receipt.params).await,
            "down" => self.handle_down().await,
            "get_voltage" => self.handle_get_voltage().await,
            "get_user_permission" => {
                let enabled = *self.enable_user_set.lock().expect("mutex poisoned");
                ReceiptResponse::ok(json!({ "enable_user_set": enabled }))
            }
            "set_user_permission" => self.handle_set_user_permission(&receipt.params),
            "last_user_voltage" => {
                let last = *self.user_target_voltage.lock().expect("mutex poisoned");
                ReceiptResponse::ok(json!({ "last_user_voltage": last }))
            }
            other => ReceiptResponse::not_found(format!("unknown title: {other}")),
        };
        receipt.with_response(response)
    }

    async fn handle_params(&self, params: &Value) -> ReceiptResponse {
        let select: Option<Vec<String>> = params
            .get("select_params")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());

        match self.driver.read_channels().await {
            Ok(channels) => {
                let out: serde_json::Map<String, Value> = channels
                    .into_iter()
                    .map(|(alias, sample)| (alias, sample.to_selected_json(select.as_deref())))
                    .collect();
                ReceiptResponse::ok(json!({ "params": out }))
            }
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_set_voltage(&self, params: &Value) -> ReceiptResponse {
        let Some(target_voltage) = params.get("target_voltage").and_then(Value::as_f64) else {
            return ReceiptResponse::application_error("missing target_voltage");
        };
        let from_user = params.get("from_user").and_then(Value::as_bool).unwrap_or(false);

        if from_user && !*self.enable_user_set.lock().expect("mutex poisoned") {
            return ReceiptResponse::forbidden("user-originated set_voltage is disabled");
        }

        match self.driver.set_voltage(target_voltage).await {
            Ok(()) => {
                if from_user {
                    *self.user_target_voltage.lock().expect("mutex poisoned") = target_voltage;
                }
                ReceiptResponse::ok(json!({ "target_voltage": target_voltage }))
            }
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_down(&self) -> ReceiptResponse {
        match self.driver.set_voltage(0.0).await {
            Ok(()) => {
                *self.user_target_voltage.lock().expect("mutex poisoned") = 0.0;
                ReceiptResponse::ok(json!({}))
            }
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_get_voltage(&self) -> ReceiptResponse {
        match self.driver.read_channels().await {
            Ok(channels) => {
                let (set_sum, def_sum) = channels
                    .values()
                    .fold((0.0, 0.0), |(s, d), sample| (s + sample.v_set, d + sample.v_def));
                let ratio = if def_sum == 0.0 { Value::Null } else { json!(set_sum / def_sum) };
                ReceiptResponse::ok(json!({ "voltage": ratio }))
            }
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    fn handle_set_user_permission(&self, params: &Value) -> ReceiptResponse {
        let Some(enable) = params.get("enable_user_set").and_then(Value::as_bool) else {
            return ReceiptResponse::application_error("missing enable_user_set");
        };
        *self.enable_user_set.lock().expect("mutex poisoned") = enable;
        ReceiptResponse::ok(json!({ "enable_user_set": enable }))
    }
}

#[async_trait]
impl crate::transport::server::ReceiptDispatch for DeviceBackend {
    async fn dispatch(&self, receipt: Receipt) -> Receipt {
        self.handle(receipt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f64) -> ChannelSample {
        ChannelSample {
            v_mon: v,
            v_set: v,
            v_def: 100.0,
            i_mon_h: 1.0,
            i_mon_l: 0.0,
            imon_range: 0,
            ch_status: 1,
        }
    }

    fn backend() -> DeviceBackend {
        let mut channels = HashMap::new();
        channels.insert("ch0".to_string(), sample(100.0));
        DeviceBackend::new(Box::new(FakeDriver::new(channels)))
    }

    #[tokio::test]
    async fn user_set_voltage_forbidden_when_disabled() {
        let backend = backend();
        let disable = Receipt::new("test", "device_backend", "set_user_permission", json!({"enable_user_set": false}));
        backend.handle(disable).await;

        let receipt = Receipt::new("test", "device_backend", "set_voltage", json!({"target_voltage": 50.0, "from_user": true}));
        let answered = backend.handle(receipt).await;
        assert_eq!(answered.response.unwrap().statuscode, 403);
    }

    #[tokio::test]
    async fn last_user_voltage_reflects_most_recent_user_set() {
        let backend = backend();
        let set = Receipt::new("test", "device_backend", "set_voltage", json!({"target_voltage": 42.0, "from_user": true}));
        backend.handle(set).await;

        let query = Receipt::new("test", "device_backend", "last_user_voltage", json!({}));
        let answered = backend.handle(query).await;
        assert_eq!(answered.response.unwrap().body, json!({"last_user_voltage": 42.0}));
    }

    #[tokio::test]
    async fn down_resets_user_target_voltage() {
        let backend = backend();
        let set = Receipt::new("test", "device_backend", "set_voltage", json!({"target_voltage": 42.0, "from_user": true}));
        backend.handle(set).await;

        let down = Receipt::new("test", "device_backend", "down", json!({}));
        backend.handle(down).await;

        let query = Receipt::new("test", "device_backend", "last_user_voltage", json!({}));
        let answered = backend.handle(query).await;
        assert_eq!(answered.response.unwrap().body, json!({"last_user_voltage": 0.0}));
    }

    #[tokio::test]
    async fn unknown_title_is_404() {
        let backend = backend();
        let receipt = Receipt::new("test", "device_backend", "nonsense", json!({}));
        let answered = backend.handle(receipt).await;
        assert_eq!(answered.response.unwrap().statuscode, 404);
    }

    #[tokio::test]
    async fn get_voltage_is_null_when_vdef_sums_to_zero() {
        let mut channels = HashMap::new();
        channels.insert("ch0".to_string(), ChannelSample { v_def: 0.0, ..sample(0.0) });
        let backend = DeviceBackend::new(Box::new(FakeDriver::new(channels)));
        let receipt = Receipt::new("test", "device_backend", "get_voltage", json!({}));
        let answered = backend.handle(receipt).await;
        assert_eq!(answered.response.unwrap().body, json!({"voltage": null}));
    }
}
