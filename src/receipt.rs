//! The receipt envelope — the single request/reply message shape that
//! flows between every service in the system.
//!
//! A [`Receipt`] is produced by a sender, addressed to an `executor`
//! (logical service name), and carries an operation `title` plus
//! free-form `params`. The executor (or the transport layer, on
//! timeout/routing failure) fills in exactly one [`ReceiptResponse`].
//!
//! Wire format is plain UTF-8 JSON; a value is recognized as a receipt by
//! the simultaneous presence of `sender` and `executor` fields, mirroring
//! the original Python system's `ReceiptJSONDecoder.object_hook`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `statuscode` meaning success (spec §3).
pub const STATUS_OK: i32 = 1;
/// `statuscode` meaning an application-level failure (executor ran but failed).
pub const STATUS_APPLICATION_ERROR: i32 = 0;
/// Envelope error: operation disabled by policy.
pub const STATUS_FORBIDDEN: i32 = 403;
/// Envelope error: unknown route or unknown executor.
pub const STATUS_NOT_FOUND: i32 = 404;
/// Envelope error: no reply arrived within the receive timeout.
pub const STATUS_GATEWAY_TIMEOUT: i32 = 503;

/// Returns the current unix timestamp in whole seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The result half of a [`Receipt`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptResponse {
    /// `1` success, `0` application failure, else an envelope HTTP-style code.
    pub statuscode: i32,
    /// Arbitrary response payload — a string or a JSON object, per spec.
    pub body: Value,
    /// Epoch seconds when the response was produced.
    pub timestamp: i64,
}

impl ReceiptResponse {
    /// Builds a response stamped with the current time.
    pub fn new(statuscode: i32, body: Value) -> Self {
        Self {
            statuscode,
            body,
            timestamp: now_ts(),
        }
    }

    /// Shorthand for a successful response.
    pub fn ok(body: Value) -> Self {
        Self::new(STATUS_OK, body)
    }

    /// Shorthand for an application-level failure; `body` carries the cause.
    pub fn application_error(cause: impl Into<String>) -> Self {
        Self::new(STATUS_APPLICATION_ERROR, Value::String(cause.into()))
    }

    /// Shorthand for an envelope `404`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(STATUS_NOT_FOUND, Value::String(message.into()))
    }

    /// Shorthand for an envelope `403`.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(STATUS_FORBIDDEN, Value::String(message.into()))
    }

    /// Shorthand for an envelope `503`.
    pub fn gateway_timeout() -> Self {
        Self::new(STATUS_GATEWAY_TIMEOUT, Value::String("no response".into()))
    }

    /// True when `statuscode == 1`.
    pub fn is_ok(&self) -> bool {
        self.statuscode == STATUS_OK
    }
}

/// Immutable envelope of one request/reply exchange (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    /// Logical name of the script/service that created this receipt.
    pub sender: String,
    /// Logical name of the service this receipt is addressed to.
    pub executor: String,
    /// Operation name, interpreted by the executor.
    pub title: String,
    /// Operation parameters.
    pub params: Value,
    /// Epoch seconds when the receipt was created.
    pub timestamp: i64,
    /// Filled exactly once, by the executor or by the transport.
    #[serde(default)]
    pub response: Option<ReceiptResponse>,
}

impl Receipt {
    /// Creates a fresh, unanswered receipt stamped with the current time.
    pub fn new(sender: impl Into<String>, executor: impl Into<String>, title: impl Into<String>, params: Value) -> Self {
        Self {
            sender: sender.into(),
            executor: executor.into(),
            title: title.into(),
            params,
            timestamp: now_ts(),
            response: None,
        }
    }

    /// Returns a copy of this receipt with `response` attached.
    pub fn with_response(mut self, response: ReceiptResponse) -> Self {
        self.response = Some(response);
        self
    }
}
