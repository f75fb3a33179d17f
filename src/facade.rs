//! The façade boundary (spec §4.7) — out of scope beyond its interface.
//!
//! `FacadeQuery` is what a façade process calls against the supervisor's
//! `system_check` API identity: a memo snapshot read and a script
//! enable/disable toggle. [`ClientFacadeQuery`] is the one concrete
//! implementation, a thin wrapper over [`AsyncClient`] — the façade
//! itself speaks the same receipt protocol as every other client, it
//! just happens to expose HTTP on the other side.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::receipt::Receipt;
use crate::transport::client::AsyncClient;

/// What the façade needs from the supervisor's API identity.
#[async_trait]
pub trait FacadeQuery: Send + Sync {
    /// Fetches a JSON snapshot of every script's memo slice.
    async fn snapshot(&self) -> anyhow::Result<Value>;

    /// Enables or disables one script by memo key.
    async fn set_enabled(&self, script: &str, enable: bool) -> anyhow::Result<Value>;
}

/// Talks to the supervisor's `system_check` identity over the receipt
/// transport.
#[derive(Debug, Clone)]
pub struct ClientFacadeQuery {
    client: AsyncClient,
    sender: String,
}

impl ClientFacadeQuery {
    /// Builds a façade query client over `client` (already configured
    /// with a `system_check` endpoint).
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            sender: "facade".to_string(),
        }
    }
}

#[async_trait]
impl FacadeQuery for ClientFacadeQuery {
    async fn snapshot(&self) -> anyhow::Result<Value> {
        let receipt = Receipt::new(&self.sender, "system_check", "snapshot", json!({}));
        let answered = self.client.query(receipt).await?;
        Ok(answered.response.map_or(Value::Null, |r| r.body))
    }

    async fn set_enabled(&self, script: &str, enable: bool) -> anyhow::Result<Value> {
        let receipt = Receipt::new(&self.sender, "system_check", "set_enabled", json!({ "script": script, "enable": enable }));
        let answered = self.client.query(receipt).await?;
        Ok(answered.response.map_or(Value::Null, |r| r.body))
    }
}
