//! The MChS state emitter (spec §4.5.7, §6) — aggregates per-script
//! ACK/NACK flags by logical AND and emits a UDP datagram, grounded on
//! `caen_tools/SystemCheck/scripts/mchswork.py`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

/// Aggregates named boolean health flags and emits `ACK`/`NACK` datagrams.
pub struct MchsEmitter {
    socket: UdpSocket,
    target: String,
    client_id: String,
    flags: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for MchsEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MchsEmitter")
            .field("target", &self.target)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl MchsEmitter {
    /// Binds an ephemeral UDP socket and targets `udp_ip:udp_port`.
    pub async fn bind(client_id: impl Into<String>, udp_ip: &str, udp_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("binding mchs udp socket")?;
        Ok(Self {
            socket,
            target: format!("{udp_ip}:{udp_port}"),
            client_id: client_id.into(),
            flags: Mutex::new(HashMap::new()),
        })
    }

    /// Sets (or clears) one named flag — e.g. `"healthok"`, `"nointerlock"`,
    /// `"noramping"`, `"noreducing"`.
    pub fn set_flag(&self, key: &str, value: bool) {
        self.flags.lock().expect("mutex poisoned").insert(key.to_string(), value);
    }

    /// Removes a named flag so it no longer participates in the AND —
    /// called from a script's `on_stop()` so a disabled script cannot
    /// veto the overall ACK (spec §4.5.7).
    pub fn pop_flag(&self, key: &str) {
        self.flags.lock().expect("mutex poisoned").remove(key);
    }

    /// True iff every currently-set flag is true.
    pub fn all_ok(&self) -> bool {
        self.flags.lock().expect("mutex poisoned").values().all(|&v| v)
    }

    /// Sends `"ACK <client_id>"` if every flag is true, else
    /// `"NACK <client_id>"`.
    pub async fn send_state(&self) -> Result<()> {
        let payload = if self.all_ok() {
            format!("ACK {}", self.client_id)
        } else {
            format!("NACK {}", self.client_id)
        };
        self.socket
            .send_to(payload.as_bytes(), &self.target)
            .await
            .with_context(|| format!("sending mchs datagram to {}", self.target))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn acks_when_all_flags_true() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let emitter = MchsEmitter::bind("hv01", "127.0.0.1", addr.port()).await.unwrap();
        emitter.set_flag("healthok", true);
        emitter.set_flag("nointerlock", true);
        emitter.send_state().await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ACK hv01");
    }

    #[tokio::test]
    async fn nacks_when_any_flag_false() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let emitter = MchsEmitter::bind("hv01", "127.0.0.1", addr.port()).await.unwrap();
        emitter.set_flag("healthok", true);
        emitter.set_flag("nointerlock", false);
        emitter.send_state().await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"NACK hv01");
    }

    #[tokio::test]
    async fn popped_flag_no_longer_vetoes_ack() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let emitter = MchsEmitter::bind("hv01", "127.0.0.1", addr.port()).await.unwrap();
        emitter.set_flag("healthok", true);
        emitter.set_flag("noreducing", false);
        emitter.pop_flag("noreducing");
        emitter.send_state().await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ACK hv01");
    }
}
