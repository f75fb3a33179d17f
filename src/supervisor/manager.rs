//! `ManagerScript` (spec §4.5) — the only place shared-memo changes
//! observably flip scripts on and off, grounded on
//! `caen_tools/SystemCheck/scripts/manager.py`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::supervisor::mchs::MchsEmitter;
use crate::supervisor::script::ScriptHandle;

/// Polls `trigger()` on every registered script once per `tick_every`,
/// then emits one MChS datagram for the tick — mirroring how the
/// original `manager.py` loop calls each script's `send_mchs()` (which
/// itself pairs a `set_state()` with a `send_state()`) once per pass.
#[derive(Debug)]
pub struct ManagerScript {
    scripts: Vec<Arc<ScriptHandle>>,
    tick_every: Duration,
    mchs: Option<Arc<MchsEmitter>>,
}

impl ManagerScript {
    /// Builds a manager over `scripts`, ticking every `tick_every`. Pass
    /// `mchs` to emit one ACK/NACK datagram per tick after the scripts
    /// run; `None` skips emission (e.g. in tests that don't care about
    /// the MChS sink).
    pub fn new(scripts: Vec<Arc<ScriptHandle>>, tick_every: Duration, mchs: Option<Arc<MchsEmitter>>) -> Self {
        Self { scripts, tick_every, mchs }
    }

    /// The scripts this manager oversees, by memo key.
    pub fn script(&self, name: &str) -> Option<&Arc<ScriptHandle>> {
        self.scripts.iter().find(|handle| handle.name() == name)
    }

    /// Runs the manager loop until `cancel` is triggered, then stops
    /// every script and returns (spec §5 "soft-stop, grace period, hard
    /// kill" — the grace period itself is the caller's responsibility,
    /// e.g. racing this future against a timeout).
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            for handle in &self.scripts {
                handle.trigger().await;
            }

            if let Some(mchs) = &self.mchs {
                if let Err(err) = mchs.send_state().await {
                    tracing::warn!(error = %err, "manager: mchs send_state failed");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.tick_every) => {}
            }
        }

        for handle in &self.scripts {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};
    use crate::supervisor::script::Script;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoOpScript {
        memo: crate::supervisor::memo::SharedMemo,
        name: &'static str,
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Script for NoOpScript {
        fn name(&self) -> &str {
            self.name
        }

        fn memo(&self) -> &crate::supervisor::memo::SharedMemo {
            &self.memo
        }

        async fn exec_function(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn manager_starts_enabled_scripts_and_stops_on_cancel() {
        let mchs = MchsMemo {
            udp_ip: "127.0.0.1".into(),
            udp_port: 1,
            client_id: "t".into(),
        };
        let mut memo = Memo::new(mchs);
        memo.set_script("a", ScriptMemo { enable: true, ..ScriptMemo::new(0.01) });
        let memo = shared(memo);

        let ticks = Arc::new(AtomicU32::new(0));
        let script = Arc::new(NoOpScript { memo: memo.clone(), name: "a", ticks: ticks.clone() });
        let handle = Arc::new(ScriptHandle::new(script));
        let manager = ManagerScript::new(vec![handle.clone()], Duration::from_millis(5), None);

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run = tokio::spawn(async move { manager.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        run.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 1);
        assert!(!handle.is_running());
    }
}
