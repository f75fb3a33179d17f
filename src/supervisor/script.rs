//! The `Script` abstraction (spec §4.5) — a cooperative unit of work
//! scheduled on its own `repeat_every` cadence, grounded on
//! `caen_tools/SystemCheck/scripts/metascript.py`'s `Script` ABC.
//!
//! The original runs every script as a coroutine on one event loop; here
//! each [`ScriptHandle`] owns a `tokio::spawn`ed task instead, giving the
//! "one iteration of a script runs at a time, `stop()` takes effect at
//! the next suspension point" contract from Design Notes §9 without
//! requiring every script to share one OS thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::supervisor::memo::SharedMemo;

/// A script-specific unit of work, ticked on its own cadence.
#[async_trait]
pub trait Script: Send + Sync {
    /// The memo key this script owns.
    fn name(&self) -> &str;

    /// The shared memo this script reads/writes its slice of.
    fn memo(&self) -> &SharedMemo;

    /// Runs one tick. Implementations are expected to update their own
    /// `last_check` memo entry before returning.
    async fn exec_function(&self);

    /// Runs once when the script transitions disabled -> enabled.
    async fn on_start(&self) {}

    /// Runs once when the script transitions enabled -> disabled.
    async fn on_stop(&self) {}
}

fn repeat_every(memo: &SharedMemo, name: &str) -> Duration {
    let seconds = memo
        .lock()
        .expect("memo mutex poisoned")
        .script(name)
        .map_or(1.0, |slice| slice.repeat_every);
    Duration::from_secs_f64(seconds.max(0.0))
}

fn is_enabled(memo: &SharedMemo, name: &str) -> bool {
    memo.lock().expect("memo mutex poisoned").script(name).is_some_and(|slice| slice.enable)
}

fn set_enabled(memo: &SharedMemo, name: &str, enable: bool) {
    if let Some(slice) = memo.lock().expect("memo mutex poisoned").script_mut(name) {
        slice.enable = enable;
    }
}

/// Runs a [`Script`] as a managed background task, exposing the
/// `start_ifnot`/`stop`/`trigger` lifecycle from spec §4.5.
pub struct ScriptHandle {
    script: Arc<dyn Script>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHandle").field("name", &self.script.name()).finish_non_exhaustive()
    }
}

impl ScriptHandle {
    /// Wraps `script` in a runnable handle, initially stopped.
    pub fn new(script: Arc<dyn Script>) -> Self {
        Self {
            script,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// The memo key this handle's script owns.
    pub fn name(&self) -> &str {
        self.script.name()
    }

    /// Whether the loop task is currently spawned.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent start: marks the script enabled, runs `on_start`, and
    /// spawns its loop task if one isn't already running.
    pub async fn start_ifnot(&self) {
        set_enabled(self.script.memo(), self.script.name(), true);
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.script.on_start().await;

        let script = self.script.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move { run_loop(script, running).await });
        *self.task.lock().await = Some(handle);
    }

    /// Marks the script disabled and cancels its loop task at the next
    /// suspension point, then runs `on_stop`.
    pub async fn stop(&self) {
        set_enabled(self.script.memo(), self.script.name(), false);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        self.script.on_stop().await;
    }

    /// Starts or stops the script to match its memo `enable` flag. Called
    /// by the manager once per tick (spec §4.5 `ManagerScript`).
    pub async fn trigger(&self) {
        let enabled = is_enabled(self.script.memo(), self.script.name());
        let running = self.is_running();
        if enabled && !running {
            self.start_ifnot().await;
        } else if !enabled && running {
            self.stop().await;
        }
    }
}

async fn run_loop(script: Arc<dyn Script>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }

        let started = Instant::now();
        script.exec_function().await;
        let elapsed = started.elapsed();

        let enabled = is_enabled(script.memo(), script.name());
        if !enabled {
            running.store(false, Ordering::SeqCst);
            return;
        }

        let period = repeat_every(script.memo(), script.name());
        let remaining = period.checked_sub(elapsed).unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::memo::{shared, MchsMemo, Memo, ScriptMemo};
    use std::sync::atomic::AtomicU32;

    struct CountingScript {
        memo: SharedMemo,
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Script for CountingScript {
        fn name(&self) -> &str {
            "counting"
        }

        fn memo(&self) -> &SharedMemo {
            &self.memo
        }

        async fn exec_function(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_memo(repeat_every: f64) -> SharedMemo {
        let mchs = MchsMemo {
            udp_ip: "127.0.0.1".into(),
            udp_port: 1,
            client_id: "t".into(),
        };
        let mut memo = Memo::new(mchs);
        memo.set_script("counting", ScriptMemo::new(repeat_every));
        shared(memo)
    }

    #[tokio::test]
    async fn start_ifnot_runs_multiple_ticks() {
        let memo = test_memo(0.01);
        let ticks = Arc::new(AtomicU32::new(0));
        let script = Arc::new(CountingScript { memo, ticks: ticks.clone() });
        let handle = ScriptHandle::new(script);

        handle.start_ifnot().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn trigger_respects_memo_enable_flag() {
        let memo = test_memo(10.0);
        let ticks = Arc::new(AtomicU32::new(0));
        let script = Arc::new(CountingScript { memo: memo.clone(), ticks });
        let handle = ScriptHandle::new(script);

        memo.lock().unwrap().script_mut("counting").unwrap().enable = true;
        handle.trigger().await;
        assert!(handle.is_running());

        memo.lock().unwrap().script_mut("counting").unwrap().enable = false;
        handle.trigger().await;
        assert!(!handle.is_running());
    }
}
