//! `InterlockControl` (spec §4.5.3) — polls the external interlock source
//! and publishes its negation to MChS, grounded on
//! `caen_tools/SystemCheck/scripts/interlockfollow.py`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::interlock::InterlockSource;
use crate::receipt::now_ts;
use crate::supervisor::memo::{CheckResult, CheckStatus, SharedMemo};
use crate::supervisor::mchs::MchsEmitter;
use crate::supervisor::script::Script;

/// Polls `source` and maintains the `nointerlock` MChS flag.
pub struct InterlockControl {
    memo: SharedMemo,
    source: Box<dyn InterlockSource>,
    mchs: Arc<MchsEmitter>,
}

impl std::fmt::Debug for InterlockControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterlockControl").finish_non_exhaustive()
    }
}

impl InterlockControl {
    /// Builds an interlock poller over `source`.
    pub fn new(memo: SharedMemo, source: Box<dyn InterlockSource>, mchs: Arc<MchsEmitter>) -> Self {
        Self { memo, source, mchs }
    }
}

#[async_trait]
impl Script for InterlockControl {
    fn name(&self) -> &str {
        "check/interlock"
    }

    fn memo(&self) -> &SharedMemo {
        &self.memo
    }

    async fn exec_function(&self) {
        let state = self.source.read_state().await;
        self.mchs.set_flag("nointerlock", !state.current_state);

        if let Some(slice) = self.memo.lock().expect("memo mutex poisoned").script_mut(self.name()) {
            slice.last_check = Some(CheckResult {
                statuscode: CheckStatus::Ok,
                timestamp: now_ts(),
            });
        }
    }

    async fn on_stop(&self) {
        self.mchs.pop_flag("nointerlock");
    }
}
