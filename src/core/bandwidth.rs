//! Per-job speed limiting over a one second window

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct BandwidthController {
    limit: Arc<RwLock<Option<u64>>>,
    state: Arc<Mutex<BandwidthState>>,
}

#[derive(Debug)]
struct BandwidthState {
    window_start: Instant,
    bytes_in_window: u64,
}

impl BandwidthState {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }
}

impl Default for BandwidthController {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthController {
    /// Unlimited
    pub fn new() -> Self {
        Self {
            limit: Arc::new(RwLock::new(None)),
            state: Arc::new(Mutex::new(BandwidthState::new())),
        }
    }

    /// Bytes per second; 0 means unlimited
    pub fn with_limit(bytes_per_second: u64) -> Self {
        Self {
            limit: Arc::new(RwLock::new(
                (bytes_per_second > 0).then_some(bytes_per_second),
            )),
            state: Arc::new(Mutex::new(BandwidthState::new())),
        }
    }

    pub async fn set_limit(&self, bytes_per_second: Option<u64>) {
        *self.limit.write().await = bytes_per_second.filter(|limit| *limit > 0);
    }

    pub async fn limit(&self) -> Option<u64> {
        *self.limit.read().await
    }

    /// Account `bytes` against the current window and sleep off the part of
    /// them that goes over the limit. Earlier calls already slept off their
    /// own excess. Shared by every part of the job.
    pub async fn throttle(&self, bytes: u64) {
        let Some(limit) = *self.limit.read().await else {
            return;
        };
        let mut state = self.state.lock().await;
        if state.window_start.elapsed() >= Duration::from_secs(1) {
            state.window_start = Instant::now();
            state.bytes_in_window = 0;
        }
        let over_before = state.bytes_in_window.saturating_sub(limit);
        state.bytes_in_window += bytes;
        let excess = state.bytes_in_window.saturating_sub(limit) - over_before;
        drop(state);

        if excess > 0 {
            sleep(Duration::from_secs_f64(excess as f64 / limit as f64)).await;
        }
    }
}
