// Maintenance services running on the optimizer slots: the FPC
// optimizer re-compresses idle page payloads with a stronger setting,
// the session optimizer expires stale sessions. Both poll their quit
// flag between passes via the timed event, so shutdown is prompt.

use crate::compression::CompressionLevel;
use crate::concurrent::registry;
use crate::error::{CacheError, Result};
use std::thread::JoinHandle;

pub struct MaintenanceService {
    thread: Option<JoinHandle<()>>,
    slot: usize,
}

impl MaintenanceService {
    /// Spawns a service that runs `pass` every `interval_ms`
    /// milliseconds until quit is requested.
    pub fn start(
        name: &str,
        slot: usize,
        interval_ms: u32,
        pass: impl Fn() + Send + 'static,
    ) -> Result<Self> {
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _registration = registry::register_thread(slot);
                loop {
                    // the timed event doubles as an interruptible sleep
                    registry::wait_for_timed_event(interval_ms);
                    if registry::quit_requested() {
                        return;
                    }
                    pass();
                }
            })
            .map_err(|e| CacheError::Server(format!("cannot spawn maintenance thread: {e}")))?;
        Ok(Self {
            thread: Some(thread),
            slot,
        })
    }

    pub fn stop(&mut self) {
        registry::request_quit(self.slot);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MaintenanceService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default pause between optimizer passes
pub const OPTIMIZER_INTERVAL_MS: u32 = 30_000;

/// Strength used for background re-compression; request-path packing
/// stays on the fastest setting
pub const OPTIMIZER_LEVEL: CompressionLevel = CompressionLevel::Extreme;
