//! Periodic driver of the jitter buffer's pop side

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::depacketizer::Depacketizer;
use crate::error::{PipelineError, Result};
use crate::utils::SignalOfStop;

/// Calls [`Depacketizer::process_pop`] every `tick` on a background thread.
///
/// `stop()` returns only after the thread has exited, so no pop runs after it.
pub struct PopTimer {
    depacketizer: Arc<Depacketizer>,
    tick: Duration,
    sos: SignalOfStop,
    handle: Option<JoinHandle<()>>,
}

impl PopTimer {
    pub fn new(depacketizer: Arc<Depacketizer>, tick: Duration) -> Self {
        Self {
            depacketizer,
            tick,
            sos: SignalOfStop::new(),
            handle: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.sos = SignalOfStop::new();
        let sos = self.sos.clone();
        let depacketizer = self.depacketizer.clone();
        let tick = self.tick;

        let handle = thread::Builder::new()
            .name("jitter-pop".into())
            .spawn(move || {
                while !sos.wait_timeout(tick) {
                    depacketizer.process_pop();
                }
            })
            .map_err(PipelineError::Io)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Ask the thread to exit without waiting for it
    pub fn request_stop(&self) {
        self.sos.cancel();
    }

    pub fn stop(&mut self) {
        self.sos.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.sos.cancelled()
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Drop for PopTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
