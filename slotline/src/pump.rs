//! Dedicated busy-polling threads.
//!
//! Each role runs exactly one pump. The pump body loops while its running
//! flag is set and returns its outcome through the join handle, so a fatal
//! error inside the loop surfaces from `stop`.

use crate::error::{Result, SlotlineError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

pub(crate) struct Pump {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Pump {
    /// Start `body` on a new thread, optionally pinned to `core`.
    ///
    /// Returns once the thread is placed; a pinning failure is returned
    /// here and the body never runs.
    pub(crate) fn spawn<F>(name: &'static str, core: Option<usize>, body: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let (placed_tx, placed_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        let handle = std::thread::Builder::new()
            .name(format!("slotline-{name}"))
            .spawn(move || {
                if let Some(core) = core
                    && let Err(e) = pin_current(name, core)
                {
                    let _ = placed_tx.send(Err(e));
                    return Ok(());
                }
                let _ = placed_tx.send(Ok(()));
                drop(placed_tx);

                let outcome = body(&flag);
                match &outcome {
                    Ok(()) => tracing::info!(pump = name, "pump: stopped"),
                    Err(e) => tracing::error!(pump = name, "pump: exiting on fatal error: {e}"),
                }
                outcome
            })?;

        match placed_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(SlotlineError::PumpPanicked(name));
            }
        }

        tracing::info!(pump = name, core = ?core, "pump: started");
        Ok(Self {
            name,
            running,
            handle: Some(handle),
        })
    }

    /// Clear the running flag and join. Only the first call observes the
    /// pump's outcome; later calls return `Ok(())`.
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| SlotlineError::PumpPanicked(self.name))?
    }

    /// Whether the pump thread is still looping.
    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Pin the calling thread to `core`.
pub fn pin_current(thread: &'static str, core: usize) -> Result<()> {
    let id = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.id == core)
        .ok_or(SlotlineError::Affinity { thread, core })?;
    if !core_affinity::set_for_current(id) {
        return Err(SlotlineError::Affinity { thread, core });
    }
    tracing::debug!(thread, core, "pump: pinned");
    Ok(())
}
