//! The presentation thread.
//! Every mutation of an observable property or collection runs here, on one
//! dedicated thread that drains a job queue in order.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use anyhow::{Result, anyhow};
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::BleError;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_PRESENTATION_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A clonable handle that sends work to the presentation thread.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Starts the presentation thread. It stops once every handle is dropped.
    pub fn spawn() -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new()
            .name("presentation".to_string())
            .spawn(move || {
                ON_PRESENTATION_THREAD.with(|flag| flag.set(true));
                info!("Presentation thread started.");

                while let Some(job) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("A presentation job panicked; continuing with the next one.");
                    }
                }

                info!("Presentation thread stopped.");
            })?;

        Ok(Self { tx })
    }

    /// Returns true when called from the presentation thread.
    pub fn is_presentation_thread() -> bool {
        ON_PRESENTATION_THREAD.with(|flag| flag.get())
    }

    /// Queues `job` without waiting for it.
    pub fn begin_invoke<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("Dropped a presentation job: the presentation thread has stopped.");
        }
    }

    /// Runs `job` on the presentation thread and waits for its result.
    /// Runs inline when the caller is already on the presentation thread.
    pub async fn invoke<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if Self::is_presentation_thread() {
            return Ok(job());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = done_tx.send(job());
            }))
            .map_err(|_| anyhow!(BleError::DispatcherClosed))?;

        // A panicking job drops `done_tx` without sending.
        done_rx
            .await
            .map_err(|_| anyhow!("Presentation job did not complete"))
    }
}
