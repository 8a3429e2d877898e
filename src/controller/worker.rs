//! Worker threads for blocking card operations.
//!
//! A run-worker executes one blocking job and reports back through the
//! controller mailbox; the monitor is a long-lived thread forwarding
//! hardware events. Workers never touch the UI and share nothing with the
//! controller beyond the mailbox and a cancellation flag.

use std::io;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::card::{CancelFlag, CardEvent, CardService};

use super::{ControllerEvent, WorkerOutcome};

/// A running worker thread. Cancellation is cooperative; `join` only
/// returns once the worker has drained its in-flight card exchange.
pub struct WorkerHandle {
    cancel: CancelFlag,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn join(self) {
        if self.join.join().is_err() {
            warn!("worker thread panicked");
        }
    }
}

/// Spawn the run-worker for one blocking job. The job's final
/// [`WorkerOutcome`] is posted as [`ControllerEvent::WorkerDone`];
/// intermediate card events flow through the same mailbox.
pub fn spawn_run_worker<F>(
    name: &str,
    mailbox: SyncSender<ControllerEvent>,
    job: F,
) -> io::Result<WorkerHandle>
where
    F: FnOnce(&CancelFlag, &mut dyn FnMut(CardEvent)) -> WorkerOutcome + Send + 'static,
{
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let join = thread::Builder::new()
        .name(format!("webeid-{name}"))
        .spawn(move || {
            let event_mailbox = mailbox.clone();
            let mut events = move |event: CardEvent| {
                let _ = event_mailbox.send(ControllerEvent::Card(event));
            };
            let outcome = job(&worker_cancel, &mut events);
            if mailbox.send(ControllerEvent::WorkerDone(outcome)).is_err() {
                debug!("controller mailbox closed before worker completion");
            }
        })?;
    Ok(WorkerHandle { cancel, join })
}

/// Spawn the persistent card-event monitor.
pub fn spawn_monitor(
    service: Arc<dyn CardService>,
    mailbox: SyncSender<ControllerEvent>,
) -> io::Result<WorkerHandle> {
    let cancel = CancelFlag::new();
    let monitor_cancel = cancel.clone();
    let join = thread::Builder::new()
        .name("webeid-card-monitor".into())
        .spawn(move || {
            let mut events = |event: CardEvent| {
                let _ = mailbox.send(ControllerEvent::Card(event));
            };
            if let Err(e) = service.monitor(&monitor_cancel, &mut events) {
                warn!(error = %e, "card event monitor stopped");
            }
        })?;
    Ok(WorkerHandle { cancel, join })
}
