//! Runs application callbacks away from the link and session threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send>;

/// A FIFO of callbacks executed on one dedicated thread.
///
/// One dispatcher per logical peer keeps `on_received` calls in delivery
/// order while a slow handler only ever stalls its own queue. The thread ends
/// once every clone of the dispatcher is dropped.
#[derive(Clone)]
pub(crate) struct EventDispatcher {
    tx: Sender<Job>,
}

impl EventDispatcher {
    pub(crate) fn spawn(name: String) -> Result<EventDispatcher> {
        let (tx, rx) = channel::<Job>();
        let thread_name = name.clone();
        std::thread::Builder::new().name(name).spawn(move || {
            for job in rx {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::warn!("{thread_name}: event handler panicked");
                }
            }
        })?;
        Ok(EventDispatcher { tx })
    }

    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            log::debug!("Event dropped, dispatcher is gone");
        }
    }
}
