//! Restart-on-failure guard around the server loop.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{ServiceError, ShutdownSignal};
use crate::runtime::budget::panic_message;

/// A long-running loop the supervisor can relaunch.
pub trait Supervised {
    /// Run until `shutdown` reports true or a failure escapes.
    fn serve(&mut self, shutdown: &dyn ShutdownSignal) -> Result<(), ServiceError>;

    /// Release every resource; called once when supervision ends.
    fn shutdown(&mut self);
}

/// Relaunches a [`Supervised`] loop after errors and panics until shutdown.
pub struct Supervisor<S> {
    service: S,
    restart_delay: Duration,
    restarts: u64,
}

impl<S: Supervised> Supervisor<S> {
    /// Supervise `service`, pausing `restart_delay` between launches.
    pub fn new(service: S, restart_delay: Duration) -> Self {
        Self {
            service,
            restart_delay,
            restarts: 0,
        }
    }

    /// Number of relaunches so far.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// The supervised service.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Run the service until `shutdown` is set, then tear it down.
    pub fn run(&mut self, shutdown: &dyn ShutdownSignal) {
        while !shutdown.is_shutdown() {
            let launched = panic::catch_unwind(AssertUnwindSafe(|| self.service.serve(shutdown)));
            match launched {
                Ok(Ok(())) if shutdown.is_shutdown() => break,
                Ok(Ok(())) => warn!(restarts = self.restarts, "server loop returned early"),
                Ok(Err(err)) => error!(
                    status = "error",
                    payload = %err,
                    restarts = self.restarts,
                    "server loop failed"
                ),
                Err(payload) => error!(
                    status = "panic",
                    payload = %panic_message(payload.as_ref()),
                    restarts = self.restarts,
                    "server loop panicked"
                ),
            }
            if shutdown.is_shutdown() {
                break;
            }
            self.restarts += 1;
            thread::sleep(self.restart_delay);
        }
        self.service.shutdown();
        info!(restarts = self.restarts, "supervisor stopped");
    }

    /// Recover the service.
    pub fn into_inner(self) -> S {
        self.service
    }
}
