//! Step-count governor and the bounded runner built on it.
//!
//! Work is cancelled cooperatively: the unit of work calls [`Governor::tick`]
//! at every abstract step and unwinds with [`Exhausted`] once the budget is
//! spent. No wall clock is involved, so cancellation is deterministic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use crate::interpreter::ScriptError;

/// Raised when a governor's step budget has been spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("step budget of {budget} exhausted")]
pub struct Exhausted {
    /// The budget that was exceeded.
    pub budget: u64,
}

/// Counts abstract steps against an optional budget.
#[derive(Debug, Clone)]
pub struct Governor {
    budget: Option<u64>,
    used: u64,
}

impl Governor {
    /// Governor that fails once more than `budget` steps have been charged.
    pub fn new(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            used: 0,
        }
    }

    /// Governor that never fails; used to render fallback responses.
    pub fn unbounded() -> Self {
        Self {
            budget: None,
            used: 0,
        }
    }

    /// Charge one step.
    pub fn tick(&mut self) -> Result<(), Exhausted> {
        self.used = self.used.saturating_add(1);
        match self.budget {
            Some(budget) if self.used > budget => Err(Exhausted { budget }),
            _ => Ok(()),
        }
    }

    /// Steps charged so far.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Steps left before exhaustion; `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.budget.map(|budget| budget.saturating_sub(self.used))
    }

    /// The configured budget.
    pub fn budget(&self) -> Option<u64> {
        self.budget
    }
}

/// Why a unit of work stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The governor ran out of steps.
    Exhausted(Exhausted),
    /// The work reported an error.
    Error(String),
}

impl From<Exhausted> for Fault {
    fn from(exhausted: Exhausted) -> Self {
        Fault::Exhausted(exhausted)
    }
}

impl From<ScriptError> for Fault {
    fn from(error: ScriptError) -> Self {
        match error {
            ScriptError::Exhausted(exhausted) => Fault::Exhausted(exhausted),
            other => Fault::Error(other.to_string()),
        }
    }
}

/// Result of running a unit of work under a governor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The work finished within budget.
    Completed(T),
    /// The budget was exhausted.
    TimedOut,
    /// The work returned an error or panicked.
    Failed(String),
}

impl<T> Outcome<T> {
    /// Whether the run hit its step budget.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }
}

/// Run `work` under a fresh governor with `budget` steps.
pub fn run<T, E, F>(budget: u64, work: F) -> Outcome<T>
where
    F: FnOnce(&mut Governor) -> Result<T, E>,
    E: Into<Fault>,
{
    let mut governor = Governor::new(budget);
    run_with(&mut governor, work)
}

/// Run `work` under an existing governor.
///
/// Panics raised by the work are caught and reported as
/// [`Outcome::Failed`]; they never reach the caller.
pub fn run_with<T, E, F>(governor: &mut Governor, work: F) -> Outcome<T>
where
    F: FnOnce(&mut Governor) -> Result<T, E>,
    E: Into<Fault>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| work(governor))) {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(error)) => match error.into() {
            Fault::Exhausted(_) => Outcome::TimedOut,
            Fault::Error(message) => Outcome::Failed(message),
        },
        Err(payload) => Outcome::Failed(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_exactly_its_step_count() {
        let mut governor = Governor::new(3);
        for _ in 0..3 {
            governor.tick().expect("within budget");
        }
        assert_eq!(governor.remaining(), Some(0));
        assert_eq!(governor.tick(), Err(Exhausted { budget: 3 }));
        // stays exhausted
        assert!(governor.tick().is_err());
    }

    #[test]
    fn unbounded_governor_never_fails() {
        let mut governor = Governor::unbounded();
        for _ in 0..10_000 {
            governor.tick().expect("unbounded");
        }
        assert_eq!(governor.used(), 10_000);
        assert_eq!(governor.remaining(), None);
    }

    #[test]
    fn run_maps_exhaustion_to_timeout() {
        let outcome: Outcome<()> = run(10, |governor| -> Result<(), Fault> {
            loop {
                governor.tick()?;
            }
        });
        assert!(outcome.is_timed_out());
    }

    #[test]
    fn run_reports_errors_and_values() {
        let done = run(10, |governor| -> Result<u32, Fault> {
            governor.tick()?;
            Ok(7)
        });
        assert_eq!(done, Outcome::Completed(7));

        let failed: Outcome<()> = run(10, |_| Err(Fault::Error("bad input".into())));
        assert_eq!(failed, Outcome::Failed("bad input".into()));
    }

    #[test]
    fn run_contains_panics() {
        let outcome: Outcome<()> = run(10, |_| -> Result<(), Fault> { panic!("kaboom") });
        assert_eq!(outcome, Outcome::Failed("panic: kaboom".into()));
    }
}
