//! Step-bounded execution and result rendering
//!
//! This module ties the interpreter to the step governor and the serializer:
//! one request's code runs under the compute budget, and its result renders
//! under the separate serialization budget.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod budget;
pub mod executor;
pub mod serializer;

pub use budget::{Exhausted, Governor, Outcome};
pub use executor::{ExecutionResult, execute, render_response};
pub use serializer::{SerializationContext, render};

/// Default step budget for running request code.
pub const DEFAULT_COMPUTE_BUDGET: u64 = 1000;

/// Default step budget for rendering a result.
pub const DEFAULT_SERIALIZE_BUDGET: u64 = 10_000;

/// Per-request execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Steps available to the submitted code
    pub compute_budget: u64,

    /// Steps available to render the result
    pub serialize_budget: u64,

    /// Nesting depth beyond which composites render as `"<too deep>"`
    pub depth_cap: usize,

    /// Maximum nested function calls inside a script
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            compute_budget: DEFAULT_COMPUTE_BUDGET,
            serialize_budget: DEFAULT_SERIALIZE_BUDGET,
            depth_cap: serializer::DEFAULT_DEPTH_CAP,
            max_call_depth: crate::interpreter::eval::DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl Limits {
    /// Set the compute budget.
    pub fn with_compute_budget(mut self, steps: u64) -> Self {
        self.compute_budget = steps;
        self
    }

    /// Set the serialization budget.
    pub fn with_serialize_budget(mut self, steps: u64) -> Self {
        self.serialize_budget = steps;
        self
    }

    /// Set the serializer depth cap.
    pub fn with_depth_cap(mut self, depth_cap: usize) -> Self {
        self.depth_cap = depth_cap;
        self
    }

    /// Set the call depth limit.
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Reject limits that would make every request fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compute_budget == 0 {
            return Err(ConfigError::Zero("compute_budget"));
        }
        if self.serialize_budget == 0 {
            return Err(ConfigError::Zero("serialize_budget"));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Zero("max_call_depth"));
        }
        Ok(())
    }
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A setting that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
