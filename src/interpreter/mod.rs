//! The scripting language executed by the service.
//!
//! Requests carry source text in a small Lua-flavoured language: locals,
//! closures, tables, loops and multiple return values, without metatables or
//! coroutines. Source is lexed and parsed into an AST up front, so syntax
//! errors surface before any step of execution is spent; the tree-walking
//! evaluator then charges one governor step per statement, expression node
//! and call.

/// Abstract syntax tree definitions for the script language.
pub mod ast;
/// Builtin library and host binding registration.
pub mod builtins;
/// Tree-walking evaluator.
pub mod eval;
/// Tokenizer.
pub mod lexer;
/// Recursive-descent parser.
pub mod parser;
/// Runtime value model.
pub mod value;

pub use ast::Chunk;
pub use builtins::{HostBindings, Registry};
pub use eval::Interpreter;
pub use parser::parse_chunk;
pub use value::{Function, Key, Table, Value};

use crate::runtime::budget::Exhausted;
use thiserror::Error;

/// Convenience result alias for interpreter operations.
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Errors surfaced by the parser and the evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// Source text could not be parsed.
    #[error("syntax error: {message} at line {line}")]
    Syntax {
        /// Description of the problem.
        message: String,
        /// 1-based line where it was detected.
        line: u32,
    },

    /// Execution raised an error.
    #[error("{0}")]
    Runtime(String),

    /// The step governor stopped execution.
    #[error(transparent)]
    Exhausted(#[from] Exhausted),
}

impl ScriptError {
    /// Whether this error came from the step governor.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ScriptError::Exhausted(_))
    }
}
