//! Evaluate one request and render its response envelope.

use tracing::debug;

use crate::interpreter::{HostBindings, Interpreter, Value, parse_chunk};

use super::Limits;
use super::budget::{self, Governor, Outcome};
use super::serializer::{SerializationContext, render_object};

/// Error reported when a result cannot be rendered within its budget.
pub const SERIALIZE_TIMEOUT_MESSAGE: &str = "result serialization exceeded step budget";

/// Outcome of running one request's code.
///
/// When `error` is set, `value` is always `Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// The compute or serialization budget ran out.
    pub timed_out: bool,
    /// First value returned by the code, or `Null`.
    pub value: Value,
    /// Compile, runtime or protocol error text.
    pub error: Option<String>,
    /// Request id to echo; `None` renders as `null`.
    pub request_id: Option<i64>,
}

impl ExecutionResult {
    /// Successful evaluation.
    pub fn completed(request_id: Option<i64>, value: Value) -> Self {
        Self {
            timed_out: false,
            value,
            error: None,
            request_id,
        }
    }

    /// Evaluation stopped by the compute budget.
    pub fn timeout(request_id: Option<i64>) -> Self {
        Self {
            timed_out: true,
            value: Value::Null,
            error: None,
            request_id,
        }
    }

    /// Evaluation or request failure.
    pub fn failed(request_id: Option<i64>, error: impl Into<String>) -> Self {
        Self {
            timed_out: false,
            value: Value::Null,
            error: Some(error.into()),
            request_id,
        }
    }

    fn envelope(&self) -> [(&'static str, Value); 4] {
        [
            ("timeout", Value::Bool(self.timed_out)),
            ("result", self.value.clone()),
            ("error", self.error.as_deref().map(Value::from).unwrap_or_default()),
            ("reply_id", self.request_id.map(Value::from).unwrap_or_default()),
        ]
    }
}

/// Parse and run `code` under the compute budget.
///
/// Syntax errors are reported before any step is charged. Runtime errors
/// and panics become `error`; budget exhaustion becomes `timed_out`.
pub fn execute(
    code: &str,
    request_id: Option<i64>,
    limits: &Limits,
    bindings: &dyn HostBindings,
) -> ExecutionResult {
    let chunk = match parse_chunk(code) {
        Ok(chunk) => chunk,
        Err(error) => {
            debug!(?request_id, %error, "compile failed");
            return ExecutionResult::failed(request_id, error.to_string());
        }
    };

    let mut governor = Governor::new(limits.compute_budget);
    let outcome = budget::run_with(&mut governor, |governor| {
        let mut interpreter =
            Interpreter::new(governor).with_max_call_depth(limits.max_call_depth);
        interpreter.install(bindings);
        interpreter.run(&chunk)
    });
    debug!(?request_id, steps = governor.used(), "compute finished");

    match outcome {
        Outcome::Completed(values) => {
            ExecutionResult::completed(request_id, values.into_iter().next().unwrap_or_default())
        }
        Outcome::TimedOut => ExecutionResult::timeout(request_id),
        Outcome::Failed(message) => ExecutionResult::failed(request_id, message),
    }
}

/// Render `result` as a newline-terminated response under the
/// serialization budget.
///
/// If rendering exhausts the budget, a timeout envelope carrying
/// [`SERIALIZE_TIMEOUT_MESSAGE`] is rendered instead.
pub fn render_response(result: &ExecutionResult, limits: &Limits) -> String {
    let envelope = result.envelope();
    let mut governor = Governor::new(limits.serialize_budget);
    let outcome = budget::run_with(&mut governor, |governor| {
        let mut context = SerializationContext::new(governor).with_depth_cap(limits.depth_cap);
        render_object(&envelope, &mut context)
    });
    debug!(request_id = ?result.request_id, steps = governor.used(), "serialize finished");

    let fallback = match outcome {
        Outcome::Completed(mut text) => {
            text.push('\n');
            return text;
        }
        Outcome::TimedOut => ExecutionResult {
            timed_out: true,
            value: Value::Null,
            error: Some(SERIALIZE_TIMEOUT_MESSAGE.to_string()),
            request_id: result.request_id,
        },
        Outcome::Failed(message) => {
            ExecutionResult::failed(result.request_id, format!("serialization failed: {message}"))
        }
    };
    render_fallback(&fallback, limits)
}

fn render_fallback(result: &ExecutionResult, limits: &Limits) -> String {
    let envelope = result.envelope();
    let mut governor = Governor::unbounded();
    let mut context = SerializationContext::new(&mut governor).with_depth_cap(limits.depth_cap);
    // Only scalars here, so an unbounded governor always completes.
    let mut text = render_object(&envelope, &mut context).unwrap_or_default();
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::builtins::NoBindings;

    fn run(code: &str) -> ExecutionResult {
        execute(code, Some(1), &Limits::default(), &NoBindings)
    }

    #[test]
    fn returns_first_value() {
        let result = run("return 1 + 1, 'ignored'");
        assert_eq!(result, ExecutionResult::completed(Some(1), Value::Number(2.0)));
    }

    #[test]
    fn no_return_yields_null() {
        let result = run("local x = 1");
        assert!(result.value.is_null());
        assert!(result.error.is_none());
        assert!(!result.timed_out);
    }

    #[test]
    fn syntax_errors_are_errors_not_timeouts() {
        let result = execute("return )", Some(3), &Limits::default().with_compute_budget(1), &NoBindings);
        assert!(!result.timed_out);
        assert!(result.error.as_deref().is_some_and(|e| e.starts_with("syntax error")));
    }

    #[test]
    fn infinite_loop_times_out() {
        let result = run("while true do end");
        assert!(result.timed_out);
        assert!(result.value.is_null());
        assert!(result.error.is_none());
    }

    #[test]
    fn panicking_binding_becomes_error() {
        fn explode(registry: &mut crate::interpreter::Registry<'_>) {
            registry.function("explode", |_, _| panic!("host binding bug"));
        }
        let result = execute("return explode()", Some(9), &Limits::default(), &explode);
        assert_eq!(result.error.as_deref(), Some("panic: host binding bug"));
        assert!(result.value.is_null());
    }

    #[test]
    fn response_envelope_has_fixed_key_order() {
        let text = render_response(&run("return 1+1"), &Limits::default());
        assert_eq!(
            text,
            "{\n  \"timeout\": false,\n  \"result\": 2,\n  \"error\": null,\n  \"reply_id\": 1\n}\n"
        );
    }

    #[test]
    fn oversized_result_reports_serialize_timeout() {
        let result = ExecutionResult::completed(
            Some(5),
            Value::list((0..50i64).map(Value::from).collect()),
        );
        let text = render_response(&result, &Limits::default().with_serialize_budget(20));
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(parsed["timeout"], true);
        assert_eq!(parsed["error"], SERIALIZE_TIMEOUT_MESSAGE);
        assert_eq!(parsed["result"], serde_json::Value::Null);
        assert_eq!(parsed["reply_id"], 5);
    }
}
