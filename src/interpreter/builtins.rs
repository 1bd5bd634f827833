//! Builtin library and the host binding surface.
//!
//! The names installed here are the complete capability surface a script
//! sees: there is no file, process, network or clock access unless a host
//! registers it through [`HostBindings`].

use std::cell::RefCell;
use std::rc::Rc;

use super::eval::Interpreter;
use super::value::{Function, Key, MapRef, Table, Value, format_number};
use super::{Result, ScriptError};

/// Upper bound on strings built by `string.rep` and `table.concat`.
pub const MAX_STRING_BYTES: usize = 1 << 20;

/// Extension point through which a host exposes its own namespaces.
///
/// Bindings are installed into every fresh interpreter, so they must be
/// cheap to run and must not keep state between requests.
pub trait HostBindings {
    /// Register functions and values.
    fn install(&self, registry: &mut Registry<'_>);
}

/// Bindings that install nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBindings;

impl HostBindings for NoBindings {
    fn install(&self, _registry: &mut Registry<'_>) {}
}

impl<F> HostBindings for F
where
    F: Fn(&mut Registry<'_>),
{
    fn install(&self, registry: &mut Registry<'_>) {
        self(registry)
    }
}

/// Writes named values into an interpreter's global table.
///
/// Paths are dotted (`"host.version"`); intermediate namespaces are created
/// as tables on demand.
pub struct Registry<'a> {
    globals: &'a MapRef,
}

impl<'a> Registry<'a> {
    pub(crate) fn new(globals: &'a MapRef) -> Self {
        Self { globals }
    }

    /// Bind a plain value.
    pub fn value(&mut self, path: &str, value: impl Into<Value>) {
        let (namespace, name) = self.namespace(path);
        namespace.borrow_mut().set_str(name, value.into());
    }

    /// Bind a Rust function.
    pub fn function(
        &mut self,
        path: &str,
        func: impl Fn(&mut Interpreter<'_>, Vec<Value>) -> Result<Vec<Value>> + 'static,
    ) {
        let native = Value::Function(Function::native(path, func));
        let (namespace, name) = self.namespace(path);
        namespace.borrow_mut().set_str(name, native);
    }

    /// Fetch a previously bound value.
    pub fn get(&self, path: &str) -> Value {
        let mut current = Value::Map(self.globals.clone());
        for segment in path.split('.') {
            current = match &current {
                Value::Map(map) => map.borrow().get_str(segment),
                _ => return Value::Null,
            };
        }
        current
    }

    fn namespace<'p>(&mut self, path: &'p str) -> (MapRef, &'p str) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let name = segments.pop().unwrap_or(path);
        let mut table = self.globals.clone();
        for segment in segments {
            let existing = table.borrow().get_str(segment);
            let next = match existing {
                Value::Map(map) => map,
                _ => {
                    let fresh: MapRef = Rc::new(RefCell::new(Table::new()));
                    table.borrow_mut().set_str(segment, Value::Map(fresh.clone()));
                    fresh
                }
            };
            table = next;
        }
        (table, name)
    }
}

/// Populate `globals` with the builtin library, returning the `string`
/// namespace used for method calls on strings.
pub(crate) fn install_stdlib(globals: &MapRef) -> Value {
    let mut registry = Registry::new(globals);

    registry.function("print", base_print);
    registry.function("type", base_type);
    registry.function("tostring", base_tostring);
    registry.function("tonumber", base_tonumber);
    registry.function("pairs", base_pairs);
    registry.function("ipairs", base_ipairs);
    registry.function("next", base_next);
    registry.function("select", base_select);
    registry.function("error", base_error);
    registry.function("assert", base_assert);
    registry.function("pcall", base_pcall);
    registry.function("rawget", base_rawget);
    registry.function("rawset", base_rawset);
    registry.function("rawequal", base_rawequal);
    registry.function("rawlen", base_rawlen);
    registry.function("unpack", table_unpack);

    registry.function("math.floor", |interp, args| {
        Ok(vec![Value::Number(check_number(interp, &args, 0, "floor")?.floor())])
    });
    registry.function("math.ceil", |interp, args| {
        Ok(vec![Value::Number(check_number(interp, &args, 0, "ceil")?.ceil())])
    });
    registry.function("math.abs", |interp, args| {
        Ok(vec![Value::Number(check_number(interp, &args, 0, "abs")?.abs())])
    });
    registry.function("math.sqrt", |interp, args| {
        Ok(vec![Value::Number(check_number(interp, &args, 0, "sqrt")?.sqrt())])
    });
    registry.function("math.fmod", |interp, args| {
        let a = check_number(interp, &args, 0, "fmod")?;
        let b = check_number(interp, &args, 1, "fmod")?;
        Ok(vec![Value::Number(a % b)])
    });
    registry.function("math.max", |interp, args| extremum(interp, &args, "max", f64::max));
    registry.function("math.min", |interp, args| extremum(interp, &args, "min", f64::min));
    registry.value("math.huge", f64::INFINITY);
    registry.value("math.pi", std::f64::consts::PI);

    registry.function("string.len", |interp, args| {
        Ok(vec![Value::from(check_string(interp, &args, 0, "len")?.len() as i64)])
    });
    registry.function("string.sub", string_sub);
    registry.function("string.upper", |interp, args| {
        Ok(vec![Value::from(check_string(interp, &args, 0, "upper")?.to_uppercase())])
    });
    registry.function("string.lower", |interp, args| {
        Ok(vec![Value::from(check_string(interp, &args, 0, "lower")?.to_lowercase())])
    });
    registry.function("string.rep", string_rep);
    registry.function("string.format", string_format);

    registry.function("table.insert", table_insert);
    registry.function("table.remove", table_remove);
    registry.function("table.concat", table_concat);
    registry.function("table.unpack", table_unpack);

    registry.get("string")
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn bad_argument(
    interp: &Interpreter<'_>,
    args: &[Value],
    index: usize,
    name: &str,
    expected: &str,
) -> ScriptError {
    let got = match args.get(index) {
        Some(value) => value.type_name(),
        None => "no value",
    };
    interp.error(format!(
        "bad argument #{} to '{name}' ({expected} expected, got {got})",
        index + 1
    ))
}

fn check_number(interp: &Interpreter<'_>, args: &[Value], index: usize, name: &str) -> Result<f64> {
    arg(args, index)
        .to_number()
        .ok_or_else(|| bad_argument(interp, args, index, name, "number"))
}

fn check_integer(interp: &Interpreter<'_>, args: &[Value], index: usize, name: &str) -> Result<i64> {
    let n = check_number(interp, args, index, name)?;
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(interp.error(format!(
            "bad argument #{} to '{name}' (number has no integer representation)",
            index + 1
        )));
    }
    Ok(n as i64)
}

fn opt_integer(
    interp: &Interpreter<'_>,
    args: &[Value],
    index: usize,
    name: &str,
    default: i64,
) -> Result<i64> {
    if arg(args, index).is_null() {
        Ok(default)
    } else {
        check_integer(interp, args, index, name)
    }
}

fn check_string(
    interp: &Interpreter<'_>,
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<Rc<str>> {
    match arg(args, index) {
        Value::String(text) => Ok(text),
        Value::Number(n) => Ok(Rc::from(format_number(n))),
        _ => Err(bad_argument(interp, args, index, name, "string")),
    }
}

fn check_table(interp: &Interpreter<'_>, args: &[Value], index: usize, name: &str) -> Result<Value> {
    match arg(args, index) {
        table @ (Value::Map(_) | Value::List(_)) => Ok(table),
        _ => Err(bad_argument(interp, args, index, name, "table")),
    }
}

/// Length of the sequence part, as `#` reports it.
fn sequence_len(table: &Value) -> i64 {
    match table {
        Value::List(list) => list.borrow().len() as i64,
        Value::Map(map) => map.borrow().border() as i64,
        _ => 0,
    }
}

fn base_print(_interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\t");
    tracing::info!(target: "scriptport::script", "{line}");
    Ok(Vec::new())
}

fn base_type(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Err(bad_argument(interp, &args, 0, "type", "value"));
    }
    Ok(vec![Value::from(args[0].type_name())])
}

fn base_tostring(_interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    Ok(vec![Value::from(arg(&args, 0).to_string())])
}

fn base_tonumber(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let value = arg(&args, 0);
    if arg(&args, 1).is_null() {
        return Ok(vec![value.to_number().map(Value::Number).unwrap_or_default()]);
    }
    let base = check_integer(interp, &args, 1, "tonumber")?;
    if !(2..=36).contains(&base) {
        return Err(interp.error("bad argument #2 to 'tonumber' (base out of range)"));
    }
    let text = check_string(interp, &args, 0, "tonumber")?;
    let parsed = i64::from_str_radix(text.trim(), base as u32).ok();
    Ok(vec![parsed.map(Value::from).unwrap_or_default()])
}

/// Successor of `key` in `table`, or `None` at the end.
fn next_entry(interp: &Interpreter<'_>, table: &Value, key: &Value) -> Result<Option<(Value, Value)>> {
    match table {
        Value::Map(map) => {
            let key = if key.is_null() {
                None
            } else {
                Some(Key::from_value(key).map_err(|message| interp.error(message))?)
            };
            let entry = map
                .borrow()
                .next(key.as_ref())
                .map_err(|message| interp.error(message))?;
            Ok(entry.map(|(key, value)| (key.to_value(), value)))
        }
        Value::List(list) => {
            let position = match key {
                Value::Null => 0,
                Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 => *n as usize,
                _ => return Err(interp.error("invalid key to 'next'")),
            };
            Ok(list
                .borrow()
                .get(position)
                .map(|value| (Value::from((position + 1) as i64), value.clone())))
        }
        _ => Ok(None),
    }
}

fn base_next(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "next")?;
    match next_entry(interp, &table, &arg(&args, 1))? {
        Some((key, value)) => Ok(vec![key, value]),
        None => Ok(vec![Value::Null]),
    }
}

fn base_pairs(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "pairs")?;
    let next = Value::Function(Function::native("next", base_next));
    Ok(vec![next, table, Value::Null])
}

fn ipairs_step(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = arg(&args, 0);
    let index = check_integer(interp, &args, 1, "ipairs")?
        .checked_add(1)
        .ok_or_else(|| interp.error("bad argument #2 to 'ipairs' (index out of range)"))?;
    let key = Value::from(index);
    let value = interp.index(&table, &key)?;
    if value.is_null() {
        Ok(vec![Value::Null])
    } else {
        Ok(vec![key, value])
    }
}

fn base_ipairs(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "ipairs")?;
    let step = Value::Function(Function::native("ipairs_step", ipairs_step));
    Ok(vec![step, table, Value::from(0i64)])
}

fn base_select(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let rest = args.len().saturating_sub(1) as i64;
    if arg(&args, 0).as_str() == Some("#") {
        return Ok(vec![Value::from(rest)]);
    }
    let n = check_integer(interp, &args, 0, "select")?;
    let start = match n {
        0 => None,
        n if n < 0 => rest.checked_add(n).filter(|start| *start >= 0),
        n => n.checked_sub(1),
    };
    let Some(start) = start else {
        return Err(interp.error("bad argument #1 to 'select' (index out of range)"));
    };
    let skip = usize::try_from(start).unwrap_or(usize::MAX).saturating_add(1);
    Ok(args.into_iter().skip(skip).collect())
}

fn base_error(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let message = arg(&args, 0);
    let level = opt_integer(interp, &args, 1, "error", 1)?;
    match message {
        Value::String(text) if level > 0 => Err(interp.error(&*text)),
        other => Err(ScriptError::Runtime(other.to_string())),
    }
}

fn base_assert(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    if arg(&args, 0).is_truthy() {
        return Ok(args);
    }
    match arg(&args, 1) {
        Value::Null => Err(interp.error("assertion failed!")),
        message => Err(ScriptError::Runtime(message.to_string())),
    }
}

fn base_pcall(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let mut args = args.into_iter();
    let func = args.next().unwrap_or_default();
    match interp.call(&func, args.collect()) {
        Ok(values) => {
            let mut results = Vec::with_capacity(values.len() + 1);
            results.push(Value::Bool(true));
            results.extend(values);
            Ok(results)
        }
        // Budget exhaustion always unwinds to the executor.
        Err(exhausted @ ScriptError::Exhausted(_)) => Err(exhausted),
        Err(error) => Ok(vec![Value::Bool(false), Value::from(error.to_string())]),
    }
}

fn base_rawget(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "rawget")?;
    Ok(vec![interp.index(&table, &arg(&args, 1))?])
}

fn base_rawset(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "rawset")?;
    interp.set_index(&table, &arg(&args, 1), arg(&args, 2))?;
    Ok(vec![table])
}

fn base_rawequal(_interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    Ok(vec![Value::Bool(arg(&args, 0).raw_equals(&arg(&args, 1)))])
}

fn base_rawlen(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    match arg(&args, 0) {
        Value::String(text) => Ok(vec![Value::from(text.len() as i64)]),
        table @ (Value::Map(_) | Value::List(_)) => Ok(vec![Value::from(sequence_len(&table))]),
        _ => Err(bad_argument(interp, &args, 0, "rawlen", "table or string")),
    }
}

fn extremum(
    interp: &Interpreter<'_>,
    args: &[Value],
    name: &str,
    pick: fn(f64, f64) -> f64,
) -> Result<Vec<Value>> {
    let mut best = check_number(interp, args, 0, name)?;
    for index in 1..args.len() {
        best = pick(best, check_number(interp, args, index, name)?);
    }
    Ok(vec![Value::Number(best)])
}

/// Translate a 1-based, possibly negative string position.
fn string_position(position: i64, len: usize) -> i64 {
    if position >= 0 {
        position
    } else if position.unsigned_abs() as usize > len {
        0
    } else {
        len as i64 + position + 1
    }
}

fn string_sub(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let text = check_string(interp, &args, 0, "sub")?;
    let len = text.len();
    let start = string_position(opt_integer(interp, &args, 1, "sub", 1)?, len).max(1);
    let end = string_position(opt_integer(interp, &args, 2, "sub", -1)?, len).min(len as i64);
    if start > end {
        return Ok(vec![Value::from("")]);
    }
    let bytes = &text.as_bytes()[start as usize - 1..end as usize];
    Ok(vec![Value::from(String::from_utf8_lossy(bytes).into_owned())])
}

fn string_rep(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let text = check_string(interp, &args, 0, "rep")?;
    let count = check_integer(interp, &args, 1, "rep")?.max(0) as usize;
    let separator = match arg(&args, 2) {
        Value::Null => Rc::from(""),
        _ => check_string(interp, &args, 2, "rep")?,
    };
    interp.tick()?;
    if count == 0 || (text.is_empty() && separator.is_empty()) {
        return Ok(vec![Value::from("")]);
    }
    let total = (text.len() + separator.len()).saturating_mul(count);
    if total > MAX_STRING_BYTES {
        return Err(interp.error("resulting string too large"));
    }
    let mut out = String::with_capacity(total);
    for index in 0..count {
        if index > 0 {
            out.push_str(&separator);
        }
        out.push_str(&text);
    }
    Ok(vec![Value::from(out)])
}

struct FormatSpec {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    fn pad(&self, body: String, numeric: bool) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let fill = self.width - len;
        if self.left {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero && numeric {
            let (sign, digits) = match body.strip_prefix(['-', '+', ' ']) {
                Some(rest) => (&body[..1], rest),
                None => ("", body.as_str()),
            };
            format!("{sign}{}{digits}", "0".repeat(fill))
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }

    fn signed(&self, body: String) -> String {
        if body.starts_with('-') {
            body
        } else if self.plus {
            format!("+{body}")
        } else if self.space {
            format!(" {body}")
        } else {
            body
        }
    }
}

fn exponent_notation(n: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{n:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let marker = if upper { 'E' } else { 'e' };
    format!("{mantissa}{marker}{sign}{:02}", exponent.abs())
}

fn general_notation(n: f64, precision: usize, upper: bool) -> String {
    let precision = precision.max(1);
    if n == 0.0 || !n.is_finite() {
        return format_number(n);
    }
    let exponent = n.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let body = exponent_notation(n, precision - 1, upper);
        let (mantissa, tail) = body.split_at(body.find(['e', 'E']).unwrap_or(body.len()));
        let mantissa = if mantissa.contains('.') {
            mantissa.trim_end_matches('0').trim_end_matches('.')
        } else {
            mantissa
        };
        return format!("{mantissa}{tail}");
    }
    let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
    let fixed = format!("{n:.decimals$}");
    if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        fixed
    }
}

fn quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn string_format(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let template = check_string(interp, &args, 0, "format")?;
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut next_arg = 1;
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut spec = FormatSpec {
            left: false,
            plus: false,
            space: false,
            zero: false,
            width: 0,
            precision: None,
        };
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => {}
                _ => break,
            }
            chars.next();
        }
        while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
            spec.width = spec.width.saturating_mul(10).saturating_add(digit as usize);
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision: usize = 0;
            while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                precision = precision.saturating_mul(10).saturating_add(digit as usize);
                chars.next();
            }
            spec.precision = Some(precision);
        }
        if spec.width > 99 || spec.precision.is_some_and(|p| p > 99) {
            return Err(interp.error("invalid conversion (width or precision too long)"));
        }
        let Some(conversion) = chars.next() else {
            return Err(interp.error("invalid conversion '%' to 'format'"));
        };
        let index = next_arg;
        next_arg += 1;
        let piece = match conversion {
            'd' | 'i' => {
                let n = check_integer(interp, &args, index, "format")?;
                spec.pad(spec.signed(n.to_string()), true)
            }
            'x' | 'X' => {
                let n = check_integer(interp, &args, index, "format")?;
                let hex = if conversion == 'x' {
                    format!("{n:x}")
                } else {
                    format!("{n:X}")
                };
                spec.pad(hex, true)
            }
            'c' => {
                let code = check_integer(interp, &args, index, "format")?;
                let ch = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| interp.error("bad argument to 'format' (invalid character code)"))?;
                spec.pad(ch.to_string(), false)
            }
            'f' | 'F' => {
                let n = check_number(interp, &args, index, "format")?;
                let precision = spec.precision.unwrap_or(6);
                spec.pad(spec.signed(format!("{n:.precision$}")), true)
            }
            'e' | 'E' => {
                let n = check_number(interp, &args, index, "format")?;
                let body = exponent_notation(n, spec.precision.unwrap_or(6), conversion == 'E');
                spec.pad(spec.signed(body), true)
            }
            'g' | 'G' => {
                let n = check_number(interp, &args, index, "format")?;
                let body = general_notation(n, spec.precision.unwrap_or(6), conversion == 'G');
                spec.pad(spec.signed(body), true)
            }
            's' => {
                let mut text = arg(&args, index).to_string();
                if args.len() <= index {
                    return Err(bad_argument(interp, &args, index, "format", "value"));
                }
                if let Some(precision) = spec.precision {
                    text = text.chars().take(precision).collect();
                }
                spec.pad(text, false)
            }
            'q' => quoted(&check_string(interp, &args, index, "format")?),
            other => {
                return Err(interp.error(format!(
                    "invalid conversion '%{other}' to 'format'"
                )));
            }
        };
        out.push_str(&piece);
    }
    Ok(vec![Value::from(out)])
}

fn table_insert(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "insert")?;
    let len = sequence_len(&table);
    let (position, value) = match args.len() {
        2 => (len + 1, arg(&args, 1)),
        3 => {
            let position = check_integer(interp, &args, 1, "insert")?;
            if position < 1 || position > len + 1 {
                return Err(interp.error("bad argument #2 to 'insert' (position out of bounds)"));
            }
            (position, arg(&args, 2))
        }
        _ => return Err(interp.error("wrong number of arguments to 'insert'")),
    };
    match &table {
        Value::List(list) => {
            if !value.is_null() {
                list.borrow_mut().insert(position as usize - 1, value);
            }
        }
        Value::Map(map) => {
            let mut map = map.borrow_mut();
            for slot in (position..=len).rev() {
                let moved = map.get(&Key::Int(slot));
                map.set(Key::Int(slot + 1), moved);
            }
            map.set(Key::Int(position), value);
        }
        _ => {}
    }
    Ok(Vec::new())
}

fn table_remove(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "remove")?;
    let len = sequence_len(&table);
    let position = opt_integer(interp, &args, 1, "remove", len)?;
    if len == 0 && (position == 0 || position == len) {
        return Ok(vec![Value::Null]);
    }
    if position < 1 || position > len + 1 {
        return Err(interp.error("bad argument #2 to 'remove' (position out of bounds)"));
    }
    let removed = match &table {
        Value::List(list) => {
            let mut items = list.borrow_mut();
            if (position as usize) <= items.len() {
                items.remove(position as usize - 1)
            } else {
                Value::Null
            }
        }
        Value::Map(map) => {
            let mut map = map.borrow_mut();
            let removed = map.get(&Key::Int(position));
            for slot in position..len {
                let moved = map.get(&Key::Int(slot + 1));
                map.set(Key::Int(slot), moved);
            }
            if position <= len {
                map.set(Key::Int(len), Value::Null);
            }
            removed
        }
        _ => Value::Null,
    };
    Ok(vec![removed])
}

fn table_concat(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "concat")?;
    let separator = match arg(&args, 1) {
        Value::Null => Rc::from(""),
        _ => check_string(interp, &args, 1, "concat")?,
    };
    let first = opt_integer(interp, &args, 2, "concat", 1)?;
    let last = opt_integer(interp, &args, 3, "concat", sequence_len(&table))?;
    let mut out = String::new();
    for index in first..=last {
        interp.tick()?;
        let item = interp.index(&table, &Value::from(index))?;
        match item {
            Value::String(text) => out.push_str(&text),
            Value::Number(n) => out.push_str(&format_number(n)),
            other => {
                return Err(interp.error(format!(
                    "invalid value (at index {index}) in table for 'concat' ({})",
                    other.type_name()
                )));
            }
        }
        if index != last {
            out.push_str(&separator);
        }
        if out.len() > MAX_STRING_BYTES {
            return Err(interp.error("resulting string too large"));
        }
    }
    Ok(vec![Value::from(out)])
}

fn table_unpack(interp: &mut Interpreter<'_>, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(interp, &args, 0, "unpack")?;
    let first = opt_integer(interp, &args, 1, "unpack", 1)?;
    let last = opt_integer(interp, &args, 2, "unpack", sequence_len(&table))?;
    let mut values = Vec::new();
    for index in first..=last {
        interp.tick()?;
        values.push(interp.index(&table, &Value::from(index))?);
    }
    Ok(values)
}
