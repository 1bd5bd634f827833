//! Runtime values produced and consumed by scripts.
//!
//! Scalars are stored inline; lists, maps and functions are shared
//! references, so two values may point at the same composite. The address of
//! the shared allocation is the composite's identity, which the serializer
//! uses for cycle detection.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use super::ScriptError;
use super::ast::FuncBody;
use super::eval::{Env, Interpreter};

/// Shared, mutable ordered sequence.
pub type ListRef = Rc<RefCell<Vec<Value>>>;
/// Shared, mutable key/value table.
pub type MapRef = Rc<RefCell<Table>>;

/// Signature of functions implemented in Rust.
pub type NativeFn = dyn Fn(&mut Interpreter<'_>, Vec<Value>) -> Result<Vec<Value>, ScriptError>;

/// Tagged union of every value a script can observe.
#[derive(Clone, Default)]
pub enum Value {
    /// The null sentinel (`nil`).
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Number(f64),
    /// Immutable UTF-8 string.
    String(Rc<str>),
    /// Ordered list, usually produced by host bindings.
    List(ListRef),
    /// Key/value table built by scripts.
    Map(MapRef),
    /// Callable value; opaque to the serializer.
    Function(Function),
}

/// Callable values.
#[derive(Clone)]
pub enum Function {
    /// Function defined in script source, with its captured environment.
    Closure(Rc<Closure>),
    /// Function implemented by the runtime or a host binding.
    Native(Rc<Native>),
}

/// A script function closed over the scope it was defined in.
pub struct Closure {
    /// Parameters and body.
    pub body: Rc<FuncBody>,
    /// Environment captured at definition time.
    pub env: Env,
}

/// A named Rust function callable from scripts.
pub struct Native {
    /// Dotted name used in error messages.
    pub name: String,
    /// Implementation.
    pub func: Box<NativeFn>,
}

impl Function {
    /// Wrap a Rust closure as a script-callable function.
    pub fn native(
        name: impl Into<String>,
        func: impl Fn(&mut Interpreter<'_>, Vec<Value>) -> Result<Vec<Value>, ScriptError> + 'static,
    ) -> Self {
        Function::Native(Rc::new(Native {
            name: name.into(),
            func: Box::new(func),
        }))
    }

    fn identity(&self) -> usize {
        match self {
            Function::Closure(closure) => Rc::as_ptr(closure) as *const () as usize,
            Function::Native(native) => Rc::as_ptr(native) as *const () as usize,
        }
    }
}

impl Value {
    /// Build a string value.
    pub fn string(text: impl AsRef<str>) -> Self {
        Value::String(Rc::from(text.as_ref()))
    }

    /// Build a list value from its items.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Build a map value from a table.
    pub fn map(table: Table) -> Self {
        Value::Map(Rc::new(RefCell::new(table)))
    }

    /// Build an empty map value.
    pub fn empty_map() -> Self {
        Value::map(Table::default())
    }

    /// Lua-style type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) | Value::Map(_) => "table",
            Value::Function(_) => "function",
        }
    }

    /// Only `nil` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    /// Returns true for the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Address of the shared allocation for composite values.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(Rc::as_ptr(list) as *const () as usize),
            Value::Map(map) => Some(Rc::as_ptr(map) as *const () as usize),
            Value::Function(func) => Some(func.identity()),
            _ => None,
        }
    }

    /// Numeric view, coercing numeric strings the way arithmetic does.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(text) => parse_number(text),
            _ => None,
        }
    }

    /// Borrow the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Raw equality: scalars by value, composites by identity.
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equals(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("nil"),
            Value::Bool(flag) => write!(f, "{flag}"),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::String(text) => f.write_str(text),
            Value::List(_) | Value::Map(_) => {
                write!(f, "table: 0x{:08x}", self.identity().unwrap_or_default())
            }
            Value::Function(func) => match func {
                Function::Native(native) => write!(f, "builtin: {}", native.name),
                Function::Closure(_) => {
                    write!(f, "function: 0x{:08x}", self.identity().unwrap_or_default())
                }
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(text) => write!(f, "{text:?}"),
            Value::List(list) => match list.try_borrow() {
                Ok(items) => f.debug_list().entries(items.iter()).finish(),
                Err(_) => f.write_str("[<borrowed>]"),
            },
            other => write!(f, "{other}"),
        }
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::string(text)
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(Rc::from(text))
    }
}

impl From<Option<Value>> for Value {
    fn from(value: Option<Value>) -> Self {
        value.unwrap_or(Value::Null)
    }
}

/// Render a number the way scripts see it printed.
///
/// Integral values print without a fractional part; very large or very small
/// magnitudes use exponent notation. Every finite output is a valid JSON
/// number.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = n.abs();
    if n.fract() == 0.0 && magnitude < 1e15 {
        return format!("{}", n as i64);
    }
    if magnitude >= 1e15 || magnitude < 1e-4 {
        return format!("{n:e}");
    }
    format!("{n}")
}

/// Parse script number syntax (decimal, exponent or `0x` hex), trimming
/// surrounding whitespace.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        i64::from_str_radix(hex, 16).ok()? as f64
    } else {
        if !body.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return None;
        }
        body.parse::<f64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Hashable table key.
///
/// Integral numbers are normalized to [`Key::Int`] so `t[1]` and `t[1.0]`
/// address the same slot. Composite keys compare by identity.
#[derive(Clone)]
pub enum Key {
    /// Boolean key.
    Bool(bool),
    /// Integral number key.
    Int(i64),
    /// Non-integral number key, stored as raw bits.
    Float(u64),
    /// String key.
    Str(Rc<str>),
    /// List, map or function key.
    Ref(Value),
}

impl Key {
    /// Convert a value into a key, rejecting `nil` and NaN.
    pub fn from_value(value: &Value) -> Result<Key, String> {
        match value {
            Value::Null => Err("table index is nil".to_string()),
            Value::Bool(flag) => Ok(Key::Bool(*flag)),
            Value::Number(n) => {
                if n.is_nan() {
                    Err("table index is NaN".to_string())
                } else if n.fract() == 0.0 && n.abs() < 9.2e18 {
                    Ok(Key::Int(*n as i64))
                } else {
                    Ok(Key::Float(n.to_bits()))
                }
            }
            Value::String(text) => Ok(Key::Str(text.clone())),
            other => Ok(Key::Ref(other.clone())),
        }
    }

    /// Convert the key back into a value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(flag) => Value::Bool(*flag),
            Key::Int(n) => Value::Number(*n as f64),
            Key::Float(bits) => Value::Number(f64::from_bits(*bits)),
            Key::Str(text) => Value::String(text.clone()),
            Key::Ref(value) => value.clone(),
        }
    }

    /// The key's integer value when it is a positive integer.
    pub fn positive_index(&self) -> Option<u64> {
        match self {
            Key::Int(n) if *n >= 1 => Some(*n as u64),
            _ => None,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Bool(a), Key::Bool(b)) => a == b,
            (Key::Int(a), Key::Int(b)) => a == b,
            (Key::Float(a), Key::Float(b)) => a == b,
            (Key::Str(a), Key::Str(b)) => a == b,
            (Key::Ref(a), Key::Ref(b)) => a.identity() == b.identity(),
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Key::Bool(flag) => flag.hash(state),
            Key::Int(n) => n.hash(state),
            Key::Float(bits) => bits.hash(state),
            Key::Str(text) => text.hash(state),
            Key::Ref(value) => value.identity().hash(state),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_value())
    }
}

/// Insertion-ordered key/value storage behind [`Value::Map`].
#[derive(Default)]
pub struct Table {
    entries: IndexMap<Key, Value>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key, returning `Null` when absent.
    pub fn get(&self, key: &Key) -> Value {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Look up a string key.
    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Key::Str(Rc::from(key)))
    }

    /// Store a value; storing `Null` removes the key.
    pub fn set(&mut self, key: Key, value: Value) {
        if value.is_null() {
            self.entries.shift_remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Store a value under a string key.
    pub fn set_str(&mut self, key: &str, value: impl Into<Value>) {
        self.set(Key::Str(Rc::from(key)), value.into());
    }

    /// Append at the first free positive index (`#t + 1`).
    pub fn push(&mut self, value: Value) {
        let next = self.border() + 1;
        self.set(Key::Int(next as i64), value);
    }

    /// Largest `n` such that indices `1..=n` are all present.
    pub fn border(&self) -> u64 {
        let mut n = 0u64;
        while self.entries.contains_key(&Key::Int(n as i64 + 1)) {
            n += 1;
        }
        n
    }

    /// Entry following `key` in iteration order; `None` starts from the
    /// beginning. Errors when `key` is not present.
    pub fn next(&self, key: Option<&Key>) -> Result<Option<(Key, Value)>, String> {
        let index = match key {
            None => 0,
            Some(key) => match self.entries.get_index_of(key) {
                Some(position) => position + 1,
                None => return Err("invalid key to 'next'".to_string()),
            },
        };
        Ok(self
            .entries
            .get_index(index)
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }
}

impl FromIterator<(Key, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (key, value) in iter {
            table.set(key, value);
        }
        table
    }
}
