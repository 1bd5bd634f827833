use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use super::ast::{BinOp, Block, Chunk, Expr, Field, Name, Stmt, StmtKind, UnOp};
use super::builtins::{self, HostBindings, Registry};
use super::value::{Closure, Function, Key, MapRef, Table, Value, format_number};
use super::{Result, ScriptError};
use crate::runtime::budget::Governor;

/// Default limit on nested function calls.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 120;

/// Lexical scope chain shared with closures.
pub type Env = Rc<Scope>;

/// One lexical scope: local slots plus the enclosing scope.
#[derive(Default)]
pub struct Scope {
    vars: RefCell<Vec<(Name, Rc<RefCell<Value>>)>>,
    parent: Option<Env>,
}

impl Scope {
    fn child(parent: &Env) -> Env {
        Rc::new(Scope {
            vars: RefCell::new(Vec::new()),
            parent: Some(parent.clone()),
        })
    }

    fn declare(&self, name: Name, value: Value) -> Rc<RefCell<Value>> {
        let cell = Rc::new(RefCell::new(value));
        self.vars.borrow_mut().push((name, cell.clone()));
        cell
    }

    fn lookup(&self, name: &str) -> Option<Rc<RefCell<Value>>> {
        let found = self
            .vars
            .borrow()
            .iter()
            .rev()
            .find(|(candidate, _)| &**candidate == name)
            .map(|(_, cell)| cell.clone());
        match found {
            Some(cell) => Some(cell),
            None => self.parent.as_ref().and_then(|parent| parent.lookup(name)),
        }
    }
}

enum Flow {
    Normal,
    Break,
    Return(Vec<Value>),
}

/// Tree-walking evaluator bound to one step governor.
///
/// Each interpreter owns a fresh global table populated with the builtin
/// library; nothing leaks between interpreters.
pub struct Interpreter<'g> {
    governor: &'g mut Governor,
    globals: MapRef,
    string_lib: Value,
    call_depth: usize,
    max_call_depth: usize,
    line: u32,
}

impl<'g> Interpreter<'g> {
    /// Create an interpreter with the builtin library installed.
    pub fn new(governor: &'g mut Governor) -> Self {
        let globals: MapRef = Rc::new(RefCell::new(Table::new()));
        let string_lib = builtins::install_stdlib(&globals);
        Self {
            governor,
            globals,
            string_lib,
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            line: 0,
        }
    }

    /// Override the nested call limit.
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Register host namespaces into this interpreter's globals.
    pub fn install(&mut self, bindings: &dyn HostBindings) {
        let mut registry = Registry::new(&self.globals);
        bindings.install(&mut registry);
    }

    /// The global table.
    pub fn globals(&self) -> &MapRef {
        &self.globals
    }

    /// Charge one step against the governor.
    pub fn tick(&mut self) -> Result<()> {
        self.governor.tick()?;
        Ok(())
    }

    /// Runtime error annotated with the current line.
    pub fn error(&self, message: impl AsRef<str>) -> ScriptError {
        ScriptError::Runtime(format!("line {}: {}", self.line, message.as_ref()))
    }

    /// Execute a parsed chunk, returning the values of its `return`.
    pub fn run(&mut self, chunk: &Chunk) -> Result<Vec<Value>> {
        let root: Env = Rc::new(Scope::default());
        match self.exec_block(&chunk.block, &root)? {
            Flow::Return(values) => Ok(values),
            Flow::Normal | Flow::Break => Ok(Vec::new()),
        }
    }

    /// Call a function value with arguments.
    pub fn call(&mut self, func: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        self.tick()?;
        let Value::Function(function) = func else {
            return Err(self.error(format!("attempt to call a {} value", func.type_name())));
        };
        if self.call_depth >= self.max_call_depth {
            return Err(self.error("stack overflow"));
        }
        self.call_depth += 1;
        let saved_line = self.line;
        let outcome = match function {
            Function::Native(native) => (native.func)(self, args),
            Function::Closure(closure) => self.call_closure(closure, args),
        };
        self.line = saved_line;
        self.call_depth -= 1;
        outcome
    }

    fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Vec<Value>> {
        let scope = Scope::child(&closure.env);
        let mut args = args.into_iter();
        for param in &closure.body.params {
            scope.declare(param.clone(), args.next().unwrap_or_default());
        }
        match self.exec_block(&closure.body.block, &scope)? {
            Flow::Return(values) => Ok(values),
            Flow::Normal => Ok(Vec::new()),
            Flow::Break => Err(self.error("'break' outside a loop")),
        }
    }

    /// Read `obj[key]` without metamethods.
    pub fn index(&self, obj: &Value, key: &Value) -> Result<Value> {
        match obj {
            Value::Map(map) => match Key::from_value(key) {
                Ok(key) => Ok(map.borrow().get(&key)),
                Err(_) => Ok(Value::Null),
            },
            Value::List(list) => Ok(list_slot(key)
                .and_then(|slot| list.borrow().get(slot).cloned())
                .unwrap_or_default()),
            Value::String(_) => self.index(&self.string_lib, key),
            other => Err(self.error(format!("attempt to index a {} value", other.type_name()))),
        }
    }

    /// Write `obj[key] = value` without metamethods.
    pub fn set_index(&self, obj: &Value, key: &Value, value: Value) -> Result<()> {
        match obj {
            Value::Map(map) => {
                let key = Key::from_value(key).map_err(|message| self.error(message))?;
                map.borrow_mut().set(key, value);
                Ok(())
            }
            Value::List(list) => {
                let mut items = list.borrow_mut();
                let len = items.len();
                match list_slot(key) {
                    Some(slot) if slot < len => {
                        if value.is_null() {
                            if slot + 1 != len {
                                return Err(self.error("cannot store nil inside a list"));
                            }
                            items.pop();
                        } else {
                            items[slot] = value;
                        }
                        Ok(())
                    }
                    Some(slot) if slot == len => {
                        if !value.is_null() {
                            items.push(value);
                        }
                        Ok(())
                    }
                    _ => Err(self.error("list index out of range")),
                }
            }
            other => Err(self.error(format!("attempt to index a {} value", other.type_name()))),
        }
    }

    fn exec_block(&mut self, block: &Block, parent: &Env) -> Result<Flow> {
        let scope = Scope::child(parent);
        self.exec_stmts(&block.stmts, &scope)
    }

    fn exec_stmts(&mut self, stmts: &[Stmt], scope: &Env) -> Result<Flow> {
        for stmt in stmts {
            self.line = stmt.line;
            self.tick()?;
            match self.exec_stmt(&stmt.kind, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, kind: &StmtKind, scope: &Env) -> Result<Flow> {
        match kind {
            StmtKind::Local { names, exprs } => {
                let mut values = self.eval_multi(exprs, scope)?.into_iter();
                for name in names {
                    scope.declare(name.clone(), values.next().unwrap_or_default());
                }
            }
            StmtKind::LocalFunction { name, body } => {
                let cell = scope.declare(name.clone(), Value::Null);
                let closure = Closure {
                    body: body.clone(),
                    env: scope.clone(),
                };
                *cell.borrow_mut() = Value::Function(Function::Closure(Rc::new(closure)));
            }
            StmtKind::Assign { targets, exprs } => {
                let mut values = self.eval_multi(exprs, scope)?.into_iter();
                for target in targets {
                    let value = values.next().unwrap_or_default();
                    self.assign(target, value, scope)?;
                }
            }
            StmtKind::Call(expr) => {
                self.eval_call(expr, scope)?;
            }
            StmtKind::Do(block) => return self.exec_block(block, scope),
            StmtKind::While { cond, body } => {
                while self.eval(cond, scope)?.is_truthy() {
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(values) => return Ok(Flow::Return(values)),
                        Flow::Normal => {}
                    }
                }
            }
            StmtKind::Repeat { body, cond } => loop {
                let inner = Scope::child(scope);
                match self.exec_stmts(&body.stmts, &inner)? {
                    Flow::Break => break,
                    Flow::Return(values) => return Ok(Flow::Return(values)),
                    Flow::Normal => {}
                }
                if self.eval(cond, &inner)?.is_truthy() {
                    break;
                }
            },
            StmtKind::If { arms, otherwise } => {
                for (cond, block) in arms {
                    if self.eval(cond, scope)?.is_truthy() {
                        return self.exec_block(block, scope);
                    }
                }
                if let Some(block) = otherwise {
                    return self.exec_block(block, scope);
                }
            }
            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                let start = self.for_number(start, scope, "initial")?;
                let limit = self.for_number(limit, scope, "limit")?;
                let step = match step {
                    Some(step) => self.for_number(step, scope, "step")?,
                    None => 1.0,
                };
                if step == 0.0 {
                    return Err(self.error("'for' step is zero"));
                }
                let mut current = start;
                while (step > 0.0 && current <= limit) || (step < 0.0 && current >= limit) {
                    self.tick()?;
                    let inner = Scope::child(scope);
                    inner.declare(var.clone(), Value::Number(current));
                    match self.exec_block(body, &inner)? {
                        Flow::Break => break,
                        Flow::Return(values) => return Ok(Flow::Return(values)),
                        Flow::Normal => {}
                    }
                    current += step;
                }
            }
            StmtKind::GenericFor { names, exprs, body } => {
                let mut triple = self.eval_multi(exprs, scope)?.into_iter();
                let iterator = triple.next().unwrap_or_default();
                let state = triple.next().unwrap_or_default();
                let mut control = triple.next().unwrap_or_default();
                loop {
                    let results = self.call(&iterator, vec![state.clone(), control.clone()])?;
                    let first = results.first().cloned().unwrap_or_default();
                    if first.is_null() {
                        break;
                    }
                    control = first;
                    let inner = Scope::child(scope);
                    let mut results = results.into_iter();
                    for name in names {
                        inner.declare(name.clone(), results.next().unwrap_or_default());
                    }
                    match self.exec_block(body, &inner)? {
                        Flow::Break => break,
                        Flow::Return(values) => return Ok(Flow::Return(values)),
                        Flow::Normal => {}
                    }
                }
            }
            StmtKind::Return(exprs) => return Ok(Flow::Return(self.eval_multi(exprs, scope)?)),
            StmtKind::Break => return Ok(Flow::Break),
        }
        Ok(Flow::Normal)
    }

    fn for_number(&mut self, expr: &Expr, scope: &Env, what: &str) -> Result<f64> {
        match self.eval(expr, scope)?.to_number() {
            Some(n) => Ok(n),
            None => Err(self.error(format!("'for' {what} value must be a number"))),
        }
    }

    fn assign(&mut self, target: &Expr, value: Value, scope: &Env) -> Result<()> {
        match target {
            Expr::Name(name) => {
                match scope.lookup(name) {
                    Some(cell) => *cell.borrow_mut() = value,
                    None => self.globals.borrow_mut().set(Key::Str(name.clone()), value),
                }
                Ok(())
            }
            Expr::Index { obj, key } => {
                let obj = self.eval(obj, scope)?;
                let key = self.eval(key, scope)?;
                self.set_index(&obj, &key, value)
            }
            _ => Err(self.error("cannot assign to this expression")),
        }
    }

    /// Evaluate an expression list, expanding a trailing call to all of its
    /// results.
    fn eval_multi(&mut self, exprs: &[Expr], scope: &Env) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for (position, expr) in exprs.iter().enumerate() {
            if position + 1 == exprs.len() && expr.is_multi() {
                values.extend(self.eval_call(expr, scope)?);
            } else {
                values.push(self.eval(expr, scope)?);
            }
        }
        Ok(values)
    }

    fn eval(&mut self, expr: &Expr, scope: &Env) -> Result<Value> {
        self.tick()?;
        match expr {
            Expr::Nil => Ok(Value::Null),
            Expr::True => Ok(Value::Bool(true)),
            Expr::False => Ok(Value::Bool(false)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(text) => Ok(Value::String(text.clone())),
            Expr::Name(name) => Ok(match scope.lookup(name) {
                Some(cell) => cell.borrow().clone(),
                None => self.globals.borrow().get(&Key::Str(name.clone())),
            }),
            Expr::Index { obj, key } => {
                let obj_value = self.eval(obj, scope)?;
                let key_value = self.eval(key, scope)?;
                if matches!(obj_value, Value::Null | Value::Bool(_) | Value::Number(_)) {
                    return Err(self.error(format!(
                        "attempt to index a {} value{}",
                        obj_value.type_name(),
                        describe(obj)
                    )));
                }
                self.index(&obj_value, &key_value)
            }
            Expr::Call { .. } | Expr::Method { .. } => {
                Ok(self.eval_call(expr, scope)?.into_iter().next().unwrap_or_default())
            }
            Expr::Paren(inner) => self.eval(inner, scope),
            Expr::Function(body) => Ok(Value::Function(Function::Closure(Rc::new(Closure {
                body: body.clone(),
                env: scope.clone(),
            })))),
            Expr::Table(fields) => self.eval_table(fields, scope),
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    let left = self.eval(lhs, scope)?;
                    if left.is_truthy() {
                        self.eval(rhs, scope)
                    } else {
                        Ok(left)
                    }
                }
                BinOp::Or => {
                    let left = self.eval(lhs, scope)?;
                    if left.is_truthy() {
                        Ok(left)
                    } else {
                        self.eval(rhs, scope)
                    }
                }
                op => {
                    let left = self.eval(lhs, scope)?;
                    let right = self.eval(rhs, scope)?;
                    self.binary(*op, &left, &right)
                }
            },
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, scope)?;
                self.unary(*op, &value)
            }
        }
    }

    fn eval_call(&mut self, expr: &Expr, scope: &Env) -> Result<Vec<Value>> {
        match expr {
            Expr::Call { callee, args } => {
                let func = self.eval(callee, scope)?;
                let args = self.eval_multi(args, scope)?;
                if !matches!(func, Value::Function(_)) {
                    return Err(self.error(format!(
                        "attempt to call a {} value{}",
                        func.type_name(),
                        describe(callee)
                    )));
                }
                self.call(&func, args)
            }
            Expr::Method { obj, name, args } => {
                let receiver = self.eval(obj, scope)?;
                if matches!(receiver, Value::Null | Value::Bool(_) | Value::Number(_)) {
                    return Err(self.error(format!(
                        "attempt to index a {} value{}",
                        receiver.type_name(),
                        describe(obj)
                    )));
                }
                let func = self.index(&receiver, &Value::String(name.clone()))?;
                if !matches!(func, Value::Function(_)) {
                    return Err(self.error(format!(
                        "attempt to call a {} value (method '{}')",
                        func.type_name(),
                        name
                    )));
                }
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(receiver);
                call_args.extend(self.eval_multi(args, scope)?);
                self.call(&func, call_args)
            }
            other => Ok(vec![self.eval(other, scope)?]),
        }
    }

    fn eval_table(&mut self, fields: &[Field], scope: &Env) -> Result<Value> {
        let mut table = Table::new();
        let mut position = 1i64;
        for (index, field) in fields.iter().enumerate() {
            match field {
                Field::Positional(expr) if index + 1 == fields.len() && expr.is_multi() => {
                    for value in self.eval_call(expr, scope)? {
                        table.set(Key::Int(position), value);
                        position += 1;
                    }
                }
                Field::Positional(expr) => {
                    let value = self.eval(expr, scope)?;
                    table.set(Key::Int(position), value);
                    position += 1;
                }
                Field::Named(name, expr) => {
                    let value = self.eval(expr, scope)?;
                    table.set(Key::Str(name.clone()), value);
                }
                Field::Keyed(key, expr) => {
                    let key = self.eval(key, scope)?;
                    let key = Key::from_value(&key).map_err(|message| self.error(message))?;
                    let value = self.eval(expr, scope)?;
                    table.set(key, value);
                }
            }
        }
        Ok(Value::map(table))
    }

    fn binary(&self, op: BinOp, left: &Value, right: &Value) -> Result<Value> {
        match op {
            BinOp::Eq => Ok(Value::Bool(left.raw_equals(right))),
            BinOp::Ne => Ok(Value::Bool(!left.raw_equals(right))),
            BinOp::Lt => Ok(Value::Bool(self.compare(left, right)? == Ordering::Less)),
            BinOp::Le => Ok(Value::Bool(self.compare(left, right)? != Ordering::Greater)),
            BinOp::Gt => Ok(Value::Bool(self.compare(left, right)? == Ordering::Greater)),
            BinOp::Ge => Ok(Value::Bool(self.compare(left, right)? != Ordering::Less)),
            BinOp::Concat => {
                let mut text = self.concat_operand(left)?;
                let tail = self.concat_operand(right)?;
                if text.len() + tail.len() > builtins::MAX_STRING_BYTES {
                    return Err(self.error("resulting string too large"));
                }
                text.push_str(&tail);
                Ok(Value::from(text))
            }
            BinOp::And | BinOp::Or => Err(self.error("logical operators short-circuit")),
            arithmetic => {
                let (Some(x), Some(y)) = (left.to_number(), right.to_number()) else {
                    let culprit = if left.to_number().is_none() { left } else { right };
                    return Err(self.error(format!(
                        "attempt to perform arithmetic on a {} value",
                        culprit.type_name()
                    )));
                };
                let result = match arithmetic {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Mod => x - (x / y).floor() * y,
                    _ => x.powf(y),
                };
                Ok(Value::Number(result))
            }
        }
    }

    fn compare(&self, left: &Value, right: &Value) -> Result<Ordering> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(a.partial_cmp(b).unwrap_or(Ordering::Greater)),
            (Value::String(a), Value::String(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            _ => Err(self.error(format!(
                "attempt to compare {} with {}",
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn concat_operand(&self, value: &Value) -> Result<String> {
        match value {
            Value::String(text) => Ok(text.to_string()),
            Value::Number(n) => Ok(format_number(*n)),
            other => Err(self.error(format!(
                "attempt to concatenate a {} value",
                other.type_name()
            ))),
        }
    }

    fn unary(&self, op: UnOp, value: &Value) -> Result<Value> {
        match op {
            UnOp::Not => Ok(Value::Bool(!value.is_truthy())),
            UnOp::Neg => match value.to_number() {
                Some(n) => Ok(Value::Number(-n)),
                None => Err(self.error(format!(
                    "attempt to perform arithmetic on a {} value",
                    value.type_name()
                ))),
            },
            UnOp::Len => match value {
                Value::String(text) => Ok(Value::Number(text.len() as f64)),
                Value::List(list) => Ok(Value::Number(list.borrow().len() as f64)),
                Value::Map(map) => Ok(Value::Number(map.borrow().border() as f64)),
                other => Err(self.error(format!(
                    "attempt to get length of a {} value",
                    other.type_name()
                ))),
            },
        }
    }
}

/// Zero-based list slot for a 1-based numeric key.
fn list_slot(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 => Some(*n as usize - 1),
        _ => None,
    }
}

/// Suffix naming the variable or field an error refers to.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Name(name) => format!(" (variable '{name}')"),
        Expr::Index { key, .. } => match key.as_ref() {
            Expr::Str(field) => format!(" (field '{field}')"),
            _ => String::new(),
        },
        _ => String::new(),
    }
}
