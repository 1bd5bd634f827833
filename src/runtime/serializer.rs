//! Cycle-safe, depth-bounded rendering of values as indented JSON text.
//!
//! Maps whose keys are dense positive integers render as arrays; everything
//! else renders as an object in insertion order. Each rendered node charges
//! one governor step, so oversized results are cut off deterministically.

use std::collections::HashSet;

use crate::interpreter::value::{Key, Table, format_number};
use crate::interpreter::Value;

use super::budget::{Exhausted, Governor};

/// Default nesting depth beyond which composites are elided.
pub const DEFAULT_DEPTH_CAP: usize = 4;

/// Minimum share of present indices, in thousandths, for a map to render as
/// an array.
pub const ARRAY_DENSITY_PERMILLE: u64 = 900;

/// Placeholder for a composite that is already being rendered.
pub const RECURSION_PLACEHOLDER: &str = "<recursion>";

/// Placeholder for a composite nested beyond the depth cap.
pub const TOO_DEEP_PLACEHOLDER: &str = "<too deep>";

const INDENT: &str = "  ";

/// State scoped to one top-level render call.
pub struct SerializationContext<'g> {
    governor: &'g mut Governor,
    visited: HashSet<usize>,
    depth: usize,
    depth_cap: usize,
    density_permille: u64,
}

impl<'g> SerializationContext<'g> {
    /// Fresh context charging steps to `governor`.
    pub fn new(governor: &'g mut Governor) -> Self {
        Self {
            governor,
            visited: HashSet::new(),
            depth: 0,
            depth_cap: DEFAULT_DEPTH_CAP,
            density_permille: ARRAY_DENSITY_PERMILLE,
        }
    }

    /// Override the depth cap.
    pub fn with_depth_cap(mut self, depth_cap: usize) -> Self {
        self.depth_cap = depth_cap;
        self
    }

    fn write_value(&mut self, value: &Value, out: &mut String) -> Result<(), Exhausted> {
        self.governor.tick()?;
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
            Value::Number(n) if n.is_finite() => out.push_str(&format_number(*n)),
            Value::Number(n) => write_quoted(&format_number(*n), out),
            Value::String(text) => write_quoted(text, out),
            Value::Function(_) => write_quoted(&value.to_string(), out),
            Value::List(_) | Value::Map(_) => {
                let Some(identity) = value.identity() else {
                    out.push_str("null");
                    return Ok(());
                };
                if self.visited.contains(&identity) {
                    write_quoted(RECURSION_PLACEHOLDER, out);
                } else if self.depth > self.depth_cap {
                    write_quoted(TOO_DEEP_PLACEHOLDER, out);
                } else {
                    self.visited.insert(identity);
                    let rendered = self.write_composite(value, out);
                    self.visited.remove(&identity);
                    rendered?;
                }
            }
        }
        Ok(())
    }

    fn write_composite(&mut self, value: &Value, out: &mut String) -> Result<(), Exhausted> {
        match value {
            Value::List(list) => {
                let items: Vec<Value> = list.borrow().clone();
                self.write_array(items.iter().map(Some), out)
            }
            Value::Map(map) => {
                let snapshot = Snapshot::of(&map.borrow(), self.density_permille);
                match snapshot {
                    Snapshot::Array(slots) => self.write_array(slots.iter().map(Option::as_ref), out),
                    Snapshot::Object(entries) => {
                        let fields = entries.iter().map(|(key, value)| (key_text(key), value));
                        self.write_fields(fields, out)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn write_array<'v>(
        &mut self,
        items: impl ExactSizeIterator<Item = Option<&'v Value>>,
        out: &mut String,
    ) -> Result<(), Exhausted> {
        if items.len() == 0 {
            out.push_str("[]");
            return Ok(());
        }
        out.push('[');
        self.depth += 1;
        for (index, item) in items.enumerate() {
            if index > 0 {
                out.push(',');
            }
            self.newline(out);
            match item {
                Some(value) => self.write_value(value, out).inspect_err(|_| self.depth -= 1)?,
                None => {
                    self.governor.tick().inspect_err(|_| self.depth -= 1)?;
                    out.push_str("null");
                }
            }
        }
        self.depth -= 1;
        self.newline(out);
        out.push(']');
        Ok(())
    }

    fn write_fields<'v, K: AsRef<str>>(
        &mut self,
        fields: impl ExactSizeIterator<Item = (K, &'v Value)>,
        out: &mut String,
    ) -> Result<(), Exhausted> {
        if fields.len() == 0 {
            out.push_str("{}");
            return Ok(());
        }
        out.push('{');
        self.depth += 1;
        for (index, (key, value)) in fields.enumerate() {
            if index > 0 {
                out.push(',');
            }
            self.newline(out);
            write_quoted(key.as_ref(), out);
            out.push_str(": ");
            self.write_value(value, out).inspect_err(|_| self.depth -= 1)?;
        }
        self.depth -= 1;
        self.newline(out);
        out.push('}');
        Ok(())
    }

    fn newline(&self, out: &mut String) {
        out.push('\n');
        for _ in 0..self.depth {
            out.push_str(INDENT);
        }
    }
}

/// Entries copied out of a map so rendering never holds a borrow.
enum Snapshot {
    Array(Vec<Option<Value>>),
    Object(Vec<(Key, Value)>),
}

impl Snapshot {
    fn of(table: &Table, density_permille: u64) -> Snapshot {
        match array_extent(table, density_permille) {
            Some(max) => {
                let slots = (1..=max)
                    .map(|index| {
                        let value = table.get(&Key::Int(index as i64));
                        (!value.is_null()).then_some(value)
                    })
                    .collect();
                Snapshot::Array(slots)
            }
            None => Snapshot::Object(
                table
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
        }
    }
}

/// Highest index when `table` is array-like, otherwise `None`.
///
/// Array-like means every key is a positive integer and at least
/// `density_permille` thousandths of the slots up to the highest key are
/// occupied. The empty table is array-like with extent zero.
pub fn array_extent(table: &Table, density_permille: u64) -> Option<u64> {
    let mut count: u64 = 0;
    let mut max: u64 = 0;
    for (key, _) in table.iter() {
        let index = key.positive_index()?;
        count += 1;
        max = max.max(index);
    }
    let dense = u128::from(count) * 1000 >= u128::from(max) * u128::from(density_permille);
    dense.then_some(max)
}

fn key_text(key: &Key) -> String {
    match key {
        Key::Str(text) => text.to_string(),
        other => other.to_value().to_string(),
    }
}

fn write_quoted(text: &str, out: &mut String) {
    out.push_str(&serde_json::Value::String(text.to_string()).to_string());
}

/// Render `value`, charging one step per node to the context's governor.
pub fn render(value: &Value, context: &mut SerializationContext<'_>) -> Result<String, Exhausted> {
    let mut out = String::new();
    context.write_value(value, &mut out)?;
    Ok(out)
}

/// Render a fixed-order object whose fields may be null.
///
/// Used for response envelopes: the envelope itself sits at the context's
/// current depth and its field values one level below.
pub fn render_object(
    fields: &[(&str, Value)],
    context: &mut SerializationContext<'_>,
) -> Result<String, Exhausted> {
    let mut out = String::new();
    context.governor.tick()?;
    context.write_fields(fields.iter().map(|(key, value)| (*key, value)), &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn render_unbounded(value: &Value) -> String {
        let mut governor = Governor::unbounded();
        let mut context = SerializationContext::new(&mut governor);
        render(value, &mut context).expect("unbounded render")
    }

    fn int_keyed(keys: &[i64]) -> Value {
        Value::map(
            keys.iter()
                .map(|k| (Key::Int(*k), Value::from(*k * 10)))
                .collect(),
        )
    }

    #[test]
    fn scalars_render_as_literals() {
        assert_eq!(render_unbounded(&Value::Null), "null");
        assert_eq!(render_unbounded(&Value::Bool(true)), "true");
        assert_eq!(render_unbounded(&Value::Number(2.0)), "2");
        assert_eq!(render_unbounded(&Value::Number(0.5)), "0.5");
        assert_eq!(render_unbounded(&Value::from("a\"b\n")), r#""a\"b\n""#);
        assert_eq!(render_unbounded(&Value::Number(f64::INFINITY)), r#""inf""#);
    }

    #[test]
    fn dense_integer_keys_render_as_array() {
        assert_eq!(render_unbounded(&int_keyed(&[1, 2, 3])), "[\n  10,\n  20,\n  30\n]");
    }

    #[test]
    fn sparse_integer_keys_render_as_object() {
        let text = render_unbounded(&int_keyed(&[1, 2, 3, 5]));
        assert!(text.starts_with('{'), "{text}");
        assert!(text.contains("\"5\": 50"));
    }

    #[test]
    fn density_threshold_boundary() {
        let nine: Vec<i64> = (1..=10).filter(|k| *k != 4).collect();
        let text = render_unbounded(&int_keyed(&nine));
        assert!(text.starts_with('['), "{text}");
        assert!(text.contains("  null,"));

        let eight: Vec<i64> = (1..=10).filter(|k| *k != 4 && *k != 6).collect();
        assert!(render_unbounded(&int_keyed(&eight)).starts_with('{'));
    }

    #[test]
    fn empty_map_renders_as_empty_array() {
        assert_eq!(render_unbounded(&Value::empty_map()), "[]");
    }

    #[test]
    fn self_reference_renders_placeholder_once() {
        let value = Value::empty_map();
        let Value::Map(map) = &value else { unreachable!() };
        map.borrow_mut().set_str("self", value.clone());
        map.borrow_mut().set_str("n", 1i64);
        let text = render_unbounded(&value);
        assert_eq!(text.matches(RECURSION_PLACEHOLDER).count(), 1);
    }

    #[test]
    fn shared_subtables_are_not_recursion() {
        let shared = int_keyed(&[1]);
        let mut outer = Table::new();
        outer.set_str("a", shared.clone());
        outer.set_str("b", shared);
        let text = render_unbounded(&Value::map(outer));
        assert!(!text.contains(RECURSION_PLACEHOLDER), "{text}");
    }

    #[test]
    fn nesting_beyond_cap_is_elided() {
        let mut value = Value::list(vec![Value::from(1i64)]);
        for _ in 0..6 {
            value = Value::list(vec![value]);
        }
        let mut governor = Governor::unbounded();
        let mut context = SerializationContext::new(&mut governor).with_depth_cap(2);
        let text = render(&value, &mut context).expect("render");
        assert_eq!(text.matches(TOO_DEEP_PLACEHOLDER).count(), 1);
        assert!(!text.contains('1'));
    }

    #[test]
    fn large_results_exhaust_the_budget() {
        let value = Value::list((0..100i64).map(Value::from).collect());
        let mut governor = Governor::new(50);
        let mut context = SerializationContext::new(&mut governor);
        assert!(render(&value, &mut context).is_err());
    }

    #[test]
    fn envelope_keeps_null_fields_in_order() {
        let mut governor = Governor::unbounded();
        let mut context = SerializationContext::new(&mut governor);
        let text = render_object(&[("a", Value::Null), ("b", Value::from(1i64))], &mut context)
            .expect("render");
        assert_eq!(text, "{\n  \"a\": null,\n  \"b\": 1\n}");
    }

    #[derive(Debug, Clone)]
    enum Shape {
        Null,
        Bool(bool),
        Num(i32),
        Text(String),
        List(Vec<Shape>),
        Map(Vec<(String, Shape)>),
    }

    impl Shape {
        fn build(&self) -> Value {
            match self {
                Shape::Null => Value::Null,
                Shape::Bool(flag) => Value::Bool(*flag),
                Shape::Num(n) => Value::from(i64::from(*n)),
                Shape::Text(text) => Value::from(text.as_str()),
                Shape::List(items) => Value::list(items.iter().map(Shape::build).collect()),
                Shape::Map(entries) => {
                    let mut table = Table::new();
                    for (key, value) in entries {
                        table.set_str(key, value.build());
                    }
                    Value::map(table)
                }
            }
        }
    }

    fn shape() -> impl Strategy<Value = Shape> {
        let leaf = prop_oneof![
            Just(Shape::Null),
            any::<bool>().prop_map(Shape::Bool),
            any::<i32>().prop_map(Shape::Num),
            ".{0,8}".prop_map(Shape::Text),
        ];
        leaf.prop_recursive(6, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Shape::List),
                prop::collection::vec(("[a-z]{1,4}", inner), 0..6).prop_map(Shape::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn output_is_always_valid_json(shape in shape()) {
            let text = render_unbounded(&shape.build());
            prop_assert!(serde_json::from_str::<serde_json::Value>(&text).is_ok(), "{}", text);
        }
    }
}
