//! JSON Schema validation and relaxation.
//!
//! Supports the draft-07 subset pipelines actually use: `type` (including
//! type lists and `null`), `properties`, `required`, `additionalProperties`,
//! `items`, `enum`, `const`, string/number/array bounds, `pattern`, and the
//! `anyOf`/`oneOf`/`allOf` combinators, and local `$ref`s into `definitions`
//! or `$defs`. Unknown keywords are ignored.

use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

/// One validation failure, located by a JSON path such as `$.people[2].name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `instance` against `schema`; an empty result means valid.
///
/// Local `$ref`s (`#`, `#/definitions/..`, `#/$defs/..`) resolve against
/// `schema` itself.
pub fn validate(schema: &Value, instance: &Value) -> Vec<FieldError> {
    let mut checker = Checker {
        root: schema,
        errors: Vec::new(),
        depth: 0,
    };
    checker.check(schema, instance, "$");
    checker.errors
}

/// Deepest chain of nested schemas followed before giving up on a cyclic `$ref`.
const MAX_DEPTH: usize = 128;

struct Checker<'a> {
    root: &'a Value,
    errors: Vec<FieldError>,
    depth: usize,
}

impl<'a> Checker<'a> {
    fn check(&mut self, schema: &'a Value, value: &Value, path: &str) {
        if self.depth >= MAX_DEPTH {
            self.push(path, "schema nesting is too deep (cyclic $ref?)");
            return;
        }
        self.depth += 1;
        self.check_node(schema, value, path);
        self.depth -= 1;
    }

    fn check_node(&mut self, schema: &'a Value, value: &Value, path: &str) {
        let schema = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                self.push(path, "no value is allowed here");
                return;
            }
            Value::Object(map) => map,
            _ => return,
        };

        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            match resolve_ref(self.root, reference) {
                Some(target) => self.check(target, value, path),
                None => self.push(path, format!("schema $ref {reference} cannot be resolved")),
            }
        }

        if let Some(expected) = schema.get("type") {
            if !type_allows(expected, value) {
                self.push(
                    path,
                    format!("expected {}, got {}", describe_type(expected), type_name(value)),
                );
                return;
            }
        }

        if let Some(Value::Array(allowed)) = schema.get("enum") {
            if !allowed.contains(value) {
                self.push(path, format!("must be one of {}", Value::Array(allowed.clone())));
            }
        }
        if let Some(expected) = schema.get("const") {
            if expected != value {
                self.push(path, format!("must equal {expected}"));
            }
        }

        match value {
            Value::String(s) => self.check_string(schema, s, path),
            Value::Number(_) => self.check_number(schema, value, path),
            Value::Array(items) => self.check_array(schema, items, path),
            Value::Object(object) => self.check_object(schema, object, path),
            _ => {}
        }

        self.check_combinators(schema, value, path);
    }

    fn check_string(&mut self, schema: &Map<String, Value>, s: &str, path: &str) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                self.push(path, format!("must be at least {min} characters"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                self.push(path, format!("must be at most {max} characters"));
            }
        }
        if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
            match Regex::new(pattern) {
                Ok(re) if !re.is_match(s) => self.push(path, format!("must match /{pattern}/")),
                Ok(_) => {}
                Err(e) => self.push(path, format!("schema pattern is invalid: {e}")),
            }
        }
    }

    fn check_number(&mut self, schema: &Map<String, Value>, value: &Value, path: &str) {
        let Some(n) = value.as_f64() else {
            return;
        };
        let bound = |key: &str| schema.get(key).and_then(Value::as_f64);

        if let Some(min) = bound("minimum") {
            if n < min {
                self.push(path, format!("must be >= {min}"));
            }
        }
        if let Some(max) = bound("maximum") {
            if n > max {
                self.push(path, format!("must be <= {max}"));
            }
        }
        if let Some(min) = bound("exclusiveMinimum") {
            if n <= min {
                self.push(path, format!("must be > {min}"));
            }
        }
        if let Some(max) = bound("exclusiveMaximum") {
            if n >= max {
                self.push(path, format!("must be < {max}"));
            }
        }
    }

    fn check_array(&mut self, schema: &'a Map<String, Value>, items: &[Value], path: &str) {
        let len = items.len() as u64;
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if len < min {
                self.push(path, format!("must have at least {min} items"));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if len > max {
                self.push(path, format!("must have at most {max} items"));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(item_schema, item, &format!("{path}[{i}]"));
            }
        }
    }

    fn check_object(&mut self, schema: &'a Map<String, Value>, object: &Map<String, Value>, path: &str) {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    self.push(&format!("{path}.{key}"), "is required");
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (key, value) in object {
            let child = format!("{path}.{key}");
            match properties.and_then(|p| p.get(key)) {
                Some(prop_schema) => self.check(prop_schema, value, &child),
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => self.push(&child, "is not an allowed property"),
                    Some(extra @ Value::Object(_)) => self.check(extra, value, &child),
                    _ => {}
                },
            }
        }
    }

    fn check_combinators(&mut self, schema: &'a Map<String, Value>, value: &Value, path: &str) {
        if let Some(Value::Array(all)) = schema.get("allOf") {
            for sub in all {
                self.check(sub, value, path);
            }
        }
        if let Some(Value::Array(any)) = schema.get("anyOf") {
            if !any.iter().any(|sub| self.matches(sub, value, path)) {
                self.push(path, "does not match any allowed schema");
            }
        }
        if let Some(Value::Array(one)) = schema.get("oneOf") {
            let matches = one
                .iter()
                .filter(|sub| self.matches(*sub, value, path))
                .count();
            if matches != 1 {
                self.push(path, format!("must match exactly one schema, matched {matches}"));
            }
        }
    }

    /// Trial validation whose errors are discarded.
    fn matches(&self, schema: &'a Value, value: &Value, path: &str) -> bool {
        let mut trial = Checker {
            root: self.root,
            errors: Vec::new(),
            depth: self.depth,
        };
        trial.check(schema, value, path);
        trial.errors.is_empty()
    }

    fn push(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Resolve a document-local reference; remote references are unsupported.
fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

fn type_allows(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| type_matches(t, value)),
        _ => true,
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Relaxation
// ---------------------------------------------------------------------------

/// Widen a schema for partial extraction: nothing is required and every
/// nested value may be `null`. The root keeps its type.
pub fn relax(schema: &Value) -> Value {
    let mut relaxed = schema.clone();
    relax_node(&mut relaxed, true);
    relaxed
}

fn relax_node(node: &mut Value, is_root: bool) {
    let Value::Object(map) = node else {
        return;
    };

    map.remove("required");
    map.remove("minItems");
    map.remove("minLength");

    if !is_root {
        if let Some(t) = map.get_mut("type") {
            make_nullable(t);
        }
        if let Some(Value::Array(allowed)) = map.get_mut("enum") {
            if !allowed.contains(&Value::Null) {
                allowed.push(Value::Null);
            }
        }
    }

    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for prop in props.values_mut() {
            relax_node(prop, false);
        }
    }
    if let Some(items) = map.get_mut("items") {
        relax_node(items, false);
    }
    if let Some(extra @ Value::Object(_)) = map.get_mut("additionalProperties") {
        relax_node(extra, false);
    }
    for key in ["definitions", "$defs"] {
        if let Some(Value::Object(defs)) = map.get_mut(key) {
            for def in defs.values_mut() {
                relax_node(def, false);
            }
        }
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(subs)) = map.get_mut(key) {
            for sub in subs {
                relax_node(sub, false);
            }
        }
    }
}

fn make_nullable(t: &mut Value) {
    match t {
        Value::String(name) if name != "null" => {
            *t = Value::Array(vec![Value::String(name.clone()), Value::String("null".into())]);
        }
        Value::Array(types) if !types.iter().any(|v| v == "null") => {
            types.push(Value::String("null".into()));
        }
        _ => {}
    }
}
