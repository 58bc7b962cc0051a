//! Output router: persists a step or plugin value into the row.
//!
//! `mode` decides how one value lands in a row; `explode` decides how many
//! rows come out. Explode over N elements yields N full copies of the row,
//! each with one element applied. N = 0 yields no rows at all.

use serde_json::Value;

use rowforge_shared::{OutputMode, OutputStrategy, Result, Row, RowForgeError};

/// Apply `value` to `row` according to `strategy`.
///
/// Returns the rows that continue: exactly one without explode, one per array
/// element with it.
pub fn route(row: &Row, value: &Value, strategy: &OutputStrategy) -> Result<Vec<Row>> {
    if !strategy.explode {
        let mut row = row.clone();
        apply(&mut row, value, strategy)?;
        return Ok(vec![row]);
    }

    let Value::Array(items) = value else {
        return Err(RowForgeError::config(format!(
            "explode requires an array result, got {}",
            type_name(value)
        )));
    };

    items
        .iter()
        .map(|item| {
            let mut row = row.clone();
            apply(&mut row, item, strategy)?;
            Ok(row)
        })
        .collect()
}

/// Persist one value into `row` in place.
pub fn apply(row: &mut Row, value: &Value, strategy: &OutputStrategy) -> Result<()> {
    match strategy.mode {
        OutputMode::Ignore => Ok(()),
        OutputMode::Column => {
            let column = strategy.column_name.as_deref().ok_or_else(|| {
                RowForgeError::config("output mode `column` needs a column name")
            })?;
            row.insert(column.to_string(), value.clone());
            Ok(())
        }
        OutputMode::Merge => match value {
            Value::Object(fields) => {
                for (key, field) in fields {
                    row.insert(key.clone(), field.clone());
                }
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(RowForgeError::config(format!(
                "output mode `merge` needs an object, got {}",
                type_name(other)
            ))),
        },
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
