//! Condition operators and logical composition rules.
//!
//! A dotted-path key terminates in one of the operators here; the builder
//! resolves the column (including any joins) and this module renders the
//! comparison fragment. Non-text columns are cast to varchar before the
//! substring and regex operators so the fragments stay type-correct.

use xodel_core::{Error, Result, SqlValue};

use crate::escape::as_literal;

/// Every operator a dotted-path key may end with.
pub const OPERATORS: &[&str] = &[
    "eq",
    "ne",
    "lt",
    "lte",
    "gt",
    "gte",
    "in",
    "notin",
    "contains",
    "startswith",
    "endswith",
    "regex",
    "regex_sensitive",
    "regex_insensitive",
    "null",
];

#[must_use]
pub fn is_operator(token: &str) -> bool {
    OPERATORS.contains(&token)
}

/// Operators whose right-hand side is a text pattern.
fn is_string_operator(op: &str) -> bool {
    matches!(
        op,
        "contains" | "startswith" | "endswith" | "regex" | "regex_sensitive" | "regex_insensitive"
    )
}

/// Parenthesization priority for expression trees: not > and > or. A lower
/// priority nested under a higher one keeps its parentheses.
#[must_use]
pub fn logic_priority(op: &str) -> u8 {
    match op {
        "or" => 1,
        "and" => 2,
        "not" => 3,
        _ => 0,
    }
}

fn pattern_text(op: &str, value: &SqlValue) -> Result<String> {
    match value {
        SqlValue::Str(s) => Ok(s.replace('\'', "''")),
        other => Err(Error::encoding(format!(
            "operator {op} requires a string value, got {other:?}"
        ))),
    }
}

/// Render one comparison fragment against an already-qualified column.
pub fn render_op(column: &str, op: &str, value: &SqlValue, is_text: bool) -> Result<String> {
    let column = if is_text || !is_string_operator(op) {
        column.to_string()
    } else {
        format!("{column}::varchar")
    };
    match op {
        "eq" => Ok(format!("{column} = {}", as_literal(value)?)),
        "ne" => Ok(format!("{column} <> {}", as_literal(value)?)),
        "lt" => Ok(format!("{column} < {}", as_literal(value)?)),
        "lte" => Ok(format!("{column} <= {}", as_literal(value)?)),
        "gt" => Ok(format!("{column} > {}", as_literal(value)?)),
        "gte" => Ok(format!("{column} >= {}", as_literal(value)?)),
        "in" => Ok(format!("{column} IN {}", as_literal(value)?)),
        "notin" => Ok(format!("{column} NOT IN {}", as_literal(value)?)),
        "contains" => Ok(format!("{column} LIKE '%{}%'", pattern_text(op, value)?)),
        "startswith" => Ok(format!("{column} LIKE '{}%'", pattern_text(op, value)?)),
        "endswith" => Ok(format!("{column} LIKE '%{}'", pattern_text(op, value)?)),
        "regex" | "regex_sensitive" => {
            Ok(format!("{column} ~ '{}'", pattern_text(op, value)?))
        }
        "regex_insensitive" => Ok(format!("{column} ~* '{}'", pattern_text(op, value)?)),
        "null" => match value {
            SqlValue::Bool(false) => Ok(format!("{column} IS NOT NULL")),
            _ => Ok(format!("{column} IS NULL")),
        },
        other => Err(Error::encoding(format!("invalid operator: {other}"))),
    }
}
