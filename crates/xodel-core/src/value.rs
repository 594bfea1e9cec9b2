//! The literal domain accepted by the statement renderer.
//!
//! `SqlValue` is what field `prepare_for_db` transforms produce and what the
//! escaper in `xodel-query` consumes. It distinguishes the `NULL` and
//! `DEFAULT` keywords from ordinary data and carries raw tokens and
//! pre-rendered sub-selects so builders can compose without re-parsing.

use serde_json::Value;

use crate::error::Error;

/// A value headed for a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Renders as the keyword `NULL`.
    Null,
    /// Renders as the keyword `DEFAULT` (insert column fallback).
    Default,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw SQL fragment injected without quoting.
    Token(String),
    /// Comma-joined list; parenthesized in bracket mode.
    List(Vec<SqlValue>),
    /// A pre-rendered statement, always parenthesized.
    Subquery(String),
}

impl SqlValue {
    /// Raw token constructor, mirroring `Token` but reading better at call
    /// sites that inject fragments like `count + 1`.
    pub fn token(fragment: impl Into<String>) -> Self {
        Self::Token(fragment.into())
    }

    /// Convert loaded JSON data into a literal.
    ///
    /// Objects are rejected: structured kinds must be encoded to text by
    /// their field's `prepare_for_db` before reaching the renderer.
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(Error::encoding(format!("unrepresentable number {n}")))
                }
            }
            Value::String(s) => Ok(Self::Str(s.clone())),
            Value::Array(items) => {
                let list = items.iter().map(Self::from_json).collect::<Result<_, _>>()?;
                Ok(Self::List(list))
            }
            Value::Object(_) => Err(Error::encoding(
                "json object must be encoded to text before rendering",
            )),
        }
    }

    /// True for the `NULL` keyword sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for SqlValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(SqlValue::from_json(&json!(null)).unwrap(), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&json!(true)).unwrap(), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(&json!(42)).unwrap(), SqlValue::Int(42));
        assert_eq!(SqlValue::from_json(&json!(1.5)).unwrap(), SqlValue::Float(1.5));
        assert_eq!(
            SqlValue::from_json(&json!("a")).unwrap(),
            SqlValue::Str("a".to_string())
        );
    }

    #[test]
    fn test_from_json_array() {
        let v = SqlValue::from_json(&json!([1, "x"])).unwrap();
        assert_eq!(
            v,
            SqlValue::List(vec![SqlValue::Int(1), SqlValue::Str("x".to_string())])
        );
    }

    #[test]
    fn test_from_json_object_rejected() {
        let err = SqlValue::from_json(&json!({"a": 1})).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i64> = None;
        assert_eq!(SqlValue::from(none), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(7i64)), SqlValue::Int(7));
    }
}
