//! Literal and token escaping for statement rendering.
//!
//! Three modes, matching the three places a value can land in a statement:
//! quoted literal (embedded quotes doubled), raw token (identifiers and
//! fragments, untouched), and literal list (comma-joined, parenthesized in
//! bracket position). Values outside the [`SqlValue`] domain fail with an
//! encoding error instead of rendering silently wrong SQL.

use xodel_core::{Error, Result, SqlValue};

/// Quote a string literal, doubling embedded single quotes.
#[must_use]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn escape(value: &SqlValue, literal: bool, bracket: bool) -> Result<String> {
    match value {
        SqlValue::Null => Ok("NULL".to_string()),
        SqlValue::Default => Ok("DEFAULT".to_string()),
        SqlValue::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        SqlValue::Int(i) => Ok(i.to_string()),
        SqlValue::Float(f) => {
            if f.is_finite() {
                Ok(f.to_string())
            } else {
                Err(Error::encoding(format!("non-finite float {f}")))
            }
        }
        SqlValue::Str(s) => {
            if literal {
                Ok(quote_literal(s))
            } else {
                Ok(s.clone())
            }
        }
        SqlValue::Token(t) => Ok(t.clone()),
        SqlValue::Subquery(stmt) => Ok(format!("({stmt})")),
        SqlValue::List(items) => {
            if items.is_empty() {
                return Err(Error::encoding("empty list cannot be rendered"));
            }
            let parts = items
                .iter()
                .map(|item| escape(item, literal, bracket))
                .collect::<Result<Vec<_>>>()?;
            let joined = parts.join(", ");
            if bracket {
                Ok(format!("({joined})"))
            } else {
                Ok(joined)
            }
        }
    }
}

/// Render as a quoted literal; lists are parenthesized.
pub fn as_literal(value: &SqlValue) -> Result<String> {
    escape(value, true, true)
}

/// Render as a quoted literal without list parentheses, for SELECT
/// projection of literal rows.
pub fn as_literal_unbracketed(value: &SqlValue) -> Result<String> {
    escape(value, true, false)
}

/// Render as a raw token; strings pass through unquoted.
pub fn as_token(value: &SqlValue) -> Result<String> {
    escape(value, false, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_literal_doubles_quotes() {
        assert_eq!(
            as_literal(&SqlValue::Str("O'Brien".to_string())).unwrap(),
            "'O''Brien'"
        );
    }

    #[test]
    fn test_token_passes_through() {
        assert_eq!(
            as_token(&SqlValue::Token("count + 1".to_string())).unwrap(),
            "count + 1"
        );
        assert_eq!(as_token(&SqlValue::Str("name".to_string())).unwrap(), "name");
    }

    #[test]
    fn test_keywords_and_scalars() {
        assert_eq!(as_literal(&SqlValue::Null).unwrap(), "NULL");
        assert_eq!(as_literal(&SqlValue::Default).unwrap(), "DEFAULT");
        assert_eq!(as_literal(&SqlValue::Bool(true)).unwrap(), "TRUE");
        assert_eq!(as_literal(&SqlValue::Bool(false)).unwrap(), "FALSE");
        assert_eq!(as_literal(&SqlValue::Int(-3)).unwrap(), "-3");
        assert_eq!(as_literal(&SqlValue::Float(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_list_brackets_in_literal_mode() {
        let list = SqlValue::List(vec![SqlValue::Int(1), SqlValue::Str("a".to_string())]);
        assert_eq!(as_literal(&list).unwrap(), "(1, 'a')");
        assert_eq!(as_token(&list).unwrap(), "1, a");
    }

    #[test]
    fn test_unbracketed_list_renders_a_literal_row() {
        let row = SqlValue::List(vec![SqlValue::Str("tom".to_string()), SqlValue::Int(3)]);
        assert_eq!(as_literal_unbracketed(&row).unwrap(), "'tom', 3");
    }

    #[test]
    fn test_empty_list_fails() {
        let err = as_literal(&SqlValue::List(Vec::new())).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_subquery_parenthesized() {
        let sub = SqlValue::Subquery("SELECT 1".to_string());
        assert_eq!(as_literal(&sub).unwrap(), "(SELECT 1)");
    }

    #[test]
    fn test_non_finite_float_fails() {
        assert!(as_literal(&SqlValue::Float(f64::NAN)).is_err());
        assert!(as_literal(&SqlValue::Float(f64::INFINITY)).is_err());
    }
}
