//! Collaborator seams: statement execution and remote schema resolution.
//!
//! The core never talks to a database or the network itself. Statement text
//! goes out through [`Queryer`]; choice lists and remotely defined schemas
//! come in through [`SchemaClient`] at model construction time. Both are
//! opaque: their failures pass through unmodified as [`Error::Query`].

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One result row from the query collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    /// Field-keyed row, the default shape.
    Keyed(Map<String, Value>),
    /// Positional row, returned when `compact` execution is requested.
    Compact(Vec<Value>),
}

impl Row {
    /// Field-keyed view, or an integrity error for compact rows.
    pub fn into_keyed(self) -> Result<Map<String, Value>> {
        match self {
            Self::Keyed(map) => Ok(map),
            Self::Compact(_) => Err(Error::Integrity(
                "expected a field-keyed row, got a compact row".to_string(),
            )),
        }
    }
}

/// Executes rendered statements. Multi-statement text (merge, align,
/// prepend/append groups) must run as one round trip so the datastore can
/// make it atomic.
pub trait Queryer {
    /// Execute `statement` and return its rows. `compact` requests
    /// positional rows instead of field-keyed maps. For `;`-chained text
    /// the implementation returns the rows of the main statement, the one
    /// carrying the operation's RETURNING or select list.
    fn execute(&self, statement: &str, compact: bool) -> Result<Vec<Row>>;
}

/// Fetches remotely defined schema material at setup time: choice lists and
/// model descriptors referenced by URL.
pub trait SchemaClient {
    fn fetch(&self, url: &str) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_keyed() {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(1));
        let row = Row::Keyed(map.clone());
        assert_eq!(row.into_keyed().unwrap(), map);

        let compact = Row::Compact(vec![json!(1)]);
        assert!(matches!(compact.into_keyed(), Err(Error::Integrity(_))));
    }
}
