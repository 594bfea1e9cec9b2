//! Reserved words that field and table names must avoid.
//!
//! The list covers PostgreSQL reserved keywords plus the operator suffixes
//! recognized by dotted-path condition keys, since a field named `notin`
//! would make `field__notin` ambiguous.

/// Reserved words, uppercase. Sorted so membership is a binary search.
static RESERVED: &[&str] = &[
    "ALL",
    "ANALYSE",
    "ANALYZE",
    "AND",
    "ANY",
    "ARRAY",
    "AS",
    "ASC",
    "ASYMMETRIC",
    "AUTHORIZATION",
    "BINARY",
    "BOTH",
    "CASE",
    "CAST",
    "CHECK",
    "COLLATE",
    "COLLATION",
    "COLUMN",
    "CONCURRENTLY",
    "CONSTRAINT",
    "CONTAINS",
    "CREATE",
    "CROSS",
    "CURRENT_CATALOG",
    "CURRENT_DATE",
    "CURRENT_ROLE",
    "CURRENT_SCHEMA",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "CURRENT_USER",
    "DEFAULT",
    "DEFERRABLE",
    "DESC",
    "DISTINCT",
    "DO",
    "ELSE",
    "END",
    "ENDSWITH",
    "EQ",
    "EXCEPT",
    "FALSE",
    "FETCH",
    "FOR",
    "FOREIGN",
    "FREEZE",
    "FROM",
    "FULL",
    "GRANT",
    "GROUP",
    "GT",
    "GTE",
    "HAVING",
    "ILIKE",
    "IN",
    "INITIALLY",
    "INNER",
    "INTERSECT",
    "INTO",
    "IS",
    "ISNULL",
    "JOIN",
    "LATERAL",
    "LEADING",
    "LEFT",
    "LIKE",
    "LIMIT",
    "LOCALTIME",
    "LOCALTIMESTAMP",
    "LT",
    "LTE",
    "NATURAL",
    "NE",
    "NOT",
    "NOTIN",
    "NOTNULL",
    "NULL",
    "OFFSET",
    "ON",
    "ONLY",
    "OR",
    "ORDER",
    "OUTER",
    "OVERLAPS",
    "PLACING",
    "PRIMARY",
    "REFERENCES",
    "REGEX",
    "REGEX_INSENSITIVE",
    "REGEX_SENSITIVE",
    "RETURNING",
    "RIGHT",
    "SELECT",
    "SESSION_USER",
    "SIMILAR",
    "SOME",
    "STARTSWITH",
    "SYMMETRIC",
    "TABLE",
    "TABLESAMPLE",
    "THEN",
    "TO",
    "TRAILING",
    "TRUE",
    "UNION",
    "UNIQUE",
    "USER",
    "USING",
    "VARIADIC",
    "VERBOSE",
    "WHEN",
    "WHERE",
    "WINDOW",
    "WITH",
];

/// Internal aliases claimed by the statement builder and its CTE pipelines.
static ALIAS_TOKENS: &[&str] = &["D", "T", "U", "V", "W"];

/// Case-insensitive reserved-word check.
#[must_use]
pub fn is_reserved(word: &str) -> bool {
    let upper = word.to_uppercase();
    RESERVED.binary_search(&upper.as_str()).is_ok()
}

/// True when the name collides with a builder-internal table alias.
#[must_use]
pub fn is_alias_token(word: &str) -> bool {
    ALIAS_TOKENS.contains(&word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_list_is_sorted() {
        let mut sorted = RESERVED.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, RESERVED);
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert!(is_reserved("select"));
        assert!(is_reserved("SELECT"));
        assert!(is_reserved("Order"));
        assert!(!is_reserved("title"));
    }

    #[test]
    fn test_operator_suffixes_reserved() {
        assert!(is_reserved("notin"));
        assert!(is_reserved("startswith"));
        assert!(is_reserved("eq"));
        assert!(is_reserved("regex"));
        assert!(is_reserved("regex_sensitive"));
        assert!(is_reserved("regex_insensitive"));
    }

    #[test]
    fn test_alias_tokens() {
        assert!(is_alias_token("T"));
        assert!(is_alias_token("V"));
        assert!(!is_alias_token("t"));
        assert!(!is_alias_token("X"));
    }
}
