//! The statement builder.
//!
//! A [`Sql`] is bound to one model and accumulates rendered clause fragments
//! until [`Sql::statement`] assembles them into the final text. Builders are
//! short-lived: one per operation, discarded after rendering. They never
//! execute anything themselves.
//!
//! Dotted-path condition keys (`author__name__contains`) walk foreign keys
//! one hop per segment, registering a deduplicated inner join per distinct
//! path. Join targets live in an explicit alias map built as joins are
//! registered, so rendering never has to look anything up dynamically.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use xodel_core::{is_string_db_type, Error, Field, FieldKind, Model, Result, SqlValue};

use crate::cond::{is_operator, logic_priority, render_op};
use crate::escape::as_literal;

/// How one registered join renders: kind, `table alias` declaration, and the
/// ON condition.
#[derive(Debug, Clone)]
struct JoinArg {
    kind: String,
    table: String,
    cond: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    Union,
    UnionAll,
    Except,
    Intersect,
}

impl SetOp {
    fn keyword(self) -> &'static str {
        match self {
            SetOp::Union => "UNION",
            SetOp::UnionAll => "UNION ALL",
            SetOp::Except => "EXCEPT",
            SetOp::Intersect => "INTERSECT",
        }
    }
}

/// Where a dotted path terminated.
enum PathOp {
    /// A comparison operator, `eq` when the path named a plain column.
    Named(String),
    /// JSON containment against a nested table column: the inner field name.
    JsonContains(String),
}

struct ParsedColumn {
    qualified: String,
    op: PathOp,
    /// Final field on the path, absent for pass-through `table.column` keys.
    field: Option<Field>,
}

impl ParsedColumn {
    fn is_text(&self) -> bool {
        // unknown columns never get a cast
        self.field
            .as_ref()
            .is_none_or(|f| is_string_db_type(&f.db_type))
    }
}

/// One SQL statement under construction.
#[derive(Debug, Clone)]
pub struct Sql {
    model: Arc<Model>,
    table_alias: Option<String>,
    with: Option<String>,
    with_recursive: Option<String>,
    select: Option<String>,
    distinct: bool,
    distinct_on: Option<String>,
    insert: Option<String>,
    update: Option<String>,
    delete: bool,
    from: Option<String>,
    using: Option<String>,
    join_args: Vec<JoinArg>,
    /// Dotted join path to alias, for join deduplication.
    join_keys: HashMap<String, String>,
    /// Alias to joined model, the explicit join context.
    alias_models: HashMap<String, Arc<Model>>,
    where_clause: Option<String>,
    group: Option<String>,
    having: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    returning: Option<String>,
    set_ops: Vec<(SetOp, String)>,
    prepends: Vec<String>,
    appends: Vec<String>,
    compact: bool,
}

impl Sql {
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            table_alias: None,
            with: None,
            with_recursive: None,
            select: None,
            distinct: false,
            distinct_on: None,
            insert: None,
            update: None,
            delete: false,
            from: None,
            using: None,
            join_args: Vec::new(),
            join_keys: HashMap::new(),
            alias_models: HashMap::new(),
            where_clause: None,
            group: None,
            having: None,
            order: None,
            limit: None,
            offset: None,
            returning: None,
            set_ops: Vec::new(),
            prepends: Vec::new(),
            appends: Vec::new(),
            compact: false,
        }
    }

    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Alias the main table for the rest of this statement.
    #[must_use]
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.table_alias = Some(name.into());
        self
    }

    // ---- column resolution ----

    fn base_alias(&self) -> String {
        self.table_alias
            .clone()
            .unwrap_or_else(|| self.model.table_name.clone())
    }

    /// Qualify a single column of the main table. `*` and already-qualified
    /// `table.column` keys pass through.
    fn column_of(&self, key: &str) -> Result<String> {
        if self.model.fields.contains_key(key) {
            return Ok(match &self.table_alias {
                Some(alias) => format!("{alias}.{key}"),
                None => self
                    .model
                    .column(key)
                    .map_or_else(|| format!("{}.{key}", self.model.table_name), String::from),
            });
        }
        if key == "*" {
            return Ok("*".to_string());
        }
        if let Some((table, column)) = key.split_once('.') {
            let ident = |s: &str| {
                !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            };
            if ident(table) && ident(column) {
                return Ok(key.to_string());
            }
        }
        Err(Error::construction(format!(
            "invalid field name '{key}' for {}",
            self.model.table_name
        )))
    }

    fn register_join(&mut self, kind: &str, table: String, cond: String) {
        self.join_args.push(JoinArg {
            kind: kind.to_string(),
            table,
            cond,
        });
    }

    /// Walk a dotted-path key, registering joins as needed, and return the
    /// qualified column plus terminal operator.
    fn parse_column(&mut self, key: &str) -> Result<ParsedColumn> {
        if !key.contains("__") {
            return Ok(ParsedColumn {
                qualified: self.column_of(key)?,
                op: PathOp::Named("eq".to_string()),
                field: self.model.fields.get(key).cloned(),
            });
        }
        let mut segments = key.split("__");
        let first = segments.next().unwrap_or_default();
        let mut field = self.model.fields.get(first).cloned().ok_or_else(|| {
            Error::construction(format!(
                "{first} is not a valid field name for {}",
                self.model.table_name
            ))
        })?;
        let mut model = Arc::clone(&self.model);
        let mut prefix = self.base_alias();
        let mut field_name = first.to_string();
        let mut join_key: Option<String> = None;
        let mut op: Option<PathOp> = None;
        for token in segments {
            match &field.kind {
                FieldKind::ForeignKey(fk) => {
                    let reference_column = fk.reference_column.clone();
                    let Some(fk_model) = field.fk_model(&model).cloned() else {
                        return Err(Error::construction(format!(
                            "unresolved foreign key {field_name} on {}",
                            model.table_name
                        )));
                    };
                    if !fk_model.fields.contains_key(token) {
                        // author__gt compares on the stored key itself
                        op = Some(PathOp::Named(token.to_string()));
                        break;
                    }
                    if token == reference_column {
                        // author__id is the stored column, no join needed
                        break;
                    }
                    let path = match &join_key {
                        None => field_name.clone(),
                        Some(jk) => format!("{jk}__{field_name}"),
                    };
                    if let Some(alias) = self.join_keys.get(&path) {
                        prefix = alias.clone();
                    } else {
                        let alias = format!("T{}", self.join_keys.len() + 1);
                        let cond =
                            format!("{prefix}.{field_name} = {alias}.{reference_column}");
                        self.register_join(
                            "INNER",
                            format!("{} {alias}", fk_model.table_name),
                            cond,
                        );
                        self.join_keys.insert(path.clone(), alias.clone());
                        self.alias_models.insert(alias.clone(), Arc::clone(&fk_model));
                        prefix = alias;
                    }
                    join_key = Some(path);
                    field = fk_model
                        .fields
                        .get(token)
                        .cloned()
                        .ok_or_else(|| Error::construction(format!("missing field {token}")))?;
                    field_name = token.to_string();
                    model = fk_model;
                }
                FieldKind::Table(table) => {
                    if !table.model.fields.contains_key(token) {
                        return Err(Error::construction(format!(
                            "invalid nested field name {token} of {field_name}"
                        )));
                    }
                    op = Some(PathOp::JsonContains(token.to_string()));
                    break;
                }
                _ => {
                    op = Some(PathOp::Named(token.to_string()));
                    break;
                }
            }
        }
        Ok(ParsedColumn {
            qualified: format!("{prefix}.{field_name}"),
            op: op.unwrap_or_else(|| PathOp::Named("eq".to_string())),
            field: Some(field),
        })
    }

    /// Resolve a key for a select list; foreign-key paths render with the
    /// original key as alias.
    fn parse_select_column(&mut self, key: &str) -> Result<String> {
        if !key.contains("__") {
            return self.column_of(key);
        }
        let parsed = self.parse_column(key)?;
        match parsed.op {
            PathOp::Named(op) if op == "eq" => Ok(format!("{} AS {key}", parsed.qualified)),
            _ => Err(Error::construction(format!("invalid field name: {key}"))),
        }
    }

    fn expr_token(&mut self, key: &str, value: &Value) -> Result<String> {
        let parsed = self.parse_column(key)?;
        match &parsed.op {
            PathOp::JsonContains(inner) => {
                let encoded = value.to_string().replace('\'', "''");
                Ok(format!(
                    "{} @> '[{{\"{inner}\":{encoded}}}]'",
                    parsed.qualified
                ))
            }
            PathOp::Named(op) => {
                if !is_operator(op) {
                    return Err(Error::encoding(format!("invalid sql op: {op}")));
                }
                let is_text = parsed.is_text();
                render_op(&parsed.qualified, op, &SqlValue::from_json(value)?, is_text)
            }
        }
    }

    fn map_condition_token(&mut self, kwargs: &Map<String, Value>, logic: &str) -> Result<String> {
        let mut tokens = Vec::with_capacity(kwargs.len());
        for (key, value) in kwargs {
            tokens.push(self.expr_token(key, value)?);
        }
        Ok(tokens.join(&format!(" {logic} ")))
    }

    fn add_where(&mut self, token: String, or: bool) {
        if token.is_empty() {
            return;
        }
        self.where_clause = Some(match self.where_clause.take() {
            None => token,
            Some(prev) if or => format!("{prev} OR {token}"),
            Some(prev) => format!("({prev}) AND ({token})"),
        });
    }

    /// AND-combine without re-wrapping the new token, for IN and IS NULL
    /// fragments that carry their own grouping.
    fn add_where_tail(&mut self, token: String) {
        self.where_clause = Some(match self.where_clause.take() {
            None => token,
            Some(prev) => format!("({prev}) AND {token}"),
        });
    }

    // ---- select family ----

    fn push_select(&mut self, fragment: String) {
        if fragment.is_empty() {
            return;
        }
        self.select = Some(match self.select.take() {
            None => fragment,
            Some(prev) => format!("{prev}, {fragment}"),
        });
    }

    pub fn select(mut self, names: &[&str]) -> Result<Self> {
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            tokens.push(self.parse_select_column(name)?);
        }
        self.push_select(tokens.join(", "));
        Ok(self)
    }

    pub fn select_as(mut self, name: &str, alias: &str) -> Result<Self> {
        let column = self.column_of(name)?;
        self.push_select(format!("{column} AS {alias}"));
        Ok(self)
    }

    /// Append a raw fragment to the select list, e.g. `count(*)`.
    #[must_use]
    pub fn select_raw(mut self, fragment: impl Into<String>) -> Self {
        self.push_select(fragment.into());
        self
    }

    pub fn select_literal(mut self, value: &SqlValue) -> Result<Self> {
        let literal = as_literal(value)?;
        self.push_select(literal);
        Ok(self)
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// DISTINCT ON requires the chosen columns to lead the sort order, so
    /// this sets ORDER BY to the same list.
    pub fn distinct_on(mut self, names: &[&str]) -> Result<Self> {
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            tokens.push(self.parse_select_column(name)?);
        }
        let s = tokens.join(", ");
        self.distinct_on = Some(s.clone());
        self.order = Some(s);
        Ok(self)
    }

    /// Order by column names, `-name` for descending.
    pub fn order(mut self, names: &[&str]) -> Result<Self> {
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            let (direction, bare) = match name.strip_prefix('-') {
                Some(rest) => ("DESC", rest),
                None => ("ASC", name.strip_prefix('+').unwrap_or(name)),
            };
            let parsed = self.parse_column(bare)?;
            tokens.push(format!("{} {direction}", parsed.qualified));
        }
        let s = tokens.join(", ");
        self.order = Some(match self.order.take() {
            None => s,
            Some(prev) => format!("{prev}, {s}"),
        });
        Ok(self)
    }

    pub fn group(mut self, names: &[&str]) -> Result<Self> {
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            tokens.push(self.parse_select_column(name)?);
        }
        let s = tokens.join(", ");
        self.group = Some(match self.group.take() {
            None => s,
            Some(prev) => format!("{prev}, {s}"),
        });
        Ok(self)
    }

    /// HAVING takes a pre-rendered condition; aggregates are not model
    /// columns.
    #[must_use]
    pub fn having(mut self, cond: impl Into<String>) -> Self {
        let token = cond.into();
        self.having = Some(match self.having.take() {
            None => token,
            Some(prev) => format!("({prev}) AND ({token})"),
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Positional result rows instead of keyed maps.
    #[must_use]
    pub fn compact(mut self) -> Self {
        self.compact = true;
        self
    }

    #[must_use]
    pub fn is_compact(&self) -> bool {
        self.compact
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.insert.is_some() || self.update.is_some() || self.delete
    }

    #[must_use]
    pub fn has_returning(&self) -> bool {
        self.returning.is_some()
    }

    #[must_use]
    pub fn prepend_count(&self) -> usize {
        self.prepends.len()
    }

    // ---- where family ----

    /// AND of the map's conditions, AND-combined with any prior condition.
    pub fn where_map(mut self, kwargs: &Map<String, Value>) -> Result<Self> {
        let token = self.map_condition_token(kwargs, "AND")?;
        self.add_where(token, false);
        Ok(self)
    }

    /// AND of the map's conditions, OR-combined with any prior condition.
    pub fn or_where_map(mut self, kwargs: &Map<String, Value>) -> Result<Self> {
        let token = self.map_condition_token(kwargs, "AND")?;
        self.add_where(token, true);
        Ok(self)
    }

    #[must_use]
    pub fn where_raw(mut self, token: impl Into<String>) -> Self {
        self.add_where(token.into(), false);
        self
    }

    /// Nested expression tree: `["or", cond, ["not", cond, ...], ...]` where
    /// leaf conditions are keyword maps. Parenthesization follows operator
    /// priority, not > and > or.
    pub fn where_exp(mut self, cond: &Value) -> Result<Self> {
        let token = self.parse_where_exp(cond, "init")?;
        self.add_where(token, false);
        Ok(self)
    }

    fn parse_where_exp(&mut self, cond: &Value, father_op: &str) -> Result<String> {
        let items = cond
            .as_array()
            .ok_or_else(|| Error::encoding("where expression must be an array"))?;
        let logic_op = items
            .first()
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .filter(|op| matches!(op.as_str(), "and" | "or" | "not"))
            .ok_or_else(|| {
                Error::encoding("where expression must start with and, or, or not")
            })?;
        let mut tokens = Vec::new();
        for item in &items[1..] {
            match item {
                Value::Array(_) => tokens.push(self.parse_where_exp(item, &logic_op)?),
                Value::Object(kwargs) => {
                    for (key, value) in kwargs {
                        tokens.push(self.expr_token(key, value)?);
                    }
                }
                other => {
                    return Err(Error::encoding(format!(
                        "invalid where expression item: {other}"
                    )));
                }
            }
        }
        let token = if logic_op == "not" {
            format!("NOT {}", tokens.join(" AND NOT "))
        } else {
            tokens.join(&format!(" {} ", logic_op.to_uppercase()))
        };
        if logic_priority(&logic_op) < logic_priority(father_op) {
            Ok(format!("({token})"))
        } else {
            Ok(token)
        }
    }

    pub fn where_in(mut self, columns: &[&str], sub: &Sql) -> Result<Self> {
        let token = self.in_token(columns, sub, "IN")?;
        self.add_where_tail(token);
        Ok(self)
    }

    pub fn where_not_in(mut self, columns: &[&str], sub: &Sql) -> Result<Self> {
        let token = self.in_token(columns, sub, "NOT IN")?;
        self.add_where_tail(token);
        Ok(self)
    }

    fn in_token(&mut self, columns: &[&str], sub: &Sql, op: &str) -> Result<String> {
        let mut cols = Vec::with_capacity(columns.len());
        for column in columns {
            cols.push(self.column_of(column)?);
        }
        Ok(format!("({}) {op} ({})", cols.join(", "), sub.statement()))
    }

    pub fn where_null(mut self, column: &str) -> Result<Self> {
        let col = self.column_of(column)?;
        self.add_where_tail(format!("{col} IS NULL"));
        Ok(self)
    }

    pub fn where_not_null(mut self, column: &str) -> Result<Self> {
        let col = self.column_of(column)?;
        self.add_where_tail(format!("{col} IS NOT NULL"));
        Ok(self)
    }

    // ---- joins ----

    /// Register an explicit join against a raw table or alias declaration.
    #[must_use]
    pub fn join_raw(
        mut self,
        kind: &str,
        table: impl Into<String>,
        cond: impl Into<String>,
    ) -> Self {
        self.register_join(kind, table.into(), cond.into());
        self
    }

    /// Join a declared foreign key of the main model.
    pub fn join(mut self, fk_name: &str) -> Result<Self> {
        let fk = self.model.foreign_key(fk_name).ok_or_else(|| {
            Error::construction(format!(
                "{fk_name} is not a valid foreign key name for {}",
                self.model.table_name
            ))
        })?;
        let reference_column = fk.reference_column.clone();
        let field = self.model.fields.get(fk_name).cloned().ok_or_else(|| {
            Error::construction(format!("missing foreign key field {fk_name}"))
        })?;
        let Some(fk_model) = field.fk_model(&self.model).cloned() else {
            return Err(Error::construction(format!(
                "unresolved foreign key {fk_name} on {}",
                self.model.table_name
            )));
        };
        if !self.join_keys.contains_key(fk_name) {
            let alias = format!("T{}", self.join_keys.len() + 1);
            let cond = format!(
                "{}.{fk_name} = {alias}.{reference_column}",
                self.base_alias()
            );
            self.register_join("INNER", format!("{} {alias}", fk_model.table_name), cond);
            self.join_keys.insert(fk_name.to_string(), alias.clone());
            self.alias_models.insert(alias, fk_model);
        }
        Ok(self)
    }

    // ---- insert ----

    /// Single-row insert from prepared column/value pairs.
    pub fn insert(mut self, row: &[(String, SqlValue)]) -> Result<Self> {
        let columns: Vec<&str> = row.iter().map(|(k, _)| k.as_str()).collect();
        let mut values = Vec::with_capacity(row.len());
        for (_, value) in row {
            values.push(as_literal(value)?);
        }
        self.insert = Some(format!(
            "({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ));
        Ok(self)
    }

    /// Bulk insert of rows sharing one column set.
    pub fn insert_rows(mut self, columns: &[String], rows: &[Vec<SqlValue>]) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::encoding("empty rows passed to insert"));
        }
        let values = render_value_rows(rows)?;
        self.insert = Some(format!(
            "({}) VALUES {}",
            columns.join(", "),
            values.join(", ")
        ));
        Ok(self)
    }

    /// INSERT ... FROM a sub-select, or from a writing sub-statement with
    /// RETURNING via an intermediate `D` CTE.
    pub fn insert_from(mut self, columns: &[String], sub: &Sql) -> Result<Self> {
        let columns_token = columns.join(", ");
        if sub.returning.is_some() {
            self = self.with_raw(
                format!("D({columns_token})"),
                format!("({})", sub.statement()),
            );
            self.insert = Some(format!(
                "({columns_token}) SELECT {columns_token} FROM D"
            ));
        } else {
            self.insert = Some(format!("({columns_token}) {}", sub.statement()));
        }
        Ok(self)
    }

    // ---- update ----

    /// SET from prepared column/value pairs.
    pub fn update(mut self, row: &[(String, SqlValue)]) -> Result<Self> {
        let mut pairs = Vec::with_capacity(row.len());
        for (column, value) in row {
            pairs.push(format!("{column} = {}", as_literal(value)?));
        }
        self.update = Some(pairs.join(", "));
        Ok(self)
    }

    #[must_use]
    pub fn update_raw(mut self, token: impl Into<String>) -> Self {
        self.update = Some(token.into());
        self
    }

    /// Correlated update: `(columns) = (subquery)`.
    #[must_use]
    pub fn update_from(mut self, columns: &[String], sub: &Sql) -> Self {
        self.update = Some(format!("({}) = ({})", columns.join(", "), sub.statement()));
        self
    }

    pub fn increase(self, name: &str, amount: i64) -> Result<Self> {
        let token = SqlValue::token(format!("{name} + {amount}"));
        self.update(&[(name.to_string(), token)])
    }

    pub fn decrease(self, name: &str, amount: i64) -> Result<Self> {
        let token = SqlValue::token(format!("{name} - {amount}"));
        self.update(&[(name.to_string(), token)])
    }

    /// Bulk update through a `V` VALUES CTE joined on the key columns.
    pub fn updates(
        mut self,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        key: &[String],
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::encoding("empty rows passed to updates"));
        }
        let values = self.cte_values_literal(columns, rows)?;
        let cte_name = format!("V({})", columns.join(", "));
        let cte_values = format!("(VALUES {})", values.join(", "));
        let join_cond = join_condition_from_key(key, "V", &self.base_alias());
        self = self.with_raw(cte_name, cte_values);
        self.update = Some(update_token_with_prefix(columns, key, "V"));
        self.from = Some(push_from(self.from.take(), "V"));
        self.add_where(join_cond, false);
        Ok(self)
    }

    // ---- upsert / merge / align ----

    /// INSERT ... ON CONFLICT from prepared rows. The first VALUES row casts
    /// each value to the column's declared storage type so the datastore
    /// never has to guess.
    pub fn upsert(
        mut self,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        key: &[String],
    ) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::encoding("you must provide a key for upsert"));
        }
        let values = self.cte_values_literal(columns, rows)?;
        let values_token = format!("VALUES {}", values.join(", "));
        self.insert = Some(upsert_clause(columns, &values_token, key));
        Ok(self)
    }

    /// Upsert whose rows come from a sub-select.
    pub fn upsert_from(mut self, columns: &[String], sub: &Sql, key: &[String]) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::encoding("you must provide a key for upsert"));
        }
        self.insert = Some(upsert_clause(columns, &sub.statement(), key));
        Ok(self)
    }

    /// Upsert-then-insert-missing: a `V` VALUES CTE of the desired rows, a
    /// `U` CTE updating matched rows, then an insert of the rows `U` did not
    /// touch. Targets without CTE and RETURNING support cannot run this.
    pub fn merge(
        mut self,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        key: &[String],
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::encoding("empty rows passed to merge"));
        }
        let values = self.cte_values_literal(columns, rows)?;
        let cte_name = format!("V({})", columns.join(", "));
        let cte_values = format!("(VALUES {})", values.join(", "));
        let join_cond = join_condition_from_key(key, "V", "W");
        let vals_columns: Vec<String> = columns.iter().map(|c| format!("V.{c}")).collect();
        let vals_token = vals_columns.join(", ");
        let updated = if key.len() == columns.len() || columns.len() == 1 {
            format!(
                "SELECT {vals_token} FROM V INNER JOIN {} AS W ON ({join_cond})",
                self.model.table_name
            )
        } else {
            format!(
                "UPDATE {} W SET {} FROM V WHERE {join_cond} RETURNING {vals_token}",
                self.model.table_name,
                update_token_with_prefix(columns, key, "V")
            )
        };
        let insert_select = format!(
            "SELECT {vals_token} FROM V LEFT JOIN U AS W ON ({join_cond}) WHERE W.{} IS NULL",
            key[0]
        );
        self = self
            .with_raw(cte_name, cte_values)
            .with_raw("U", format!("({updated})"));
        self.insert = Some(format!("({}) {insert_select}", columns.join(", ")));
        Ok(self)
    }

    /// Upsert the given rows and delete every other row in scope: the upsert
    /// runs in a `U` CTE returning the key, then the main statement deletes
    /// rows whose key `U` did not return. Any prior WHERE narrows the delete.
    pub fn align(
        mut self,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        key: &[String],
    ) -> Result<Self> {
        let values = self.cte_values_literal(columns, rows)?;
        let values_token = format!("VALUES {}", values.join(", "));
        let upsert_statement = format!(
            "INSERT INTO {} {} RETURNING {}",
            self.model.table_name,
            upsert_clause(columns, &values_token, key),
            key.join(", ")
        );
        self = self.with_raw("U", format!("({upsert_statement})"));
        let mut qualified = Vec::with_capacity(key.len());
        for k in key {
            qualified.push(self.column_of(k)?);
        }
        let sub = format!("SELECT {} FROM U", key.join(", "));
        self.add_where_tail(format!("({}) NOT IN ({sub})", qualified.join(", ")));
        self.delete = true;
        Ok(self)
    }

    // ---- delete / returning ----

    #[must_use]
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn returning(mut self, names: &[&str]) -> Result<Self> {
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            tokens.push(self.column_of(name)?);
        }
        let s = tokens.join(", ");
        self.returning = Some(match self.returning.take() {
            None => s,
            Some(prev) => format!("{prev}, {s}"),
        });
        Ok(self)
    }

    #[must_use]
    pub fn returning_raw(mut self, fragment: impl Into<String>) -> Self {
        let token = fragment.into();
        self.returning = Some(match self.returning.take() {
            None => token,
            Some(prev) => format!("{prev}, {token}"),
        });
        self
    }

    // ---- batch select helpers ----

    /// Select rows matching a batch of keys through a `V` VALUES CTE right
    /// joined onto the table.
    pub fn get_multiple(mut self, columns: &[String], keys: &[Vec<SqlValue>]) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::encoding("empty keys passed to get_multiple"));
        }
        let values = self.cte_values_literal(columns, keys)?;
        let cte_name = format!("V({})", columns.join(", "));
        let cte_values = format!("(VALUES {})", values.join(", "));
        let join_cond = join_condition_from_key(columns, "V", &self.base_alias());
        self = self.with_raw(cte_name, cte_values);
        self.register_join("RIGHT", "V".to_string(), join_cond);
        Ok(self)
    }

    /// Restrict the statement to the foreign-key closure seeded by
    /// `fk_name = value`, via a recursive CTE aliased back to the table name
    /// so every other clause keeps working unchanged.
    pub fn where_recursive(
        mut self,
        fk_name: &str,
        value: &Value,
        select_names: &[&str],
    ) -> Result<Self> {
        let fk = self.model.foreign_key(fk_name).ok_or_else(|| {
            Error::construction(format!(
                "{fk_name} is not a valid foreign key name for {}",
                self.model.table_name
            ))
        })?;
        let reference_column = fk.reference_column.clone();
        let table_name = self.model.table_name.clone();
        let t_alias = format!("{table_name}_recursive");
        let mut seed_cond = Map::new();
        seed_cond.insert(fk_name.to_string(), value.clone());
        let mut seed = Sql::new(Arc::clone(&self.model))
            .select(&[reference_column.as_str(), fk_name])?
            .where_map(&seed_cond)?;
        let join_cond = format!("{table_name}.{fk_name} = {t_alias}.{reference_column}");
        let mut recursive = Sql::new(Arc::clone(&self.model))
            .select(&[reference_column.as_str(), fk_name])?
            .join_raw("INNER", t_alias.clone(), join_cond);
        if !select_names.is_empty() {
            seed = seed.select(select_names)?;
            recursive = recursive.select(select_names)?;
        }
        let combined = seed.union_all(&recursive);
        let with_token = format!("{t_alias} AS ({})", combined.statement());
        self.with_recursive = Some(match self.with_recursive.take() {
            None => with_token,
            Some(prev) => format!("{prev}, {with_token}"),
        });
        self.from = Some(format!("{t_alias} AS {table_name}"));
        Ok(self)
    }

    // ---- CTE / set operations / chaining ----

    /// Attach a WITH clause from a pre-rendered body, which must carry its
    /// own parentheses.
    #[must_use]
    pub fn with_raw(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        let token = format!("{} AS {}", name.into(), body.into());
        self.with = Some(match self.with.take() {
            None => token,
            Some(prev) => format!("{prev}, {token}"),
        });
        self
    }

    #[must_use]
    pub fn with_sql(self, name: impl Into<String>, sub: &Sql) -> Self {
        self.with_raw(name, format!("({})", sub.statement()))
    }

    #[must_use]
    pub fn union(mut self, other: &Sql) -> Self {
        self.set_ops.push((SetOp::Union, other.statement()));
        self
    }

    #[must_use]
    pub fn union_all(mut self, other: &Sql) -> Self {
        self.set_ops.push((SetOp::UnionAll, other.statement()));
        self
    }

    #[must_use]
    pub fn except(mut self, other: &Sql) -> Self {
        self.set_ops.push((SetOp::Except, other.statement()));
        self
    }

    #[must_use]
    pub fn intersect(mut self, other: &Sql) -> Self {
        self.set_ops.push((SetOp::Intersect, other.statement()));
        self
    }

    /// Run an extra statement before the main one in the same round trip.
    #[must_use]
    pub fn prepend(mut self, statement: impl Into<String>) -> Self {
        self.prepends.push(statement.into());
        self
    }

    /// Run an extra statement after the main one in the same round trip.
    #[must_use]
    pub fn append(mut self, statement: impl Into<String>) -> Self {
        self.appends.push(statement.into());
        self
    }

    // ---- rendering ----

    /// First-row values cast to each column's declared storage type, the
    /// rest as plain literal rows. Errors on columns the model does not
    /// declare.
    fn cte_values_literal(
        &self,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<Vec<String>> {
        let first = rows
            .first()
            .ok_or_else(|| Error::encoding("empty rows for values literal"))?;
        let mut first_tokens = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let field = self.model.fields.get(column).ok_or_else(|| {
                Error::construction(format!("invalid field name: {column}"))
            })?;
            let value = first
                .get(i)
                .ok_or_else(|| Error::encoding(format!("row too short for column {column}")))?;
            first_tokens.push(format!("{}::{}", as_literal(value)?, field.db_type));
        }
        let mut out = Vec::with_capacity(rows.len());
        out.push(format!("({})", first_tokens.join(", ")));
        for row in &rows[1..] {
            out.push(as_literal(&SqlValue::List(row.clone()))?);
        }
        Ok(out)
    }

    fn main_table(&self, insert_style: bool) -> String {
        match &self.table_alias {
            Some(alias) if insert_style => format!("{} AS {alias}", self.model.table_name),
            Some(alias) => format!("{} {alias}", self.model.table_name),
            None => self.model.table_name.clone(),
        }
    }

    /// FROM/USING and WHERE for UPDATE and DELETE: the first registered join
    /// folds into the extra-table list plus the condition, the rest render
    /// as JOIN clauses.
    fn write_join_clauses(&self, extra: Option<&String>) -> (Option<String>, Option<String>) {
        let mut froms: Vec<String> = extra.cloned().into_iter().collect();
        let mut wheres: Vec<String> = self.where_clause.clone().into_iter().collect();
        for (i, join) in self.join_args.iter().enumerate() {
            if i == 0 {
                froms.push(join.table.clone());
                wheres.push(join.cond.clone());
            } else {
                froms.push(format!("{} JOIN {} ON ({})", join.kind, join.table, join.cond));
            }
        }
        let from = if froms.is_empty() {
            None
        } else {
            Some(froms.join(" "))
        };
        let where_clause = match wheres.len() {
            0 => None,
            1 => Some(wheres.remove(0)),
            _ => Some(format!("({})", wheres.join(") AND ("))),
        };
        (from, where_clause)
    }

    fn assemble(&self) -> String {
        let returning = self
            .returning
            .as_ref()
            .map(|r| format!(" RETURNING {r}"))
            .unwrap_or_default();
        let statement = if let Some(update) = &self.update {
            let (from, where_clause) = self.write_join_clauses(self.from.as_ref());
            format!(
                "UPDATE {} SET {update}{}{}{returning}",
                self.main_table(false),
                from.map(|f| format!(" FROM {f}")).unwrap_or_default(),
                where_clause
                    .map(|w| format!(" WHERE {w}"))
                    .unwrap_or_default(),
            )
        } else if let Some(insert) = &self.insert {
            format!("INSERT INTO {} {insert}{returning}", self.main_table(true))
        } else if self.delete {
            let (using, where_clause) = self.write_join_clauses(self.using.as_ref());
            format!(
                "DELETE FROM {}{}{}{returning}",
                self.main_table(false),
                using.map(|u| format!(" USING {u}")).unwrap_or_default(),
                where_clause
                    .map(|w| format!(" WHERE {w}"))
                    .unwrap_or_default(),
            )
        } else {
            let mut from = self
                .from
                .clone()
                .unwrap_or_else(|| self.main_table(false));
            for join in &self.join_args {
                from.push_str(&format!(
                    " {} JOIN {} ON ({})",
                    join.kind, join.table, join.cond
                ));
            }
            let distinct = if self.distinct {
                "DISTINCT ".to_string()
            } else if let Some(on) = &self.distinct_on {
                format!("DISTINCT ON({on}) ")
            } else {
                String::new()
            };
            format!(
                "SELECT {distinct}{} FROM {from}{}{}{}{}{}{}",
                self.select.as_deref().unwrap_or("*"),
                self.where_clause
                    .as_ref()
                    .map(|w| format!(" WHERE {w}"))
                    .unwrap_or_default(),
                self.group
                    .as_ref()
                    .map(|g| format!(" GROUP BY {g}"))
                    .unwrap_or_default(),
                self.having
                    .as_ref()
                    .map(|h| format!(" HAVING {h}"))
                    .unwrap_or_default(),
                self.order
                    .as_ref()
                    .map(|o| format!(" ORDER BY {o}"))
                    .unwrap_or_default(),
                self.limit
                    .map(|n| format!(" LIMIT {n}"))
                    .unwrap_or_default(),
                self.offset
                    .map(|n| format!(" OFFSET {n}"))
                    .unwrap_or_default(),
            )
        };
        if let Some(with) = &self.with {
            format!("WITH {with} {statement}")
        } else if let Some(with) = &self.with_recursive {
            format!("WITH RECURSIVE {with} {statement}")
        } else {
            statement
        }
    }

    /// Render the final statement text, including set operations and any
    /// chained prepend/append statements joined with `;`.
    #[must_use]
    pub fn statement(&self) -> String {
        let mut statement = self.assemble();
        for (op, other) in &self.set_ops {
            statement = match op {
                SetOp::UnionAll => format!("{statement} UNION ALL ({other})"),
                _ => format!("({statement}) {} ({other})", op.keyword()),
            };
        }
        if !self.prepends.is_empty() {
            statement = format!("{};{statement}", self.prepends.join(";"));
        }
        if !self.appends.is_empty() {
            statement = format!("{statement};{}", self.appends.join(";"));
        }
        tracing::trace!(table = %self.model.table_name, %statement, "rendered");
        statement
    }
}

fn push_from(prev: Option<String>, token: &str) -> String {
    match prev {
        None => token.to_string(),
        Some(prev) => format!("{prev}, {token}"),
    }
}

fn join_condition_from_key(key: &[String], left: &str, right: &str) -> String {
    key.iter()
        .map(|k| format!("{left}.{k} = {right}.{k}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `col = PREFIX.col` for every non-key column.
fn update_token_with_prefix(columns: &[String], key: &[String], prefix: &str) -> String {
    columns
        .iter()
        .filter(|c| !key.contains(c))
        .map(|c| format!("{c} = {prefix}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// ON CONFLICT tail: DO NOTHING when the key covers every column, otherwise
/// DO UPDATE SET from EXCLUDED, with the key columns left out of SET.
fn upsert_clause(columns: &[String], values_token: &str, key: &[String]) -> String {
    let base = format!(
        "({}) {values_token} ON CONFLICT ({})",
        columns.join(", "),
        key.join(", ")
    );
    if key.len() == columns.len() || columns.len() == 1 {
        format!("{base} DO NOTHING")
    } else {
        format!(
            "{base} DO UPDATE SET {}",
            update_token_with_prefix(columns, key, "EXCLUDED")
        )
    }
}

fn render_value_rows(rows: &[Vec<SqlValue>]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(as_literal(&SqlValue::List(row.clone()))?);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xodel_core::{Field, ModelSpec};

    fn author_model() -> Arc<Model> {
        ModelSpec::new("author")
            .field(Field::string("name").required())
            .field(Field::integer("age"))
            .materialize()
            .unwrap()
    }

    fn blog_model() -> Arc<Model> {
        ModelSpec::new("blog")
            .field(Field::string("title").required())
            .field(Field::foreign_key("author", author_model()).unwrap())
            .materialize()
            .unwrap()
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // ---- select and where ----

    #[test]
    fn test_plain_select() {
        let sql = Sql::new(author_model())
            .select(&["name", "age"])
            .unwrap();
        assert_eq!(sql.statement(), "SELECT author.name, author.age FROM author");
    }

    #[test]
    fn test_select_star_by_default() {
        assert_eq!(Sql::new(author_model()).statement(), "SELECT * FROM author");
    }

    #[test]
    fn test_where_map() {
        let sql = Sql::new(author_model())
            .where_map(&kwargs(json!({"name": "tom", "age__gt": 3})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE author.name = 'tom' AND author.age > 3"
        );
    }

    #[test]
    fn test_where_chaining_wraps_previous_condition() {
        let sql = Sql::new(author_model())
            .where_map(&kwargs(json!({"age": 1})))
            .unwrap()
            .where_map(&kwargs(json!({"name": "a"})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE (author.age = 1) AND (author.name = 'a')"
        );
    }

    #[test]
    fn test_or_where_map() {
        let sql = Sql::new(author_model())
            .where_map(&kwargs(json!({"age": 1})))
            .unwrap()
            .or_where_map(&kwargs(json!({"age": 2})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE author.age = 1 OR author.age = 2"
        );
    }

    #[test]
    fn test_where_exp_priority_parentheses() {
        let sql = Sql::new(author_model())
            .where_exp(&json!(["and", {"age__gt": 1}, ["or", {"name": "a"}, {"name": "b"}]]))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE author.age > 1 AND (author.name = 'a' OR author.name = 'b')"
        );
    }

    #[test]
    fn test_where_exp_not_renders_and_not() {
        let sql = Sql::new(author_model())
            .where_exp(&json!(["not", {"age": 1}, {"name": "a"}]))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE NOT author.age = 1 AND NOT author.name = 'a'"
        );
    }

    #[test]
    fn test_order_and_paging() {
        let sql = Sql::new(author_model())
            .order(&["-age", "name"])
            .unwrap()
            .limit(10)
            .offset(5);
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author ORDER BY author.age DESC, author.name ASC LIMIT 10 OFFSET 5"
        );
    }

    #[test]
    fn test_distinct_on_orders_by_the_same_columns() {
        let sql = Sql::new(author_model()).distinct_on(&["name"]).unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT DISTINCT ON(author.name) * FROM author ORDER BY author.name"
        );
    }

    #[test]
    fn test_group_and_having() {
        let sql = Sql::new(author_model())
            .select(&["name"])
            .unwrap()
            .select_raw("count(*)")
            .group(&["name"])
            .unwrap()
            .having("count(*) > 1");
        assert_eq!(
            sql.statement(),
            "SELECT author.name, count(*) FROM author GROUP BY author.name HAVING count(*) > 1"
        );
    }

    // ---- dotted-path joins ----

    #[test]
    fn test_foreign_key_path_registers_inner_join() {
        let sql = Sql::new(blog_model())
            .where_map(&kwargs(json!({"author__name__contains": "tom"})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM blog INNER JOIN author T1 ON (blog.author = T1.id) \
             WHERE T1.name LIKE '%tom%'"
        );
    }

    #[test]
    fn test_repeated_path_joins_once() {
        let sql = Sql::new(blog_model())
            .where_map(&kwargs(json!({"author__name": "tom", "author__age__gt": 9})))
            .unwrap();
        let statement = sql.statement();
        assert_eq!(statement.matches("JOIN author").count(), 1);
        assert!(statement.contains("T1.name = 'tom'"));
        assert!(statement.contains("T1.age > 9"));
    }

    #[test]
    fn test_reference_column_suffix_needs_no_join() {
        let sql = Sql::new(blog_model())
            .where_map(&kwargs(json!({"author__id": 3})))
            .unwrap();
        assert_eq!(sql.statement(), "SELECT * FROM blog WHERE blog.author = 3");
    }

    #[test]
    fn test_foreign_key_select_aliases_with_path() {
        let sql = Sql::new(blog_model()).select(&["title", "author__name"]).unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT blog.title, T1.name AS author__name FROM blog \
             INNER JOIN author T1 ON (blog.author = T1.id)"
        );
    }

    #[test]
    fn test_non_text_fk_column_casts_for_substring_ops() {
        let sql = Sql::new(blog_model())
            .where_map(&kwargs(json!({"author__contains": "1"})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM blog WHERE blog.author::varchar LIKE '%1%'"
        );
    }

    // ---- writes ----

    #[test]
    fn test_insert_single_row() {
        let sql = Sql::new(author_model())
            .insert(&[
                ("name".to_string(), SqlValue::from("tom")),
                ("age".to_string(), SqlValue::Int(5)),
            ])
            .unwrap();
        assert_eq!(
            sql.statement(),
            "INSERT INTO author (name, age) VALUES ('tom', 5)"
        );
    }

    #[test]
    fn test_insert_rows_shares_columns() {
        let sql = Sql::new(author_model())
            .insert_rows(
                &["name".to_string(), "age".to_string()],
                &[
                    vec![SqlValue::from("a"), SqlValue::Int(1)],
                    vec![SqlValue::from("b"), SqlValue::Default],
                ],
            )
            .unwrap();
        assert_eq!(
            sql.statement(),
            "INSERT INTO author (name, age) VALUES ('a', 1), ('b', DEFAULT)"
        );
    }

    #[test]
    fn test_insert_from_returning_subquery_uses_cte() {
        let columns = vec!["name".to_string(), "age".to_string()];
        let sub = Sql::new(author_model())
            .update(&[("age".to_string(), SqlValue::Int(1))])
            .unwrap()
            .returning(&["name", "age"])
            .unwrap();
        let sql = Sql::new(author_model()).insert_from(&columns, &sub).unwrap();
        assert_eq!(
            sql.statement(),
            "WITH D(name, age) AS (UPDATE author SET age = 1 RETURNING author.name, author.age) \
             INSERT INTO author (name, age) SELECT name, age FROM D"
        );
    }

    #[test]
    fn test_update_with_where_and_returning() {
        let sql = Sql::new(author_model())
            .update(&[("age".to_string(), SqlValue::Int(2))])
            .unwrap()
            .where_map(&kwargs(json!({"name": "tom"})))
            .unwrap()
            .returning(&["id"])
            .unwrap();
        assert_eq!(
            sql.statement(),
            "UPDATE author SET age = 2 WHERE author.name = 'tom' RETURNING author.id"
        );
    }

    #[test]
    fn test_increase_renders_raw_arithmetic() {
        let sql = Sql::new(author_model()).increase("age", 2).unwrap();
        assert_eq!(sql.statement(), "UPDATE author SET age = age + 2");
    }

    #[test]
    fn test_correlated_update_from_subquery() {
        let sub = Sql::new(author_model()).select(&["age"]).unwrap().limit(1);
        let sql = Sql::new(author_model()).update_from(&["age".to_string()], &sub);
        assert_eq!(
            sql.statement(),
            "UPDATE author SET (age) = (SELECT author.age FROM author LIMIT 1)"
        );
    }

    #[test]
    fn test_delete_with_condition() {
        let sql = Sql::new(author_model())
            .where_map(&kwargs(json!({"age": 1})))
            .unwrap()
            .delete();
        assert_eq!(sql.statement(), "DELETE FROM author WHERE author.age = 1");
    }

    // ---- upsert / bulk ----

    #[test]
    fn test_upsert_excludes_key_from_set() {
        let sql = Sql::new(author_model())
            .upsert(
                &["name".to_string(), "age".to_string()],
                &[vec![SqlValue::from("a"), SqlValue::Int(1)]],
                &["name".to_string()],
            )
            .unwrap();
        assert_eq!(
            sql.statement(),
            "INSERT INTO author (name, age) VALUES ('a'::varchar(256), 1::integer) \
             ON CONFLICT (name) DO UPDATE SET age = EXCLUDED.age"
        );
    }

    #[test]
    fn test_upsert_key_covering_all_columns_does_nothing() {
        let sql = Sql::new(author_model())
            .upsert(
                &["name".to_string()],
                &[vec![SqlValue::from("a")]],
                &["name".to_string()],
            )
            .unwrap();
        assert_eq!(
            sql.statement(),
            "INSERT INTO author (name) VALUES ('a'::varchar(256)) ON CONFLICT (name) DO NOTHING"
        );
    }

    #[test]
    fn test_bulk_upsert_casts_first_row_only() {
        let sql = Sql::new(author_model())
            .upsert(
                &["name".to_string(), "age".to_string()],
                &[
                    vec![SqlValue::from("a"), SqlValue::Int(1)],
                    vec![SqlValue::from("b"), SqlValue::Int(2)],
                ],
                &["name".to_string()],
            )
            .unwrap();
        let statement = sql.statement();
        assert!(statement.contains("VALUES ('a'::varchar(256), 1::integer), ('b', 2)"));
    }

    #[test]
    fn test_updates_builds_values_cte() {
        let sql = Sql::new(author_model())
            .updates(
                &["id".to_string(), "age".to_string()],
                &[vec![SqlValue::Int(1), SqlValue::Int(10)]],
                &["id".to_string()],
            )
            .unwrap();
        assert_eq!(
            sql.statement(),
            "WITH V(id, age) AS (VALUES (1::integer, 10::integer)) \
             UPDATE author SET age = V.age FROM V WHERE V.id = author.id"
        );
    }

    #[test]
    fn test_merge_inserts_rows_the_update_missed() {
        let sql = Sql::new(author_model())
            .merge(
                &["name".to_string(), "age".to_string()],
                &[vec![SqlValue::from("a"), SqlValue::Int(1)]],
                &["name".to_string()],
            )
            .unwrap();
        let statement = sql.statement();
        assert!(statement.starts_with("WITH V(name, age) AS (VALUES ('a'::varchar(256), 1::integer)), U AS ("));
        assert!(statement.contains("UPDATE author W SET age = V.age FROM V WHERE V.name = W.name RETURNING V.name, V.age"));
        assert!(statement.contains(
            "INSERT INTO author (name, age) SELECT V.name, V.age FROM V \
             LEFT JOIN U AS W ON (V.name = W.name) WHERE W.name IS NULL"
        ));
    }

    #[test]
    fn test_merge_with_key_covering_columns_selects_matches() {
        let sql = Sql::new(author_model())
            .merge(
                &["name".to_string()],
                &[vec![SqlValue::from("a")]],
                &["name".to_string()],
            )
            .unwrap();
        assert!(sql
            .statement()
            .contains("U AS (SELECT V.name FROM V INNER JOIN author AS W ON (V.name = W.name))"));
    }

    #[test]
    fn test_align_deletes_rows_missing_from_input() {
        let sql = Sql::new(author_model())
            .align(
                &["name".to_string(), "age".to_string()],
                &[vec![SqlValue::from("a"), SqlValue::Int(1)]],
                &["name".to_string()],
            )
            .unwrap();
        assert_eq!(
            sql.statement(),
            "WITH U AS (INSERT INTO author (name, age) \
             VALUES ('a'::varchar(256), 1::integer) ON CONFLICT (name) \
             DO UPDATE SET age = EXCLUDED.age RETURNING name) \
             DELETE FROM author WHERE (author.name) NOT IN (SELECT name FROM U)"
        );
    }

    #[test]
    fn test_align_scopes_delete_by_prior_where() {
        let sql = Sql::new(author_model())
            .where_map(&kwargs(json!({"age": 9})))
            .unwrap()
            .align(
                &["name".to_string()],
                &[vec![SqlValue::from("a")]],
                &["name".to_string()],
            )
            .unwrap();
        assert!(sql
            .statement()
            .contains("WHERE (author.age = 9) AND (author.name) NOT IN (SELECT name FROM U)"));
    }

    // ---- batch select / recursion / set ops ----

    #[test]
    fn test_get_multiple_right_joins_values_cte() {
        let sql = Sql::new(author_model())
            .get_multiple(&["name".to_string()], &[vec![SqlValue::from("a")]])
            .unwrap()
            .select(&["name", "age"])
            .unwrap();
        assert_eq!(
            sql.statement(),
            "WITH V(name) AS (VALUES ('a'::varchar(256))) \
             SELECT author.name, author.age FROM author RIGHT JOIN V ON (V.name = author.name)"
        );
    }

    #[test]
    fn test_where_recursive_builds_recursive_cte() {
        let tree = ModelSpec::new("dept")
            .field(Field::string("name").required())
            .field(Field::foreign_key_self("parent", "id"))
            .materialize()
            .unwrap();
        let sql = Sql::new(tree).where_recursive("parent", &json!(1), &[]).unwrap();
        assert_eq!(
            sql.statement(),
            "WITH RECURSIVE dept_recursive AS (\
             SELECT dept.id, dept.parent FROM dept WHERE dept.parent = 1 \
             UNION ALL (SELECT dept.id, dept.parent FROM dept \
             INNER JOIN dept_recursive ON (dept.parent = dept_recursive.id))) \
             SELECT * FROM dept_recursive AS dept"
        );
    }

    #[test]
    fn test_union_parenthesizes_both_sides() {
        let a = Sql::new(author_model()).select(&["name"]).unwrap();
        let b = Sql::new(author_model()).select(&["name"]).unwrap();
        assert_eq!(
            a.union(&b).statement(),
            "(SELECT author.name FROM author) UNION (SELECT author.name FROM author)"
        );
    }

    #[test]
    fn test_prepend_and_append_chain_statements() {
        let sql = Sql::new(author_model())
            .prepend("SELECT 1")
            .append("SELECT 2");
        assert_eq!(sql.statement(), "SELECT 1;SELECT * FROM author;SELECT 2");
    }

    #[test]
    fn test_where_in_subquery() {
        let sub = Sql::new(author_model()).select(&["id"]).unwrap();
        let sql = Sql::new(author_model()).where_in(&["id"], &sub).unwrap();
        assert_eq!(
            sql.statement(),
            "SELECT * FROM author WHERE (author.id) IN (SELECT author.id FROM author)"
        );
    }

    #[test]
    fn test_invalid_field_name_fails() {
        assert!(Sql::new(author_model()).select(&["nope"]).is_err());
        assert!(Sql::new(author_model())
            .where_map(&kwargs(json!({"nope": 1})))
            .is_err());
    }

    #[test]
    fn test_update_folds_first_join_into_from() {
        let sql = Sql::new(blog_model())
            .update(&[("title".to_string(), SqlValue::from("x"))])
            .unwrap()
            .where_map(&kwargs(json!({"author__name": "tom"})))
            .unwrap();
        assert_eq!(
            sql.statement(),
            "UPDATE blog SET title = 'x' FROM author T1 \
             WHERE (T1.name = 'tom') AND (blog.author = T1.id)"
        );
    }
}
