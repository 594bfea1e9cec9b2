//! Model-level lifecycle operations.
//!
//! [`ModelOps`] pairs one model with an injected [`Queryer`] and forwards
//! to statement builders, running the full pipeline for every write:
//! validate, prepare for storage, render, execute, load results back.

use std::sync::Arc;

use serde_json::{Map, Value};
use xodel_core::{Error, FieldKind, Model, Queryer, Result, Row, SqlValue};
use xodel_query::Sql;

use crate::record::Record;

/// The operations facade for one model.
#[derive(Clone)]
pub struct ModelOps {
    model: Arc<Model>,
    queryer: Arc<dyn Queryer>,
}

impl ModelOps {
    #[must_use]
    pub fn new(model: Arc<Model>, queryer: Arc<dyn Queryer>) -> Self {
        Self { model, queryer }
    }

    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// A fresh statement builder bound to this model.
    #[must_use]
    pub fn sql(&self) -> Sql {
        Sql::new(Arc::clone(&self.model))
    }

    // ---- execution ----

    /// Render and execute, returning raw collaborator rows.
    pub fn exec_raw(&self, sql: &Sql) -> Result<Vec<Row>> {
        let statement = sql.statement();
        tracing::debug!(table = %self.model.table_name, %statement, "executing");
        self.queryer.execute(&statement, sql.is_compact())
    }

    fn exec_keyed(&self, sql: &Sql) -> Result<Vec<Map<String, Value>>> {
        self.exec_raw(sql)?
            .into_iter()
            .map(Row::into_keyed)
            .collect()
    }

    /// Execute a select and load each row into a record.
    pub fn exec(&self, sql: &Sql) -> Result<Vec<Record>> {
        Ok(self
            .exec_keyed(sql)?
            .into_iter()
            .map(|row| Record::load(Arc::clone(&self.model), row))
            .collect())
    }

    // ---- reads ----

    pub fn filter(&self, kwargs: &Map<String, Value>) -> Result<Vec<Record>> {
        let sql = self.sql().where_map(kwargs)?;
        self.exec(&sql)
    }

    /// Exactly one matching row, or a failure either way.
    pub fn get(&self, kwargs: &Map<String, Value>) -> Result<Record> {
        let mut rows = self.probe(kwargs)?;
        match rows.len() {
            1 => Ok(Record::load(
                Arc::clone(&self.model),
                rows.remove(0),
            )),
            0 => Err(Error::NotFound("record not found".to_string())),
            n => Err(Error::Integrity(format!("{n} records returned"))),
        }
    }

    /// Zero-or-one probe: the record when exactly one row matches, `None`
    /// otherwise.
    pub fn try_get(&self, kwargs: &Map<String, Value>) -> Result<Option<Record>> {
        let mut rows = self.probe(kwargs)?;
        if rows.len() == 1 {
            Ok(Some(Record::load(Arc::clone(&self.model), rows.remove(0))))
        } else {
            Ok(None)
        }
    }

    /// LIMIT 2 is enough to tell "one" from "zero" and "many".
    fn probe(&self, kwargs: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
        if kwargs.is_empty() {
            return Err(Error::construction("empty condition table is not allowed"));
        }
        let sql = self.sql().where_map(kwargs)?.limit(2);
        self.exec_keyed(&sql)
    }

    pub fn count(&self, kwargs: Option<&Map<String, Value>>) -> Result<i64> {
        let mut sql = self.sql().select_raw("count(*)").compact();
        if let Some(kwargs) = kwargs {
            sql = sql.where_map(kwargs)?;
        }
        let rows = self.exec_raw(&sql)?;
        match rows.into_iter().next() {
            Some(Row::Compact(values)) => Ok(values
                .first()
                .and_then(Value::as_i64)
                .unwrap_or_default()),
            Some(Row::Keyed(_)) | None => Ok(0),
        }
    }

    pub fn exists(&self, kwargs: Option<&Map<String, Value>>) -> Result<bool> {
        let mut inner = self.sql().select_literal(&SqlValue::Int(1))?.limit(1);
        if let Some(kwargs) = kwargs {
            inner = inner.where_map(kwargs)?;
        }
        let statement = format!("SELECT EXISTS ({})", inner.statement());
        tracing::debug!(table = %self.model.table_name, %statement, "executing");
        let rows = self.queryer.execute(&statement, true)?;
        match rows.into_iter().next() {
            Some(Row::Compact(values)) => {
                Ok(values.first().and_then(Value::as_bool).unwrap_or(false))
            }
            Some(Row::Keyed(row)) => Ok(row
                .values()
                .next()
                .and_then(Value::as_bool)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Batch lookup by key rows, through the builder's `V` CTE right join.
    pub fn get_multiple(
        &self,
        keys: &[Map<String, Value>],
        columns: &[String],
    ) -> Result<Vec<Record>> {
        let rows = self.encode_rows(keys, columns)?;
        let sql = self.sql().get_multiple(columns, &rows)?;
        self.exec(&sql)
    }

    // ---- create / save ----

    pub fn create(&self, input: &Map<String, Value>) -> Result<Record> {
        self.save_create(input, None)
    }

    /// Insert or update by presence of the key value in the input.
    pub fn save(&self, input: &Map<String, Value>, key: Option<&str>) -> Result<Record> {
        let unique = self.unique_key(key)?;
        let has_key = input
            .get(&unique)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""));
        if has_key {
            self.save_update(input, None, key)
        } else {
            self.save_create(input, None)
        }
    }

    /// Validate, insert, and merge generated columns back into the row.
    pub fn save_create(
        &self,
        input: &Map<String, Value>,
        columns: Option<&[String]>,
    ) -> Result<Record> {
        let mut data = self.model.validate_create(input)?;
        let prepared = self.model.prepare_for_db(&data, columns, false)?;
        let sql = self.sql().insert(&prepared)?.returning_raw("*");
        let rows = self.exec_keyed(&sql)?;
        let created = rows.into_iter().next().ok_or_else(|| {
            Error::Integrity(format!("insert into {} returned no rows", self.model.table_name))
        })?;
        for (column, value) in created {
            data.insert(column, value);
        }
        Ok(Record::load(Arc::clone(&self.model), data))
    }

    /// Validate and update the row matched by its key value. Zero matched
    /// rows is a not-found failure, more than one an integrity failure.
    pub fn save_update(
        &self,
        input: &Map<String, Value>,
        columns: Option<&[String]>,
        key: Option<&str>,
    ) -> Result<Record> {
        let mut data = self.model.validate_update(input)?;
        let key = self.unique_key(key)?;
        let look_value = input
            .get(&key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::construction("no primary or unique key value for save_update")
            })?;
        let prepared = self.model.prepare_for_db(&data, columns, true)?;
        let mut cond = Map::new();
        cond.insert(key.clone(), look_value.clone());
        let sql = self
            .sql()
            .update(&prepared)?
            .where_map(&cond)?
            .returning(&[key.as_str()])?;
        let mut rows = self.exec_keyed(&sql)?;
        match rows.len() {
            1 => {
                let row = rows.remove(0);
                if let Some(value) = row.get(&key) {
                    data.insert(key, value.clone());
                }
                Ok(Record::new(Arc::clone(&self.model), data))
            }
            0 => Err(Error::NotFound(format!(
                "update failed, record does not exist (model: {}, key: {key}, value: {look_value})",
                self.model.table_name
            ))),
            n => Err(Error::Integrity(format!(
                "expected 1 but {n} records were updated (model: {}, key: {key}, value: {look_value})",
                self.model.table_name
            ))),
        }
    }

    /// Update a parent row and align its nested table-field rows in the
    /// same statement group: present nested rows are upserted, absent ones
    /// deleted, all scoped by the cascade column.
    pub fn save_cascade_update(
        &self,
        input: &Map<String, Value>,
        key: Option<&str>,
    ) -> Result<Record> {
        let mut data = self.model.validate_update(input)?;
        let key = self.unique_key(key)?;
        let look_value = input
            .get(&key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::construction("no primary or unique key value for save_update")
            })?;
        let cascades = self.collect_cascades(&mut data, input)?;
        let scalar_columns: Vec<String> = self
            .model
            .names
            .iter()
            .filter(|name| {
                data.contains_key(*name)
                    && self
                        .model
                        .fields
                        .get(*name)
                        .is_some_and(|f| !matches!(f.kind, FieldKind::Table(_)))
            })
            .cloned()
            .collect();
        let prepared = self
            .model
            .prepare_for_db(&data, Some(&scalar_columns), true)?;
        let mut cond = Map::new();
        cond.insert(key.clone(), look_value.clone());
        // A nested-rows-only input has nothing to SET; probe the parent row
        // by key instead so the existence checks still run.
        let mut sql = if prepared.is_empty() {
            self.sql().select(&[key.as_str()])?.where_map(&cond)?
        } else {
            self.sql()
                .update(&prepared)?
                .where_map(&cond)?
                .returning(&[key.as_str()])?
        };
        for cascade in &cascades {
            sql = sql.prepend(cascade.clone());
        }
        let rows = self.exec_keyed(&sql)?;
        match rows.len() {
            1 => Ok(Record::new(Arc::clone(&self.model), data)),
            0 => Err(Error::NotFound(format!(
                "update failed, record does not exist (model: {}, key: {key}, value: {look_value})",
                self.model.table_name
            ))),
            n => Err(Error::Integrity(format!(
                "expected 1 but {n} records were updated (model: {}, key: {key}, value: {look_value})",
                self.model.table_name
            ))),
        }
    }

    /// Stamp each nested row with the cascade foreign key, then render one
    /// alignment (or scoped delete) statement per table field.
    fn collect_cascades(
        &self,
        data: &mut Map<String, Value>,
        input: &Map<String, Value>,
    ) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for name in &self.model.names {
            let Some(field) = self.model.fields.get(name) else {
                continue;
            };
            let FieldKind::Table(table) = &field.kind else {
                continue;
            };
            let (fk_name, reference_column) = cascade_field(&self.model, table)?;
            let parent_value = input.get(&reference_column).cloned().ok_or_else(|| {
                Error::construction(format!(
                    "missing cascade reference value {reference_column} for {name}"
                ))
            })?;
            let nested_rows: Vec<Map<String, Value>> = match data.get_mut(name) {
                Some(Value::Array(rows)) => {
                    for row in rows.iter_mut() {
                        if let Value::Object(row) = row {
                            row.insert(fk_name.clone(), parent_value.clone());
                        }
                    }
                    rows.iter()
                        .filter_map(|r| r.as_object().cloned())
                        .collect()
                }
                _ => Vec::new(),
            };
            let mut scope = Map::new();
            scope.insert(fk_name.clone(), parent_value);
            let nested = Sql::new(Arc::clone(&table.model)).where_map(&scope)?;
            if nested_rows.is_empty() {
                statements.push(nested.delete().statement());
            } else {
                let columns = bulk_columns(&table.model, &nested_rows, None)?;
                let align_key = bulk_key(&table.model, &columns)?;
                let prepared = prepare_rows(&table.model, &nested_rows, &columns, false)?;
                statements.push(nested.align(&columns, &prepared, &align_key)?.statement());
            }
        }
        Ok(statements)
    }

    /// Insert-or-select in one statement: a conditional-insert CTE unioned
    /// with the fallback select, each side tagged with a synthetic inserted
    /// flag that is stripped before the record is returned.
    pub fn get_or_create(
        &self,
        params: &Map<String, Value>,
        defaults: Option<&Map<String, Value>>,
    ) -> Result<(Record, bool)> {
        if params.is_empty() {
            return Err(Error::construction("empty condition table is not allowed"));
        }
        let mut merged = params.clone();
        if let Some(defaults) = defaults {
            for (k, v) in defaults {
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        let mut insert_columns = Vec::with_capacity(merged.len());
        let mut values = Vec::with_capacity(merged.len());
        for (column, value) in &merged {
            let field = self.model.fields.get(column).ok_or_else(|| {
                Error::construction(format!(
                    "invalid field name '{column}' for {}",
                    self.model.table_name
                ))
            })?;
            insert_columns.push(column.clone());
            values.push(field.prepare_for_db(value)?);
        }
        let values_row = xodel_query::as_literal_unbracketed(&SqlValue::List(values))?;
        let primary_key = self.model.primary_key.clone().ok_or_else(|| {
            Error::construction(format!("{} has no primary key", self.model.table_name))
        })?;
        let mut all_columns = vec![primary_key];
        for column in &insert_columns {
            if !all_columns.contains(column) {
                all_columns.push(column.clone());
            }
        }
        let all_token = all_columns.join(", ");
        let guard = self
            .sql()
            .select_literal(&SqlValue::Int(1))?
            .where_map(params)?
            .statement();
        let insert_statement = format!(
            "(INSERT INTO {}({}) SELECT {values_row} \
             WHERE NOT EXISTS ({guard}) RETURNING {all_token})",
            self.model.table_name,
            insert_columns.join(", "),
        );
        let inserted = format!(
            "WITH new_records({all_token}) AS {insert_statement} \
             SELECT {all_token}, TRUE AS __is_inserted__ FROM new_records"
        );
        let selected = self
            .sql()
            .select_raw(all_token)
            .select_raw("FALSE AS __is_inserted__")
            .where_map(params)?
            .statement();
        let statement = format!("{inserted} UNION ALL ({selected})");
        tracing::debug!(table = %self.model.table_name, %statement, "executing");
        let rows = self.queryer.execute(&statement, false)?;
        if rows.len() > 1 {
            return Err(Error::Integrity("multiple records returned".to_string()));
        }
        let mut row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("record not found".to_string()))?
            .into_keyed()?;
        let created = row
            .remove("__is_inserted__")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok((Record::load(Arc::clone(&self.model), row), created))
    }

    // ---- bulk writes ----

    /// Insert a validated batch sharing one column set.
    pub fn insert_rows(&self, rows: &[Map<String, Value>]) -> Result<Vec<Row>> {
        let validated = self.model.validate_create_rows(rows)?;
        let columns = bulk_columns(&self.model, &validated, None)?;
        let prepared = prepare_rows(&self.model, &validated, &columns, false)?;
        let sql = self.sql().insert_rows(&columns, &prepared)?;
        self.exec_raw(&sql)
    }

    /// Validated bulk upsert. Every row must carry the conflict key.
    pub fn upsert(&self, rows: &[Map<String, Value>], key: Option<&[String]>) -> Result<Vec<Row>> {
        let (columns, key) = self.bulk_params(rows, key)?;
        self.model.check_upsert_key(rows, &key)?;
        let validated = restore_key_values(self.model.validate_create_rows(rows)?, rows, &key);
        let prepared = prepare_rows(&self.model, &validated, &columns, false)?;
        let sql = self.sql().upsert(&columns, &prepared, &key)?;
        self.exec_raw(&sql)
    }

    /// Upsert the batch, then insert whichever rows the update missed.
    pub fn merge(&self, rows: &[Map<String, Value>], key: Option<&[String]>) -> Result<Vec<Row>> {
        let (columns, key) = self.bulk_params(rows, key)?;
        self.model.check_upsert_key(rows, &key)?;
        let validated = restore_key_values(self.model.validate_create_rows(rows)?, rows, &key);
        let prepared = prepare_rows(&self.model, &validated, &columns, false)?;
        let sql = self.sql().merge(&columns, &prepared, &key)?;
        self.exec_raw(&sql)
    }

    /// Bulk update joined on the key columns.
    pub fn updates(&self, rows: &[Map<String, Value>], key: Option<&[String]>) -> Result<Vec<Row>> {
        let (columns, key) = self.bulk_params(rows, key)?;
        self.model.check_upsert_key(rows, &key)?;
        let validated = restore_key_values(self.model.validate_update_rows(rows)?, rows, &key);
        let prepared = prepare_rows(&self.model, &validated, &columns, true)?;
        let sql = self.sql().updates(&columns, &prepared, &key)?;
        self.exec_raw(&sql)
    }

    /// Upsert the batch and delete rows absent from it, optionally scoped
    /// by a condition.
    pub fn align(
        &self,
        rows: &[Map<String, Value>],
        key: Option<&[String]>,
        scope: Option<&Map<String, Value>>,
    ) -> Result<Vec<Row>> {
        let (columns, key) = self.bulk_params(rows, key)?;
        self.model.check_upsert_key(rows, &key)?;
        let validated = restore_key_values(self.model.validate_create_rows(rows)?, rows, &key);
        let prepared = prepare_rows(&self.model, &validated, &columns, false)?;
        let mut sql = self.sql();
        if let Some(scope) = scope {
            sql = sql.where_map(scope)?;
        }
        let sql = sql.align(&columns, &prepared, &key)?;
        self.exec_raw(&sql)
    }

    // ---- small helpers ----

    fn unique_key(&self, key: Option<&str>) -> Result<String> {
        match key {
            None => self.model.primary_key.clone().ok_or_else(|| {
                Error::construction(format!("{} has no primary key", self.model.table_name))
            }),
            Some(key) => {
                let field = self.model.fields.get(key).ok_or_else(|| {
                    Error::construction(format!("invalid field name: {key}"))
                })?;
                if !field.primary_key && !field.unique {
                    return Err(Error::construction(format!(
                        "field '{key}' is not primary_key or not unique"
                    )));
                }
                Ok(key.to_string())
            }
        }
    }

    fn bulk_params(
        &self,
        rows: &[Map<String, Value>],
        key: Option<&[String]>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        if rows.is_empty() {
            return Err(Error::encoding("empty rows passed to bulk operation"));
        }
        let key = key.map(<[String]>::to_vec);
        let columns = bulk_columns(&self.model, rows, key.as_deref())?;
        let key = match key {
            Some(key) => key,
            None => bulk_key(&self.model, &columns)?,
        };
        Ok((columns, key))
    }

    /// Encode raw key rows without running validation, for batch lookups.
    fn encode_rows(
        &self,
        rows: &[Map<String, Value>],
        columns: &[String],
    ) -> Result<Vec<Vec<SqlValue>>> {
        rows.iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|column| SqlValue::from_json(row.get(column).unwrap_or(&Value::Null)))
                    .collect()
            })
            .collect()
    }
}

/// The cascade foreign key of a nested table field: its declared cascade
/// column, or the first nested foreign key pointing back at the parent.
fn cascade_field(
    parent: &Arc<Model>,
    table: &xodel_core::TableKind,
) -> Result<(String, String)> {
    if let Some(column) = &table.cascade_column {
        let fk = table.model.foreign_key(column).ok_or_else(|| {
            Error::construction(format!(
                "cascade column {column} is not a foreign key of {}",
                table.model.table_name
            ))
        })?;
        return Ok((column.clone(), fk.reference_column.clone()));
    }
    for name in &table.model.names {
        let Some(field) = table.model.fields.get(name) else {
            continue;
        };
        if let Some(target) = field.fk_model(&table.model) {
            if target.table_name == parent.table_name {
                if let Some(fk) = table.model.foreign_key(name) {
                    return Ok((name.clone(), fk.reference_column.clone()));
                }
            }
        }
    }
    Err(Error::construction(format!(
        "no cascade foreign key from {} back to {}",
        table.model.table_name, parent.table_name
    )))
}

/// First-seen column union of the batch, with the key columns forced in
/// front when absent.
fn bulk_columns(
    model: &Model,
    rows: &[Map<String, Value>],
    key: Option<&[String]>,
) -> Result<Vec<String>> {
    let mut columns = model.columns_for_rows(rows);
    if columns.is_empty() {
        return Err(Error::encoding("no columns provided for bulk operation"));
    }
    if let Some(key) = key {
        for k in key.iter().rev() {
            if !columns.contains(k) {
                columns.insert(0, k.clone());
            }
        }
    }
    Ok(columns)
}

/// Default conflict key: the first unique-together group, else the first
/// unique column in the batch, else the primary key.
fn bulk_key(model: &Model, columns: &[String]) -> Result<Vec<String>> {
    if let Some(group) = model.unique_together.first() {
        return Ok(group.clone());
    }
    for column in columns {
        if model.fields.get(column).is_some_and(|f| f.unique) {
            return Ok(vec![column.clone()]);
        }
    }
    model
        .primary_key
        .clone()
        .map(|pk| vec![pk])
        .ok_or_else(|| {
            Error::construction(format!(
                "no key could be inferred for a bulk operation on {}",
                model.table_name
            ))
        })
}

/// Validation drops columns outside the writable names, the serial primary
/// key among them. Key values already checked non-empty are carried back so
/// the conflict columns render.
fn restore_key_values(
    mut validated: Vec<Map<String, Value>>,
    raw: &[Map<String, Value>],
    key: &[String],
) -> Vec<Map<String, Value>> {
    for (row, source) in validated.iter_mut().zip(raw) {
        for column in key {
            if !row.contains_key(column) {
                if let Some(value) = source.get(column) {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
    }
    validated
}

fn prepare_rows(
    model: &Model,
    rows: &[Map<String, Value>],
    columns: &[String],
    is_update: bool,
) -> Result<Vec<Vec<SqlValue>>> {
    rows.iter()
        .map(|row| {
            Ok(model
                .prepare_for_db(row, Some(columns), is_update)?
                .into_iter()
                .map(|(_, value)| value)
                .collect())
        })
        .collect()
}
