//! Model definition, normalization, and the row validation pipeline.
//!
//! A [`ModelSpec`] is the declarative form: fields, inheritance, mixins,
//! naming options. [`ModelSpec::materialize`] normalizes it into an
//! immutable [`Model`] descriptor with resolved field order, primary key,
//! writable names, and a precomputed column cache. Merging specs is a pure
//! function so mixin composition stays associative and side-effect free.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::client::SchemaClient;
use crate::error::{Error, Result, ValidationError};
use crate::field::{Field, FieldKind, FkRef, ForeignKeyKind, TableKind};
use crate::keywords;
use crate::validate;
use crate::value::SqlValue;

/// Name injected when no primary key is declared and the auto policy is on.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Names claimed by the record facade; fields cannot shadow them.
static RESERVED_FIELD_NAMES: &[&str] = &[
    "count", "create", "delete", "describe", "exists", "filter", "get",
    "get_or_create", "load", "save", "save_create", "save_update", "try_get",
    "validate",
];

/// Declarative model description.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub table_name: Option<String>,
    pub label: Option<String>,
    pub fields: Vec<Field>,
    /// Explicit field order; defaults to declaration order.
    pub field_names: Option<Vec<String>>,
    pub extends: Option<Box<ModelSpec>>,
    pub mixins: Vec<ModelSpec>,
    pub is_abstract: bool,
    pub auto_primary_key: bool,
    pub unique_together: Vec<Vec<String>>,
}

impl ModelSpec {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: Some(table_name.into()),
            auto_primary_key: true,
            ..Self::default()
        }
    }

    /// A spec with no table of its own, usable only as a mixin or parent.
    #[must_use]
    pub fn abstract_spec() -> Self {
        Self {
            is_abstract: true,
            auto_primary_key: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn field_names(mut self, names: &[&str]) -> Self {
        self.field_names = Some(names.iter().map(ToString::to_string).collect());
        self
    }

    #[must_use]
    pub fn extends(mut self, parent: ModelSpec) -> Self {
        self.extends = Some(Box::new(parent));
        self
    }

    #[must_use]
    pub fn mixin(mut self, spec: ModelSpec) -> Self {
        self.mixins.push(spec);
        self
    }

    #[must_use]
    pub fn no_auto_primary_key(mut self) -> Self {
        self.auto_primary_key = false;
        self
    }

    /// A single name is normalized to a one-element group.
    #[must_use]
    pub fn unique_together(mut self, group: &[&str]) -> Self {
        self.unique_together
            .push(group.iter().map(ToString::to_string).collect());
        self
    }

    /// Flatten inheritance and mixins into one spec.
    ///
    /// The parent is merged first, then each mixin in order, then the local
    /// declarations, so later operands override earlier ones.
    pub fn normalize(&self) -> Result<ModelSpec> {
        let mut base = match &self.extends {
            Some(parent) => parent.normalize()?,
            None => ModelSpec {
                auto_primary_key: self.auto_primary_key,
                is_abstract: self.is_abstract,
                ..ModelSpec::default()
            },
        };
        for mixin in &self.mixins {
            base = merge_specs(&base, &mixin.normalize()?)?;
        }
        let local = ModelSpec {
            table_name: self.table_name.clone(),
            label: self.label.clone(),
            fields: self.fields.clone(),
            field_names: self.field_names.clone(),
            extends: None,
            mixins: Vec::new(),
            is_abstract: self.is_abstract,
            auto_primary_key: self.auto_primary_key,
            unique_together: self.unique_together.clone(),
        };
        merge_specs(&base, &local)
    }

    /// Build the immutable descriptor, running every construction check.
    pub fn materialize(&self) -> Result<Arc<Model>> {
        self.materialize_with(None)
    }

    /// Like [`ModelSpec::materialize`], resolving URL foreign keys and
    /// remote choice lists through the client. Any fetch failure aborts
    /// the whole construction.
    pub fn materialize_with(&self, client: Option<&dyn SchemaClient>) -> Result<Arc<Model>> {
        let spec = self.normalize()?;
        Model::build(spec, client)
    }

    /// Parse the wire form of a remotely served model schema.
    pub fn from_schema_value(payload: &Value) -> Result<ModelSpec> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::construction("schema payload must be an object"))?;
        let table_name = obj
            .get("table_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::construction("schema payload missing table_name"))?;
        let mut spec = ModelSpec::new(table_name);
        if let Some(label) = obj.get("label").and_then(Value::as_str) {
            spec = spec.label(label);
        }
        let fields = obj
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::construction("schema payload missing fields"))?;
        for raw in fields {
            spec = spec.field(field_from_schema(raw)?);
        }
        Ok(spec)
    }
}

fn field_from_schema(raw: &Value) -> Result<Field> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::construction("schema field must be an object"))?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::construction("schema field missing name"))?;
    let type_name = obj.get("type").and_then(Value::as_str).unwrap_or("string");
    let mut field = match type_name {
        "text" => Field::text(name),
        "email" => Field::email(name),
        "integer" => Field::integer(name),
        "serial" => Field::serial(name),
        "float" => Field::float(name),
        "boolean" => Field::boolean(name),
        "date" => Field::date(name),
        "time" => Field::time(name),
        "datetime" => Field::datetime(name),
        "json" => Field::json(name),
        "year" => Field::year(name),
        "month" => Field::month(name),
        "year_month" => Field::year_month(name),
        "sfzh" => Field::sfzh(name),
        _ => Field::string(name),
    };
    if obj.get("required").and_then(Value::as_bool) == Some(true) {
        field = field.required();
    }
    if obj.get("unique").and_then(Value::as_bool) == Some(true) {
        field = field.unique();
    }
    if obj.get("primary_key").and_then(Value::as_bool) == Some(true) {
        field = field.primary_key();
    }
    if let Some(n) = obj.get("maxlength").and_then(Value::as_u64) {
        field = field.maxlength(n as usize);
    }
    if let Some(label) = obj.get("label").and_then(Value::as_str) {
        field = field.label(label);
    }
    Ok(field)
}

/// Pure pairwise merge: `b` overlays `a`.
///
/// Field names form a first-seen-order union; fields present in both
/// operands merge by taking the later declaration, recursing into nested
/// table-field models. Associative by construction.
pub fn merge_specs(a: &ModelSpec, b: &ModelSpec) -> Result<ModelSpec> {
    let mut fields: Vec<Field> = a.fields.clone();
    for field in &b.fields {
        match fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = merge_fields(existing, field)?,
            None => fields.push(field.clone()),
        }
    }
    // An operand without an explicit list contributes its fields in
    // declaration order; otherwise the other side's list would drop them.
    let field_names = match (&a.field_names, &b.field_names) {
        (None, None) => None,
        _ => {
            let declared = |spec: &ModelSpec| {
                spec.field_names
                    .clone()
                    .unwrap_or_else(|| spec.fields.iter().map(|f| f.name.clone()).collect())
            };
            let mut union = declared(a);
            for name in declared(b) {
                if !union.contains(&name) {
                    union.push(name);
                }
            }
            Some(union)
        }
    };
    let mut unique_together = a.unique_together.clone();
    for group in &b.unique_together {
        if !unique_together.contains(group) {
            unique_together.push(group.clone());
        }
    }
    Ok(ModelSpec {
        table_name: b.table_name.clone().or_else(|| a.table_name.clone()),
        label: b.label.clone().or_else(|| a.label.clone()),
        fields,
        field_names,
        extends: None,
        mixins: Vec::new(),
        is_abstract: b.is_abstract,
        auto_primary_key: b.auto_primary_key,
        unique_together,
    })
}

/// Later field wins; nested table models merge recursively so a mixin can
/// extend an embedded row schema without restating it.
fn merge_fields(a: &Field, b: &Field) -> Result<Field> {
    if let (FieldKind::Table(ta), FieldKind::Table(tb)) = (&a.kind, &b.kind) {
        let merged_model = Model::merge(&ta.model, &tb.model)?;
        let mut merged = b.clone();
        merged.kind = FieldKind::Table(Box::new(TableKind {
            model: merged_model,
            max_rows: tb.max_rows,
            cascade_column: tb.cascade_column.clone().or_else(|| ta.cascade_column.clone()),
        }));
        return Ok(merged);
    }
    Ok(b.clone())
}

/// Reject reserved words, alias tokens, and names the dotted-path syntax
/// could not distinguish.
pub fn check_reserved(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::construction("name cannot be empty"));
    }
    if name.contains("__") {
        return Err(Error::construction(format!(
            "name {name} cannot contain double underscores"
        )));
    }
    if keywords::is_reserved(name) {
        return Err(Error::construction(format!("name {name} is a reserved word")));
    }
    if keywords::is_alias_token(name) {
        return Err(Error::construction(format!(
            "name {name} collides with an internal table alias"
        )));
    }
    Ok(())
}

fn check_field_name(name: &str) -> Result<()> {
    check_reserved(name)?;
    if RESERVED_FIELD_NAMES.contains(&name) {
        return Err(Error::construction(format!(
            "field name {name} shadows a record method"
        )));
    }
    Ok(())
}

/// Immutable, fully resolved model descriptor.
#[derive(Debug, Clone)]
pub struct Model {
    pub table_name: String,
    pub label: String,
    pub is_abstract: bool,
    /// All fields, declaration order.
    pub field_names: Vec<String>,
    pub fields: HashMap<String, Field>,
    pub primary_key: Option<String>,
    /// Writable field names: the serial primary key and auto-now fields
    /// are excluded.
    pub names: Vec<String>,
    pub auto_now_name: Option<String>,
    pub auto_now_add_name: Option<String>,
    pub unique_together: Vec<Vec<String>>,
    /// Precomputed `table.column` strings for the statement builder.
    pub column_cache: HashMap<String, String>,
}

impl Model {
    fn build(spec: ModelSpec, client: Option<&dyn SchemaClient>) -> Result<Arc<Self>> {
        let is_abstract = spec.is_abstract;
        let table_name = match &spec.table_name {
            Some(name) => {
                check_reserved(name)?;
                name.clone()
            }
            None if is_abstract => String::new(),
            None => {
                return Err(Error::construction(
                    "non-abstract model requires a table name",
                ));
            }
        };

        let mut ordered: Vec<Field> = match &spec.field_names {
            Some(names) => {
                let mut picked = Vec::with_capacity(names.len());
                for name in names {
                    let field = spec
                        .fields
                        .iter()
                        .find(|f| &f.name == name)
                        .ok_or_else(|| {
                            Error::construction(format!(
                                "field name {name} has no declaration"
                            ))
                        })?;
                    picked.push(field.clone());
                }
                picked
            }
            None => spec.fields.clone(),
        };

        let mut seen: Vec<&str> = Vec::new();
        for field in &ordered {
            check_field_name(&field.name)?;
            if seen.contains(&field.name.as_str()) {
                return Err(Error::construction(format!(
                    "duplicate field name {}",
                    field.name
                )));
            }
            seen.push(&field.name);
        }

        // Primary key: at most one declared, serial id injected on demand.
        let declared: Vec<&Field> = ordered.iter().filter(|f| f.primary_key).collect();
        if declared.len() > 1 {
            return Err(Error::construction(format!(
                "model {table_name} declares more than one primary key"
            )));
        }
        let mut primary_key = declared.first().map(|f| f.name.clone());
        if primary_key.is_none() && spec.auto_primary_key && !is_abstract {
            let pk = Field::serial(DEFAULT_PRIMARY_KEY).primary_key();
            ordered.insert(0, pk);
            primary_key = Some(DEFAULT_PRIMARY_KEY.to_string());
        }

        let snapshot = ordered_snapshot(&ordered);
        for field in &mut ordered {
            resolve_field(field, &table_name, &snapshot, client)?;
        }

        let field_names: Vec<String> = ordered.iter().map(|f| f.name.clone()).collect();

        for group in &spec.unique_together {
            for name in group {
                if !field_names.contains(name) {
                    return Err(Error::construction(format!(
                        "unique_together references unknown field {name}"
                    )));
                }
            }
        }

        let mut auto_now_name = None;
        let mut auto_now_add_name = None;
        let mut names = Vec::new();
        for field in &ordered {
            match &field.kind {
                FieldKind::Integer { serial: true, .. } if field.primary_key => {}
                FieldKind::Datetime { auto_now: true, .. } => {
                    auto_now_name = Some(field.name.clone());
                }
                FieldKind::Datetime {
                    auto_now_add: true, ..
                } => {
                    auto_now_add_name = Some(field.name.clone());
                }
                _ => names.push(field.name.clone()),
            }
        }

        let mut column_cache = HashMap::new();
        if !is_abstract {
            for name in &field_names {
                column_cache.insert(name.clone(), format!("{table_name}.{name}"));
            }
        }

        let label = spec.label.clone().unwrap_or_else(|| table_name.clone());
        let fields: HashMap<String, Field> = ordered
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        Ok(Arc::new(Self {
            table_name,
            label,
            is_abstract,
            field_names,
            fields,
            primary_key,
            names,
            auto_now_name,
            auto_now_add_name,
            unique_together: spec.unique_together,
            column_cache,
        }))
    }

    /// Pure structural merge of two materialized models, used when mixins
    /// both declare the same nested table field.
    pub fn merge(a: &Arc<Model>, b: &Arc<Model>) -> Result<Arc<Model>> {
        let spec_a = a.to_spec();
        let spec_b = b.to_spec();
        let merged = merge_specs(&spec_a, &spec_b)?;
        Model::build(merged, None)
    }

    /// Reconstruct the declarative form; merges and describes go through
    /// this so the spec round-trips.
    #[must_use]
    pub fn to_spec(&self) -> ModelSpec {
        ModelSpec {
            table_name: if self.table_name.is_empty() {
                None
            } else {
                Some(self.table_name.clone())
            },
            label: Some(self.label.clone()),
            fields: self
                .field_names
                .iter()
                .filter_map(|n| self.fields.get(n).cloned())
                .collect(),
            field_names: None,
            extends: None,
            mixins: Vec::new(),
            is_abstract: self.is_abstract,
            // the pk is already part of the reconstructed fields
            auto_primary_key: false,
            unique_together: self.unique_together.clone(),
        }
    }

    /// Foreign-key parameters of a field, if it is one.
    #[must_use]
    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKeyKind> {
        match &self.fields.get(name)?.kind {
            FieldKind::ForeignKey(fk) => Some(fk),
            _ => None,
        }
    }

    /// `table.column` for a field, from the cache built at materialization.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&str> {
        self.column_cache.get(name).map(String::as_str)
    }

    // ---- row validation ----

    /// Validate one insert row. Empty inputs take the field default; a
    /// required field with neither fails; optional fields with no default
    /// are omitted from the output.
    pub fn validate_create(&self, input: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for name in &self.names {
            let field = &self.fields[name];
            let raw = input.get(name);
            if validate::is_empty_input(raw) {
                if let Some(default) = field.get_default() {
                    out.insert(name.clone(), default);
                } else if field.required {
                    return Err(ValidationError::new(
                        name.clone(),
                        format!("{} is required", field.label),
                        raw.cloned().unwrap_or(Value::Null),
                    )
                    .with_label(field.label.clone())
                    .into());
                }
                continue;
            }
            let cleaned = field.validate(raw.unwrap_or(&Value::Null))?;
            out.insert(name.clone(), cleaned);
        }
        Ok(out)
    }

    /// Validate a partial update row: only the keys present in the input
    /// are touched. An explicitly empty value clears the column.
    pub fn validate_update(&self, input: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for name in &self.names {
            let Some(raw) = input.get(name) else { continue };
            if validate::is_empty_input(Some(raw)) {
                out.insert(name.clone(), Value::Null);
                continue;
            }
            let field = &self.fields[name];
            out.insert(name.clone(), field.validate(raw)?);
        }
        Ok(out)
    }

    /// Every row must carry a non-empty value for each key column before a
    /// bulk upsert or merge is allowed to render.
    pub fn check_upsert_key(&self, rows: &[Map<String, Value>], key: &[String]) -> Result<()> {
        for (batch_index, row) in rows.iter().enumerate() {
            for column in key {
                if !self.fields.contains_key(column) {
                    return Err(Error::construction(format!(
                        "invalid key column {column} for {}",
                        self.table_name
                    )));
                }
                if validate::is_empty_input(row.get(column)) {
                    return Err(Error::batch(
                        ValidationError::new(
                            column.clone(),
                            format!("{column} is required for this operation"),
                            row.get(column).cloned().unwrap_or(Value::Null),
                        ),
                        batch_index,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate a batch of insert rows, tagging the first failure with its
    /// row index.
    pub fn validate_create_rows(
        &self,
        rows: &[Map<String, Value>],
    ) -> Result<Vec<Map<String, Value>>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                self.validate_create(row).map_err(|e| match e {
                    Error::Validation(inner) => Error::batch(inner, i),
                    other => other,
                })
            })
            .collect()
    }

    /// Batch variant of [`Model::validate_update`].
    pub fn validate_update_rows(
        &self,
        rows: &[Map<String, Value>],
    ) -> Result<Vec<Map<String, Value>>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                self.validate_update(row).map_err(|e| match e {
                    Error::Validation(inner) => Error::batch(inner, i),
                    other => other,
                })
            })
            .collect()
    }

    /// Storage preparation for one validated row. On update the auto-now
    /// column is injected with the current time even when absent.
    pub fn prepare_for_db(
        &self,
        data: &Map<String, Value>,
        columns: Option<&[String]>,
        is_update: bool,
    ) -> Result<Vec<(String, SqlValue)>> {
        let owned;
        let columns = match columns {
            Some(cols) => cols,
            None => {
                owned = self
                    .names
                    .iter()
                    .filter(|n| data.contains_key(*n))
                    .cloned()
                    .collect::<Vec<_>>();
                &owned
            }
        };
        let mut out = Vec::with_capacity(columns.len() + 1);
        for name in columns {
            let field = self.fields.get(name).ok_or_else(|| {
                Error::construction(format!("invalid column {name} for {}", self.table_name))
            })?;
            let value = data.get(name).cloned().unwrap_or(Value::Null);
            out.push((name.clone(), field.prepare_for_db(&value)?));
        }
        if is_update {
            if let Some(auto_now) = &self.auto_now_name {
                if !columns.contains(auto_now) {
                    out.push((auto_now.clone(), SqlValue::Str(validate::localtime())));
                }
            }
        }
        Ok(out)
    }

    /// Column set for a batch: first-seen-order union of the row keys,
    /// restricted to writable names.
    #[must_use]
    pub fn columns_for_rows(&self, rows: &[Map<String, Value>]) -> Vec<String> {
        let mut columns = Vec::new();
        for row in rows {
            for key in row.keys() {
                if self.names.contains(key) && !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Run result-row values through each field's load transform.
    #[must_use]
    pub fn load_row(&self, mut row: Map<String, Value>) -> Map<String, Value> {
        for (key, value) in &mut row {
            if let Some(field) = self.fields.get(key) {
                let loaded = field.load(value.take());
                *value = loaded;
            }
        }
        row
    }

    /// Serializable schema summary.
    #[must_use]
    pub fn describe(&self) -> Value {
        json!({
            "table_name": self.table_name,
            "label": self.label,
            "primary_key": self.primary_key,
            "field_names": self.field_names,
            "fields": self
                .field_names
                .iter()
                .filter_map(|n| self.fields.get(n).map(Field::describe))
                .collect::<Vec<_>>(),
            "unique_together": self.unique_together,
        })
    }
}

fn ordered_snapshot(fields: &[Field]) -> Vec<(String, String, bool)> {
    fields
        .iter()
        .map(|f| (f.name.clone(), f.db_type.clone(), f.primary_key || f.unique))
        .collect()
}

/// Per-field materialization fixups: choice-driven string widths, self
/// foreign keys, remote references.
fn resolve_field(
    field: &mut Field,
    table_name: &str,
    siblings: &[(String, String, bool)],
    client: Option<&dyn SchemaClient>,
) -> Result<()> {
    // Strings constrained to declared choices only need the longest one.
    if let FieldKind::String { maxlength, .. } = &mut field.kind {
        if *maxlength == crate::field::DEFAULT_STRING_MAXLENGTH && !field.choices.is_empty() {
            let longest = field
                .choices
                .iter()
                .filter_map(|c| c.value.as_str().map(|s| s.chars().count()))
                .max()
                .unwrap_or(0);
            if longest > 0 {
                *maxlength = longest;
                field.db_type = format!("varchar({longest})");
            }
        }
    }

    if let FieldKind::ForeignKey(fk) = &mut field.kind {
        match fk.reference.clone() {
            FkRef::SelfRef => {
                // Resolvable only now that the full field set exists.
                let target = siblings
                    .iter()
                    .find(|(name, _, _)| name == &fk.reference_column)
                    .ok_or_else(|| {
                        Error::construction(format!(
                            "self reference column {} does not exist on {table_name}",
                            fk.reference_column
                        ))
                    })?;
                if !target.2 {
                    return Err(Error::construction(format!(
                        "self reference column {} on {table_name} must be a primary key or unique",
                        fk.reference_column
                    )));
                }
                field.db_type = match target.1.as_str() {
                    "serial" => "integer".to_string(),
                    other => other.to_string(),
                };
            }
            FkRef::Url(url) => {
                let client = client.ok_or_else(|| {
                    Error::construction(format!(
                        "foreign key {} references {url} but no schema client was provided",
                        field.name
                    ))
                })?;
                let payload = client.fetch(&url)?;
                let spec = ModelSpec::from_schema_value(&payload)?;
                let target = spec.materialize_with(Some(client))?;
                let column = match fk.reference_column.is_empty() {
                    true => target.primary_key.clone().ok_or_else(|| {
                        Error::construction(format!(
                            "remote model {} has no primary key",
                            target.table_name
                        ))
                    })?,
                    false => fk.reference_column.clone(),
                };
                let target_field = target.fields.get(&column).ok_or_else(|| {
                    Error::construction(format!(
                        "remote model {} has no column {column}",
                        target.table_name
                    ))
                })?;
                field.db_type = match target_field.db_type.as_str() {
                    "serial" => "integer".to_string(),
                    other => other.to_string(),
                };
                fk.reference_column = column;
                fk.reference = FkRef::Model(target);
            }
            FkRef::Model(_) => {}
        }
    }

    // Remote choice lists resolve eagerly when a client is on hand.
    if field.choices_url.is_some() {
        if let Some(client) = client {
            field.resolve_choices(client)?;
        }
    }
    Ok(())
}
