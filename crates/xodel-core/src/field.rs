//! Field descriptors and the closed field-kind registry.
//!
//! Every field is a [`Field`] struct tagged with a [`FieldKind`]. A kind
//! carries its own parameters (lengths, bounds, nested models, references)
//! and defines the fixed-order validation chain: required/optional gate,
//! type coercion, format checks, kind-specific checks, then choice
//! membership. Shared behavior is explicit delegation between kinds, never
//! implicit chaining.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value, json};

use crate::client::SchemaClient;
use crate::error::{Error, Result, ValidationError};
use crate::model::Model;
use crate::validate;
use crate::value::SqlValue;

/// Default string column width when none is declared.
pub const DEFAULT_STRING_MAXLENGTH: usize = 256;

/// How many allowed values a choices error message lists before truncating.
const DEFAULT_CHOICES_DISPLAY_COUNT: usize = 30;

/// Attachment size ceiling fallback when the environment does not set one.
const DEFAULT_ATTACHMENT_SIZE: &str = "20m";

/// Storage types treated as text by condition rendering; everything else is
/// cast to varchar before substring/regex operators.
#[must_use]
pub fn is_string_db_type(db_type: &str) -> bool {
    let base = db_type.split('(').next().unwrap_or(db_type);
    matches!(base, "varchar" | "text" | "char" | "bpchar")
}

/// One selectable choice: stored value, display label, optional hint.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub value: Value,
    pub label: String,
    pub hint: Option<String>,
}

impl Choice {
    pub fn new(value: impl Into<Value>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
            hint: None,
        }
    }

    /// Accepts the three wire shapes: a bare scalar, a `[value, label]`
    /// pair, or a `{value, label, hint}` object.
    pub fn from_json(raw: &Value) -> Result<Self> {
        match raw {
            Value::String(s) => Ok(Self::new(s.clone(), s.clone())),
            Value::Number(n) => Ok(Self::new(n.clone(), n.to_string())),
            Value::Array(pair) if pair.len() == 2 => {
                let label = validate::as_string(&pair[1])
                    .map_err(|_| Error::construction("choice label must be a string"))?;
                Ok(Self::new(pair[0].clone(), label))
            }
            Value::Object(obj) => {
                let value = obj
                    .get("value")
                    .cloned()
                    .ok_or_else(|| Error::construction("choice object missing value"))?;
                let label = obj
                    .get("label")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| value.to_string());
                let hint = obj
                    .get("hint")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                Ok(Self { value, label, hint })
            }
            other => Err(Error::construction(format!(
                "cannot build a choice from {other}"
            ))),
        }
    }
}

/// Literal or generated field default. Literals are cloned on every use so
/// no mutable state is shared between rows.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    Value(Value),
    Generator(fn() -> Value),
}

/// ON DELETE / ON UPDATE behavior for foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ReferentialAction {
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::NoAction => "NO ACTION",
        }
    }
}

/// Foreign-key target. Self references stay symbolic until the owning model
/// is materialized; URL references are resolved through a [`SchemaClient`].
#[derive(Debug, Clone)]
pub enum FkRef {
    SelfRef,
    Model(Arc<Model>),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct ForeignKeyKind {
    pub reference: FkRef,
    /// Column on the referenced model; must be its primary key or unique.
    pub reference_column: String,
    /// Optional display column, may traverse one further hop (`fk__col`).
    pub reference_label_column: Option<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// Nested one-to-many rows validated through the embedded model.
#[derive(Debug, Clone)]
pub struct TableKind {
    pub model: Arc<Model>,
    pub max_rows: usize,
    /// Nested foreign key pointing back at the parent row.
    pub cascade_column: Option<String>,
}

/// Upload field configuration. Size ceilings come from the environment once
/// at construction; validation of the payload itself belongs to the upload
/// collaborator.
#[derive(Debug, Clone)]
pub struct AttachmentKind {
    pub size_limit: u64,
    pub upload_url: Option<String>,
}

impl AttachmentKind {
    fn from_env() -> Self {
        let raw = std::env::var("XODEL_ATTACHMENT_SIZE")
            .unwrap_or_else(|_| DEFAULT_ATTACHMENT_SIZE.to_string());
        let size_limit = validate::parse_byte_size(&raw).unwrap_or_else(|_| {
            tracing::warn!(size = %raw, "invalid attachment size in environment, using default");
            validate::parse_byte_size(DEFAULT_ATTACHMENT_SIZE).unwrap_or(0)
        });
        Self {
            size_limit,
            upload_url: None,
        }
    }
}

/// The closed kind registry. Adding a field type means adding a variant and
/// handling it in the match arms below.
#[derive(Debug, Clone)]
pub enum FieldKind {
    String {
        maxlength: usize,
        minlength: Option<usize>,
        length: Option<usize>,
        pattern: Option<String>,
        /// Strip all whitespace instead of trimming the ends.
        compact: bool,
    },
    Text,
    Email,
    Password {
        maxlength: usize,
        minlength: Option<usize>,
    },
    /// Chinese resident identity number, 18 chars with checksum.
    Sfzh,
    Integer {
        min: Option<i64>,
        max: Option<i64>,
        serial: bool,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    Year,
    Month,
    YearMonth,
    Boolean,
    Date,
    Time,
    Datetime {
        auto_now: bool,
        auto_now_add: bool,
    },
    Json,
    ForeignKey(Box<ForeignKeyKind>),
    Array(Box<Field>),
    Table(Box<TableKind>),
    Attachment(AttachmentKind),
    AttachmentList(AttachmentKind),
}

impl FieldKind {
    /// Stable tag used by `describe` output.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Text => "text",
            Self::Email => "email",
            Self::Password { .. } => "password",
            Self::Sfzh => "sfzh",
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "float",
            Self::Year => "year",
            Self::Month => "month",
            Self::YearMonth => "year_month",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Time => "time",
            Self::Datetime { .. } => "datetime",
            Self::Json => "json",
            Self::ForeignKey(_) => "foreign_key",
            Self::Array(_) => "array",
            Self::Table(_) => "table",
            Self::Attachment(_) => "attachment",
            Self::AttachmentList(_) => "attachment_list",
        }
    }

    fn default_db_type(&self) -> String {
        match self {
            Self::String { maxlength, .. } => format!("varchar({maxlength})"),
            Self::Text => "text".to_string(),
            Self::Email | Self::Password { .. } => "varchar(255)".to_string(),
            Self::Sfzh => "varchar(18)".to_string(),
            Self::Integer { serial: true, .. } => "serial".to_string(),
            Self::Integer { .. } | Self::Year | Self::Month => "integer".to_string(),
            Self::Float { .. } => "float".to_string(),
            Self::YearMonth => "varchar(7)".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Date => "date".to_string(),
            Self::Time => "time".to_string(),
            Self::Datetime { .. } => "timestamp".to_string(),
            Self::Json | Self::Array(_) | Self::Table(_) | Self::AttachmentList(_) => {
                "jsonb".to_string()
            }
            // Resolved from the referenced column at construction.
            Self::ForeignKey(_) => "integer".to_string(),
            Self::Attachment(_) => "varchar(255)".to_string(),
        }
    }
}

/// A fully specified field descriptor. Immutable once its model is built,
/// except for the one-time remote choices cache.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub unique: bool,
    pub index: bool,
    pub primary_key: bool,
    pub null: bool,
    pub disabled: bool,
    pub default: Option<FieldDefault>,
    pub choices: Vec<Choice>,
    /// Enforce choice membership during validation.
    pub strict: bool,
    pub choices_url: Option<String>,
    pub max_display_count: usize,
    pub db_type: String,
    pub hint: Option<String>,
    pub tag: Option<String>,
    /// Overrides for "required" and "choices" failure messages.
    pub error_messages: HashMap<String, String>,
    resolved_choices: Arc<OnceLock<Vec<Choice>>>,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        let db_type = kind.default_db_type();
        let max_display_count = std::env::var("XODEL_CHOICES_DISPLAY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHOICES_DISPLAY_COUNT);
        Self {
            label: name.clone(),
            name,
            kind,
            required: false,
            unique: false,
            index: false,
            primary_key: false,
            null: false,
            disabled: false,
            default: None,
            choices: Vec::new(),
            strict: true,
            choices_url: None,
            max_display_count,
            db_type,
            hint: None,
            tag: None,
            error_messages: HashMap::new(),
            resolved_choices: Arc::new(OnceLock::new()),
        }
    }

    // ---- constructors ----

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::String {
                maxlength: DEFAULT_STRING_MAXLENGTH,
                minlength: None,
                length: None,
                pattern: None,
                compact: false,
            },
        )
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn email(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Email)
    }

    pub fn password(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Password {
                maxlength: 255,
                minlength: None,
            },
        )
    }

    pub fn sfzh(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Sfzh)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Integer {
                min: None,
                max: None,
                serial: false,
            },
        )
    }

    /// Auto-incrementing integer, the kind injected for auto primary keys.
    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Integer {
                min: None,
                max: None,
                serial: true,
            },
        )
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float { min: None, max: None })
    }

    pub fn year(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Year)
    }

    pub fn month(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Month)
    }

    pub fn year_month(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::YearMonth)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Time)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Datetime {
                auto_now: false,
                auto_now_add: false,
            },
        )
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json)
    }

    /// Foreign key referencing another model's primary key (or a unique
    /// column chosen with [`Field::reference_column`]). The storage type is
    /// inferred from the referenced column.
    pub fn foreign_key(name: impl Into<String>, model: Arc<Model>) -> Result<Self> {
        let column = model.primary_key.clone().ok_or_else(|| {
            Error::construction(format!(
                "foreign key target {} has no primary key",
                model.table_name
            ))
        })?;
        let mut field = Self::new(
            name,
            FieldKind::ForeignKey(Box::new(ForeignKeyKind {
                reference: FkRef::Model(Arc::clone(&model)),
                reference_column: column.clone(),
                reference_label_column: None,
                on_delete: ReferentialAction::Cascade,
                on_update: ReferentialAction::Cascade,
            })),
        );
        field.db_type = fk_db_type(&model, &column)?;
        Ok(field)
    }

    /// Foreign key back onto the owning model; resolved when the owner is
    /// materialized.
    pub fn foreign_key_self(name: impl Into<String>, reference_column: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ForeignKey(Box::new(ForeignKeyKind {
                reference: FkRef::SelfRef,
                reference_column: reference_column.into(),
                reference_label_column: None,
                on_delete: ReferentialAction::Cascade,
                on_update: ReferentialAction::Cascade,
            })),
        )
    }

    /// Foreign key whose target schema is fetched from a URL during remote
    /// materialization.
    pub fn foreign_key_url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ForeignKey(Box::new(ForeignKeyKind {
                reference: FkRef::Url(url.into()),
                reference_column: String::new(),
                reference_label_column: None,
                on_delete: ReferentialAction::Cascade,
                on_update: ReferentialAction::Cascade,
            })),
        )
    }

    pub fn array(name: impl Into<String>, element: Field) -> Self {
        Self::new(name, FieldKind::Array(Box::new(element)))
    }

    pub fn table(name: impl Into<String>, model: Arc<Model>) -> Self {
        Self::new(
            name,
            FieldKind::Table(Box::new(TableKind {
                model,
                max_rows: 1,
                cascade_column: None,
            })),
        )
    }

    pub fn attachment(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Attachment(AttachmentKind::from_env()))
    }

    pub fn attachment_list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::AttachmentList(AttachmentKind::from_env()))
    }

    // ---- builder setters ----

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self
    }

    #[must_use]
    pub fn null(mut self) -> Self {
        self.null = true;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    #[must_use]
    pub fn default_generator(mut self, generator: fn() -> Value) -> Self {
        self.default = Some(FieldDefault::Generator(generator));
        self
    }

    /// Declared choices. String fields without an explicit maxlength widen
    /// it to the longest choice at materialization time, matching the
    /// storage the values actually need.
    #[must_use]
    pub fn choices(mut self, choices: Vec<Choice>) -> Self {
        self.choices = choices;
        self
    }

    #[must_use]
    pub fn lenient_choices(mut self) -> Self {
        self.strict = false;
        self
    }

    #[must_use]
    pub fn choices_url(mut self, url: impl Into<String>) -> Self {
        self.choices_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn db_type(mut self, db_type: impl Into<String>) -> Self {
        self.db_type = db_type.into();
        self
    }

    #[must_use]
    pub fn error_message(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_messages.insert(key.into(), message.into());
        self
    }

    #[must_use]
    pub fn maxlength(mut self, n: usize) -> Self {
        match &mut self.kind {
            FieldKind::String { maxlength, .. } | FieldKind::Password { maxlength, .. } => {
                *maxlength = n;
                self.db_type = format!("varchar({n})");
            }
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn minlength(mut self, n: usize) -> Self {
        match &mut self.kind {
            FieldKind::String { minlength, .. } | FieldKind::Password { minlength, .. } => {
                *minlength = Some(n);
            }
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn length(mut self, n: usize) -> Self {
        if let FieldKind::String { length, .. } = &mut self.kind {
            *length = Some(n);
        }
        self
    }

    #[must_use]
    pub fn pattern(mut self, p: impl Into<String>) -> Self {
        if let FieldKind::String { pattern, .. } = &mut self.kind {
            *pattern = Some(p.into());
        }
        self
    }

    /// Strip all whitespace from string input instead of trimming the ends.
    #[must_use]
    pub fn compact(mut self) -> Self {
        if let FieldKind::String { compact, .. } = &mut self.kind {
            *compact = true;
        }
        self
    }

    #[must_use]
    pub fn min(mut self, value: f64) -> Self {
        match &mut self.kind {
            FieldKind::Integer { min, .. } => *min = Some(value as i64),
            FieldKind::Float { min, .. } => *min = Some(value),
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn max(mut self, value: f64) -> Self {
        match &mut self.kind {
            FieldKind::Integer { max, .. } => *max = Some(value as i64),
            FieldKind::Float { max, .. } => *max = Some(value),
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn auto_now(mut self) -> Self {
        if let FieldKind::Datetime { auto_now, .. } = &mut self.kind {
            *auto_now = true;
        }
        self
    }

    #[must_use]
    pub fn auto_now_add(mut self) -> Self {
        if let FieldKind::Datetime { auto_now_add, .. } = &mut self.kind {
            *auto_now_add = true;
        }
        self
    }

    /// Choose a unique reference column instead of the target primary key.
    pub fn reference_column(mut self, column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        if let FieldKind::ForeignKey(fk) = &mut self.kind {
            if let FkRef::Model(model) = &fk.reference {
                self.db_type = fk_db_type(model, &column)?;
            }
            fk.reference_column = column;
            Ok(self)
        } else {
            Err(Error::construction(format!(
                "{} is not a foreign key",
                self.name
            )))
        }
    }

    /// Display column on the referenced model; `fk__col` traverses one more
    /// foreign-key hop.
    pub fn reference_label_column(mut self, column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        if let FieldKind::ForeignKey(fk) = &mut self.kind {
            if let FkRef::Model(model) = &fk.reference {
                check_label_column(model, &column)?;
            }
            fk.reference_label_column = Some(column);
            Ok(self)
        } else {
            Err(Error::construction(format!(
                "{} is not a foreign key",
                self.name
            )))
        }
    }

    #[must_use]
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let FieldKind::ForeignKey(fk) = &mut self.kind {
            fk.on_delete = action;
        }
        self
    }

    #[must_use]
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        if let FieldKind::ForeignKey(fk) = &mut self.kind {
            fk.on_update = action;
        }
        self
    }

    #[must_use]
    pub fn max_rows(mut self, n: usize) -> Self {
        if let FieldKind::Table(table) = &mut self.kind {
            table.max_rows = n;
        }
        self
    }

    #[must_use]
    pub fn cascade_column(mut self, column: impl Into<String>) -> Self {
        if let FieldKind::Table(table) = &mut self.kind {
            table.cascade_column = Some(column.into());
        }
        self
    }

    // ---- behavior ----

    fn fail(&self, message: impl Into<String>, value: &Value) -> ValidationError {
        ValidationError::new(self.name.clone(), message, value.clone())
            .with_label(self.label.clone())
    }

    fn required_message(&self) -> String {
        self.error_messages
            .get("required")
            .cloned()
            .unwrap_or_else(|| format!("{} is required", self.label))
    }

    /// Run the validation chain against raw input.
    ///
    /// The gate comes first: an empty optional value short-circuits the
    /// chain and is returned untouched so the model layer can fill the
    /// default; an empty required value fails immediately.
    pub fn validate(&self, raw: &Value) -> std::result::Result<Value, ValidationError> {
        if validate::is_empty_input(Some(raw)) {
            if self.required {
                return Err(self.fail(self.required_message(), raw));
            }
            return Ok(raw.clone());
        }
        let cleaned = self.validate_kind(raw)?;
        self.check_choices(&cleaned)?;
        Ok(cleaned)
    }

    fn validate_kind(&self, raw: &Value) -> std::result::Result<Value, ValidationError> {
        let mapped = |message: String| self.fail(message, raw);
        match &self.kind {
            FieldKind::String {
                maxlength,
                minlength,
                length,
                pattern,
                compact,
            } => {
                let s = validate::as_string(raw).map_err(mapped)?;
                let s = if *compact {
                    validate::delete_spaces(&s)
                } else {
                    validate::trim(&s)
                };
                if let Some(n) = length {
                    validate::check_length(&s, *n).map_err(|m| self.fail(m, raw))?;
                }
                validate::check_maxlength(&s, *maxlength).map_err(|m| self.fail(m, raw))?;
                if let Some(n) = minlength {
                    validate::check_minlength(&s, *n).map_err(|m| self.fail(m, raw))?;
                }
                if let Some(p) = pattern {
                    validate::check_pattern(&s, p, None).map_err(|m| self.fail(m, raw))?;
                }
                Ok(Value::String(s))
            }
            FieldKind::Text => {
                let s = validate::as_string(raw).map_err(mapped)?;
                Ok(Value::String(s))
            }
            FieldKind::Email => {
                let s = validate::trim(&validate::as_string(raw).map_err(mapped)?);
                validate::check_maxlength(&s, 255).map_err(|m| self.fail(m, raw))?;
                validate::check_email(&s).map_err(|m| self.fail(m, raw))?;
                Ok(Value::String(s))
            }
            FieldKind::Password {
                maxlength,
                minlength,
            } => {
                let s = validate::as_string(raw).map_err(mapped)?;
                validate::check_maxlength(&s, *maxlength).map_err(|m| self.fail(m, raw))?;
                if let Some(n) = minlength {
                    validate::check_minlength(&s, *n).map_err(|m| self.fail(m, raw))?;
                }
                Ok(Value::String(s))
            }
            FieldKind::Sfzh => {
                let s = validate::delete_spaces(&validate::as_string(raw).map_err(mapped)?);
                validate::check_sfzh(&s).map_err(|m| self.fail(m, raw))?;
                Ok(Value::String(s))
            }
            FieldKind::Integer { min, max, .. } => {
                let n = validate::as_integer(raw).map_err(mapped)?;
                if let Some(lo) = min {
                    validate::check_min(n as f64, *lo as f64).map_err(|m| self.fail(m, raw))?;
                }
                if let Some(hi) = max {
                    validate::check_max(n as f64, *hi as f64).map_err(|m| self.fail(m, raw))?;
                }
                Ok(json!(n))
            }
            FieldKind::Float { min, max } => {
                let n = validate::as_float(raw).map_err(mapped)?;
                if let Some(lo) = min {
                    validate::check_min(n, *lo).map_err(|m| self.fail(m, raw))?;
                }
                if let Some(hi) = max {
                    validate::check_max(n, *hi).map_err(|m| self.fail(m, raw))?;
                }
                Ok(json!(n))
            }
            FieldKind::Year => {
                let n = validate::as_integer(raw).map_err(mapped)?;
                if (1000..=9999).contains(&n) {
                    Ok(json!(n))
                } else {
                    Err(self.fail("year must be between 1000 and 9999", raw))
                }
            }
            FieldKind::Month => {
                let n = validate::as_integer(raw).map_err(mapped)?;
                if (1..=12).contains(&n) {
                    Ok(json!(n))
                } else {
                    Err(self.fail("month must be between 1 and 12", raw))
                }
            }
            FieldKind::YearMonth => {
                let s = validate::as_year_month(raw).map_err(mapped)?;
                Ok(Value::String(s))
            }
            FieldKind::Boolean => {
                let b = validate::as_boolean(raw).map_err(mapped)?;
                Ok(Value::Bool(b))
            }
            FieldKind::Date => {
                let s = validate::as_date(raw, None).map_err(mapped)?;
                Ok(Value::String(s))
            }
            FieldKind::Time => {
                let s = validate::as_time(raw).map_err(mapped)?;
                Ok(Value::String(s))
            }
            FieldKind::Datetime { .. } => {
                let s = validate::as_datetime(raw).map_err(mapped)?;
                Ok(Value::String(s))
            }
            FieldKind::Json => Ok(raw.clone()),
            FieldKind::ForeignKey(_) => {
                // The stored value has the referenced column's type.
                if is_string_db_type(&self.db_type) {
                    let s = validate::as_string(raw).map_err(mapped)?;
                    Ok(Value::String(s))
                } else if matches!(
                    self.db_type.as_str(),
                    "integer" | "serial" | "bigint" | "smallint"
                ) {
                    let n = validate::as_integer(raw).map_err(mapped)?;
                    Ok(json!(n))
                } else {
                    Ok(raw.clone())
                }
            }
            FieldKind::Array(element) => {
                let Value::Array(items) = raw else {
                    return Err(self.fail("expected a list", raw));
                };
                let mut cleaned = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let v = element.validate(item).map_err(|e| {
                        self.fail(e.message, item).with_index(i)
                    })?;
                    cleaned.push(v);
                }
                Ok(Value::Array(cleaned))
            }
            FieldKind::Table(table) => {
                let Value::Array(rows) = raw else {
                    return Err(self.fail("expected a list of rows", raw));
                };
                if rows.len() > table.max_rows {
                    return Err(self.fail(
                        format!("cannot contain more than {} rows", table.max_rows),
                        raw,
                    ));
                }
                let mut cleaned = Vec::with_capacity(rows.len());
                for (i, row) in rows.iter().enumerate() {
                    let Value::Object(map) = row else {
                        return Err(self.fail("row must be an object", row).with_index(i));
                    };
                    let validated = table.model.validate_create(map).map_err(|e| {
                        let message = e
                            .validation()
                            .map_or_else(|| e.to_string(), |v| v.to_string());
                        self.fail(message, row).with_index(i)
                    })?;
                    cleaned.push(Value::Object(validated));
                }
                Ok(Value::Array(cleaned))
            }
            // Payload checks belong to the upload collaborator; only the
            // shape is enforced here.
            FieldKind::Attachment(_) => match raw {
                Value::String(_) | Value::Object(_) => Ok(raw.clone()),
                Value::Array(items) if items.len() == 1 => Ok(items[0].clone()),
                _ => Err(self.fail("expected a single attachment", raw)),
            },
            FieldKind::AttachmentList(_) => match raw {
                Value::Array(_) => Ok(raw.clone()),
                _ => Err(self.fail("expected a list of attachments", raw)),
            },
        }
    }

    fn check_choices(&self, cleaned: &Value) -> std::result::Result<(), ValidationError> {
        let choices = self.effective_choices();
        if choices.is_empty() || !self.strict {
            return Ok(());
        }
        if choices.iter().any(|c| &c.value == cleaned) {
            return Ok(());
        }
        let message = self.error_messages.get("choices").cloned().unwrap_or_else(|| {
            let mut shown: Vec<String> = choices
                .iter()
                .take(self.max_display_count)
                .map(|c| c.label.clone())
                .collect();
            if choices.len() > self.max_display_count {
                shown.push("...".to_string());
            }
            format!("invalid choice, must be one of: {}", shown.join(", "))
        });
        Err(self.fail(message, cleaned))
    }

    /// Declared choices, or the remotely resolved cache when present.
    #[must_use]
    pub fn effective_choices(&self) -> &[Choice] {
        if !self.choices.is_empty() {
            return &self.choices;
        }
        self.resolved_choices.get().map_or(&[], Vec::as_slice)
    }

    /// Fetch and cache remote choices. Idempotent: the first successful
    /// fetch wins and later calls return the cached list.
    pub fn resolve_choices(&self, client: &dyn SchemaClient) -> Result<&[Choice]> {
        if !self.choices.is_empty() {
            return Ok(&self.choices);
        }
        let Some(url) = &self.choices_url else {
            return Ok(&[]);
        };
        if let Some(cached) = self.resolved_choices.get() {
            return Ok(cached);
        }
        let payload = client.fetch(url)?;
        let items = match &payload {
            Value::Array(items) => items.as_slice(),
            Value::Object(obj) => obj
                .get("data")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    Error::Query(format!("choices payload from {url} has no data array"))
                })?,
            _ => return Err(Error::Query(format!("invalid choices payload from {url}"))),
        };
        let parsed = items.iter().map(Choice::from_json).collect::<Result<Vec<_>>>()?;
        Ok(self.resolved_choices.get_or_init(|| parsed))
    }

    /// A fresh default value. Generators are invoked, literals cloned, and
    /// auto-now datetimes produce the current local time. Plain string
    /// kinds fall back to `""` unless the field is a primary or unique key.
    #[must_use]
    pub fn get_default(&self) -> Option<Value> {
        match &self.default {
            Some(FieldDefault::Value(v)) => Some(v.clone()),
            Some(FieldDefault::Generator(g)) => Some(g()),
            None => match &self.kind {
                FieldKind::Datetime {
                    auto_now,
                    auto_now_add,
                } if *auto_now || *auto_now_add => Some(Value::String(validate::localtime())),
                FieldKind::String { .. }
                | FieldKind::Text
                | FieldKind::Email
                | FieldKind::Password { .. }
                    if !self.primary_key && !self.unique =>
                {
                    Some(Value::String(String::new()))
                }
                _ => None,
            },
        }
    }

    /// Display transform. Lists normalize to arrays so form layers never
    /// see a scalar where the field is plural.
    #[must_use]
    pub fn to_form_value(&self, value: &Value) -> Value {
        match &self.kind {
            FieldKind::Array(_) | FieldKind::Table(_) | FieldKind::AttachmentList(_) => {
                match value {
                    Value::Array(_) => value.clone(),
                    _ => Value::Array(Vec::new()),
                }
            }
            _ => value.clone(),
        }
    }

    /// Wire transform, the inverse direction of [`Field::to_form_value`].
    /// Single attachments posted as one-element lists collapse to the
    /// element.
    #[must_use]
    pub fn to_post_value(&self, value: &Value) -> Value {
        match &self.kind {
            FieldKind::Attachment(_) => match value {
                Value::Array(items) if items.len() == 1 => items[0].clone(),
                _ => value.clone(),
            },
            FieldKind::Array(_) | FieldKind::AttachmentList(_) => match value {
                Value::Array(_) => value.clone(),
                _ => Value::Array(Vec::new()),
            },
            _ => value.clone(),
        }
    }

    /// Storage transform: empty optional scalars become NULL, structured
    /// kinds encode to text for jsonb columns, auto-now datetimes take the
    /// current time.
    pub fn prepare_for_db(&self, value: &Value) -> Result<SqlValue> {
        if let FieldKind::Datetime { auto_now: true, .. } = self.kind {
            return Ok(SqlValue::Str(validate::localtime()));
        }
        if validate::is_empty_input(Some(value)) {
            return Ok(SqlValue::Null);
        }
        match &self.kind {
            FieldKind::Json
            | FieldKind::Array(_)
            | FieldKind::Table(_)
            | FieldKind::AttachmentList(_) => {
                let text = validate::encode_json(value).map_err(Error::Encoding)?;
                Ok(SqlValue::Str(text))
            }
            _ => SqlValue::from_json(value),
        }
    }

    /// Result-row transform: jsonb text decodes back to structured values.
    #[must_use]
    pub fn load(&self, value: Value) -> Value {
        match &self.kind {
            FieldKind::Json
            | FieldKind::Array(_)
            | FieldKind::Table(_)
            | FieldKind::AttachmentList(_) => match &value {
                Value::String(s) => validate::decode_json(s).unwrap_or(value),
                _ => value,
            },
            _ => value,
        }
    }

    /// Serializable summary for admin/form layers.
    #[must_use]
    pub fn describe(&self) -> Value {
        let mut out = Map::new();
        out.insert("name".to_string(), json!(self.name));
        out.insert("label".to_string(), json!(self.label));
        out.insert("type".to_string(), json!(self.kind.type_name()));
        out.insert("db_type".to_string(), json!(self.db_type));
        out.insert("required".to_string(), json!(self.required));
        out.insert("unique".to_string(), json!(self.unique));
        out.insert("primary_key".to_string(), json!(self.primary_key));
        if let Some(hint) = &self.hint {
            out.insert("hint".to_string(), json!(hint));
        }
        if let Some(tag) = &self.tag {
            out.insert("tag".to_string(), json!(tag));
        }
        let choices = self.effective_choices();
        if !choices.is_empty() {
            let list: Vec<Value> = choices
                .iter()
                .map(|c| {
                    json!({
                        "value": c.value,
                        "label": c.label,
                        "hint": c.hint,
                    })
                })
                .collect();
            out.insert("choices".to_string(), Value::Array(list));
        }
        Value::Object(out)
    }

    /// The referenced model for foreign keys, resolving self references
    /// against the owning model.
    pub fn fk_model<'a>(&'a self, owner: &'a Arc<Model>) -> Option<&'a Arc<Model>> {
        match &self.kind {
            FieldKind::ForeignKey(fk) => match &fk.reference {
                FkRef::Model(model) => Some(model),
                FkRef::SelfRef => Some(owner),
                FkRef::Url(_) => None,
            },
            _ => None,
        }
    }
}

fn fk_db_type(model: &Model, column: &str) -> Result<String> {
    let target = model.fields.get(column).ok_or_else(|| {
        Error::construction(format!(
            "foreign key column {column} does not exist on {}",
            model.table_name
        ))
    })?;
    if !target.primary_key && !target.unique {
        return Err(Error::construction(format!(
            "foreign key column {column} on {} must be a primary key or unique",
            model.table_name
        )));
    }
    Ok(match target.db_type.as_str() {
        "serial" => "integer".to_string(),
        other => other.to_string(),
    })
}

fn check_label_column(model: &Model, column: &str) -> Result<()> {
    if model.fields.contains_key(column) {
        return Ok(());
    }
    // One further hop through the referenced model's own foreign key.
    if let Some((fk_name, rest)) = column.split_once("__") {
        if let Some(field) = model.fields.get(fk_name) {
            if let FieldKind::ForeignKey(fk) = &field.kind {
                if let FkRef::Model(next) = &fk.reference {
                    if next.fields.contains_key(rest) {
                        return Ok(());
                    }
                }
            }
        }
    }
    Err(Error::construction(format!(
        "invalid label column {column} for {}",
        model.table_name
    )))
}
