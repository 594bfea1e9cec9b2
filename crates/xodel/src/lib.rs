//! Xodel: schema-driven models, validation, and SQL statement building.
//!
//! This is the facade crate. It re-exports the model and field machinery
//! from `xodel-core`, the statement builder from `xodel-query`, and adds
//! the record layer on top.
//!
//! # Role In The Architecture
//!
//! - [`ModelOps`] binds one [`Model`] to an injected [`Queryer`] and runs
//!   the full lifecycle: validate, prepare, render, execute, load.
//! - [`Record`] is a loaded row paired with its model, the unit every read
//!   operation returns.
//! - [`Sql`] remains reachable for queries the lifecycle surface does not
//!   cover; [`ModelOps::sql`] hands out builders already bound to a model.
//!
//! # Quick Tour
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::{json, Map, Value};
//! use xodel::{Field, ModelOps, ModelSpec, Queryer};
//!
//! fn run(queryer: Arc<dyn Queryer>) -> xodel::Result<()> {
//!     let author = ModelSpec::new("author")
//!         .field(Field::string("name").required().unique())
//!         .field(Field::integer("age"))
//!         .materialize()?;
//!     let authors = ModelOps::new(author, queryer);
//!
//!     let mut input = Map::new();
//!     input.insert("name".to_string(), json!("tom"));
//!     let record = authors.create(&input)?;
//!     let _id: Option<&Value> = record.key();
//!     Ok(())
//! }
//! ```

pub mod ops;
pub mod record;

pub use ops::ModelOps;
pub use record::Record;

pub use xodel_core::{
    Choice, Error, Field, FieldDefault, FieldKind, FkRef, ForeignKeyKind, Model, ModelSpec,
    Queryer, Result, Row, SchemaClient, SqlValue, TableKind, ValidationError, check_reserved,
    merge_specs,
};
pub use xodel_query::Sql;
