//! Core types for Xodel: fields, validators, and model normalization.
//!
//! `xodel-core` is the **foundation layer** for the workspace. It defines
//! the data model everything else builds on.
//!
//! # Role In The Architecture
//!
//! - **Validator library**: pure value checks in [`validate`], composed
//!   into per-kind chains by [`field`].
//! - **Field registry**: [`Field`] plus the closed [`FieldKind`] variant
//!   set covers every supported column type, including foreign keys,
//!   arrays, nested tables, and attachments.
//! - **Model descriptors**: [`ModelSpec`] declarations normalize through
//!   inheritance and mixins into immutable [`Model`] values.
//! - **Collaborator seams**: [`Queryer`] and [`SchemaClient`] are the only
//!   places the core touches a database or the network, and both are
//!   injected.
//!
//! # Who Uses This Crate
//!
//! - `xodel-query` consumes [`Model`] metadata and [`SqlValue`] to render
//!   statements.
//! - The `xodel` facade layers records and lifecycle operations on top.
//!
//! Most applications should use the `xodel` facade; reach for `xodel-core`
//! directly when integrating a driver or building tooling over model
//! metadata.

pub mod client;
pub mod error;
pub mod field;
pub mod keywords;
pub mod model;
pub mod validate;
pub mod value;

pub use client::{Queryer, Row, SchemaClient};
pub use error::{Error, Result, ValidationError};
pub use field::{
    AttachmentKind, Choice, Field, FieldDefault, FieldKind, FkRef, ForeignKeyKind,
    ReferentialAction, TableKind, is_string_db_type,
};
pub use model::{DEFAULT_PRIMARY_KEY, Model, ModelSpec, check_reserved, merge_specs};
pub use value::SqlValue;
