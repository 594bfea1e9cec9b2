//! SQL statement rendering for Xodel.
//!
//! This crate turns model metadata from `xodel-core` into canonical
//! PostgreSQL statement text. It never talks to a database.
//!
//! # Role In The Architecture
//!
//! - **Escaping**: [`escape`] renders [`xodel_core::SqlValue`] as quoted
//!   literals, raw tokens, and parenthesized lists.
//! - **Condition operators**: [`cond`] maps dotted-path operator suffixes
//!   (`contains`, `gte`, `null`, ...) to SQL fragments.
//! - **The builder**: [`Sql`] accumulates the clauses of one statement
//!   (selects, dotted-path joins, CTE-based bulk writes, upsert, merge,
//!   align, set operations) and renders the final text.
//!
//! The `xodel` facade pairs these builders with validated rows and an
//! injected executor.

pub mod builder;
pub mod cond;
pub mod escape;

pub use builder::Sql;
pub use escape::{as_literal, as_literal_unbracketed, as_token, quote_literal};
