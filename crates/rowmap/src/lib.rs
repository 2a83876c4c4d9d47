//! Map in-memory records to rows of a relational store.
//!
//! A [`Mapper`] owns the schema registry and the per-table caches for one
//! store. Queries are built per call with [`Mapper::table`] and finished with
//! one of the terminal operations on [`Query`].

pub mod cache;
pub mod compile;
pub mod config;
pub mod dialect;
pub mod mapper;
pub mod materialize;
pub mod metadata;
pub mod query;
pub mod record;
pub mod schema;
pub mod spec;
pub mod store;
pub mod value;

pub use compile::{Action, Statement, render_statement};
pub use config::MapperConfig;
pub use dialect::{Dialect, DialectCapabilities};
pub use mapper::Mapper;
pub use metadata::InformationSchemaMetadata;
pub use query::Query;
pub use record::Record;
pub use rowmap_error::{ErrorKind, MapperError, Result, StoreError, StoreErrorCode};
pub use schema::Schema;
pub use spec::Direction;
pub use store::{ExecResult, ResultSet, StaticMetadata, Store, TableDescription, TableMetadata};
pub use value::{FieldValue, Value};
