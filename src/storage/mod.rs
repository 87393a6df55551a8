//! Persistence facade: shared connection pool and typed upsert/query
//! operations over the relational schema.

mod db;
mod facade;

pub use db::*;
pub use facade::*;
