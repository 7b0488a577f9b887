//! Database module: entity models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions over the request tracker and the run log.
//!
//! External modules import from `srsmail::db`; the repository API and the
//! row models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::ProcessedRequest;
