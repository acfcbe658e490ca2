pub mod db;
mod documents;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError, PurgeStats};
pub use documents::VersionCommit;
pub use tables::*;
