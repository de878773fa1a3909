pub mod entities;
pub mod join_sync;
pub mod queries;
pub mod upsert;

pub use upsert::{Entity, Repository, SaveReport};
