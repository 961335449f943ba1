//! MongoDB persistence layer

pub mod mongo;
pub mod schemas;

pub use mongo::{is_duplicate_key, map_write_error, IntoIndexes, MongoClient, MongoCollection, MutMetadata};
