pub mod memory;
pub mod models;
pub mod repository;
pub mod schema;
pub mod store;

pub use memory::MemoryStore;
pub use repository::Repository;
pub use schema::{CountFilter, IndexSpec, SchemaSpec};
pub use store::{FailureKind, ObservationStore, UpsertOutcome};
