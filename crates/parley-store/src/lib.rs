pub mod context;
pub mod database;
pub mod error;
pub mod profiles;
pub mod schema;

pub use context::{ContextStore, ContextVersion, InMemoryContextStore, SqliteContextStore};
pub use database::Database;
pub use error::StoreError;
pub use profiles::AgentProfileRepo;
