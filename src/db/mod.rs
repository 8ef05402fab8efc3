mod schema;
mod models;
pub mod snapshot;

pub use schema::Database;
pub use models::{GraphType, RowRecord};
