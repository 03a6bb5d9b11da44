pub mod database;
pub mod error;
pub mod merge;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod title;
pub mod tree;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionState, SessionStateRepo};
pub use title::derive_title;
pub use tree::MessageTree;
