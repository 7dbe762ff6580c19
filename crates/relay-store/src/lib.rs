pub mod database;
pub mod error;
pub mod file;
pub mod history;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use file::JsonFileHistoryStore;
pub use history::HistoryStore;
pub use sqlite::SqliteHistoryStore;
