pub mod models;
pub mod queries;

pub use models::{Client, NewClient};
pub use queries::{connect, init_db, ClientRepo, DbPool};
