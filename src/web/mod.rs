pub mod auth;
pub mod routes;

pub use auth::{ClientCredentials, RequestCredentials};
pub use routes::{create_router, AppState};
