pub mod access;
pub mod auth;
pub mod comments;
pub mod error;
pub mod models;
pub mod openapi;
pub mod papers;
pub mod password;
pub mod rate_limit; // in-memory rate limiting
pub mod repo;
pub mod routes;
pub mod security;
pub mod storage; // attachment files for answers and comments
pub mod votes;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
