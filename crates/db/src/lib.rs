pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod retry;

pub use connection::{connect, connect_with_settings, DbPool};
pub use retry::{with_backoff, RetryPolicy};
