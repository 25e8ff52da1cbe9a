pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod validation;
pub mod worker;

pub use config::TokenConfig;
pub use error::TokenError;
pub use manager::{initialize_token_system, Subscription, TokenManager};
pub use models::{TokenComponent, TokenComponentInput, TokenKind, TokenState, TokenValue};
pub use scheduler::SchedulerStats;
