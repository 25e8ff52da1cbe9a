mod state;
mod token;

pub use state::{now_millis, TokenState};
pub use token::{TokenComponent, TokenComponentInput, TokenKind, TokenValue};
