use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{mpsc, oneshot};

use crate::config::WriteMode;
use crate::error::TokenError;
use crate::models::TokenComponent;
use crate::storage::Storage;

type Components = HashMap<String, TokenComponent>;

/// Async handle to the durable token cache.
///
/// The SQLite connection lives on a dedicated `token-store` thread; callers
/// talk to it through a command channel, so the handle is cheap to clone and
/// safe to share across tasks.
#[derive(Clone)]
pub struct TokenStore {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

enum StoreCommand {
    GetTokens {
        component_types: Vec<String>,
        reply: oneshot::Sender<Result<Option<Components>, TokenError>>,
    },
    SetTokens {
        tokens: Components,
        reply: oneshot::Sender<Result<(), TokenError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), TokenError>>,
    },
    ComponentTypes {
        reply: oneshot::Sender<Result<Vec<(String, usize)>, TokenError>>,
    },
}

impl TokenStore {
    pub fn open(path: &Path, write_mode: WriteMode) -> Result<Self, TokenError> {
        let storage = Storage::open(path, write_mode)
            .inspect_err(|e| tracing::error!("Failed to open token store: {e}"))?;
        Self::spawn(storage)
    }

    pub fn open_memory(write_mode: WriteMode) -> Result<Self, TokenError> {
        Self::spawn(Storage::open_memory(write_mode)?)
    }

    pub(crate) fn spawn(storage: Storage) -> Result<Self, TokenError> {
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("token-store".into())
            .spawn(move || actor_loop(storage, rx))
            .inspect_err(|e| tracing::error!("Failed to spawn token store thread: {e}"))?;

        Ok(Self { tx })
    }

    /// Union of stored entries for the requested types, or `None` on a miss.
    pub async fn get_tokens(
        &self,
        component_types: Vec<String>,
    ) -> Result<Option<Components>, TokenError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::GetTokens {
            component_types,
            reply,
        })?;
        rx.await.unwrap_or(Err(TokenError::StoreClosed))
    }

    pub async fn set_tokens(&self, tokens: Components) -> Result<(), TokenError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::SetTokens { tokens, reply })?;
        rx.await.unwrap_or(Err(TokenError::StoreClosed))
    }

    pub async fn clear(&self) -> Result<(), TokenError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Clear { reply })?;
        rx.await.unwrap_or(Err(TokenError::StoreClosed))
    }

    pub async fn component_types(&self) -> Result<Vec<(String, usize)>, TokenError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::ComponentTypes { reply })?;
        rx.await.unwrap_or(Err(TokenError::StoreClosed))
    }

    fn send(&self, cmd: StoreCommand) -> Result<(), TokenError> {
        self.tx.send(cmd).map_err(|_| TokenError::StoreClosed)
    }
}

fn actor_loop(mut storage: Storage, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::GetTokens {
                component_types,
                reply,
            } => {
                let _ = reply.send(storage.get_tokens(&component_types));
            }
            StoreCommand::SetTokens { tokens, reply } => {
                let _ = reply.send(storage.set_tokens(&tokens));
            }
            StoreCommand::Clear { reply } => {
                let _ = reply.send(storage.clear());
            }
            StoreCommand::ComponentTypes { reply } => {
                let _ = reply.send(storage.component_types());
            }
        }
    }
    tracing::debug!("token store actor stopped");
}
