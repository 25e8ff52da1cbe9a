use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::TokenComponent;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// An immutable point-in-time view of token components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenState {
    pub components: HashMap<String, TokenComponent>,
    /// Epoch millis of snapshot assembly.
    pub timestamp: i64,
}

impl TokenState {
    pub fn new(components: HashMap<String, TokenComponent>) -> Self {
        Self {
            components,
            timestamp: now_millis(),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn get(&self, id: &str) -> Option<&TokenComponent> {
        self.components.get(id)
    }

    /// Union with `other`; entries from `other` overwrite same ids.
    pub fn merge(&mut self, other: TokenState) {
        self.components.extend(other.components);
        self.timestamp = self.timestamp.max(other.timestamp);
    }

    /// Entries whose component type equals `kind`, stamped with `timestamp`.
    pub fn filter_kind(&self, kind: &str, timestamp: i64) -> TokenState {
        let components = self
            .components
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        TokenState {
            components,
            timestamp,
        }
    }

    /// Distinct component types present in this snapshot.
    pub fn kinds(&self) -> BTreeSet<&str> {
        self.components.values().map(|c| c.kind.as_str()).collect()
    }
}

impl FromIterator<TokenComponent> for TokenState {
    fn from_iter<I: IntoIterator<Item = TokenComponent>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|c| (c.id.clone(), c)).collect())
    }
}
