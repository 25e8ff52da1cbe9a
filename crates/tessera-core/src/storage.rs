use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, Row};

use crate::config::WriteMode;
use crate::error::TokenError;
use crate::models::{now_millis, TokenComponent};

const SCHEMA_V1: &str = include_str!("../migrations/001_token_component.sql");

/// SQLite-backed durable cache of token components, keyed by component type.
pub struct Storage {
    conn: Connection,
    write_mode: WriteMode,
}

impl Storage {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path, write_mode: WriteMode) -> Result<Self, TokenError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        run_migrations(&conn)?;
        Ok(Self { conn, write_mode })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory(write_mode: WriteMode) -> Result<Self, TokenError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn, write_mode })
    }

    /// Drop the component table so every read and write fails.
    #[cfg(test)]
    pub(crate) fn break_schema(&self) -> Result<(), TokenError> {
        self.conn.execute_batch("DROP TABLE token_component;")?;
        Ok(())
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Union of all stored entries whose type is requested.
    ///
    /// Returns `None` when none of the requested types has any rows.
    pub fn get_tokens(
        &self,
        component_types: &[String],
    ) -> Result<Option<HashMap<String, TokenComponent>>, TokenError> {
        if component_types.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; component_types.len()].join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, component_type, value, processed, timestamp
             FROM token_component WHERE component_type IN ({placeholders})"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(component_types.iter()), row_to_raw)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = HashMap::with_capacity(rows.len());
        for raw in rows {
            let component = raw.into_component()?;
            out.insert(component.id.clone(), component);
        }
        Ok((!out.is_empty()).then_some(out))
    }

    /// Persist entries grouped by type, in one transaction.
    pub fn set_tokens(&mut self, tokens: &HashMap<String, TokenComponent>) -> Result<(), TokenError> {
        let mut by_type: BTreeMap<&str, Vec<&TokenComponent>> = BTreeMap::new();
        for component in tokens.values() {
            by_type.entry(component.kind.as_str()).or_default().push(component);
        }

        let replace = self.write_mode == WriteMode::Replace;
        let written_at = now_millis();
        let tx = self.conn.transaction()?;
        {
            let mut delete_type =
                tx.prepare("DELETE FROM token_component WHERE component_type = ?1")?;
            let mut upsert = tx.prepare(
                "INSERT INTO token_component (id, component_type, value, processed, timestamp, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   component_type = excluded.component_type,
                   value = excluded.value,
                   processed = excluded.processed,
                   timestamp = excluded.timestamp,
                   written_at = excluded.written_at",
            )?;

            for (kind, components) in &by_type {
                if replace {
                    delete_type.execute(params![kind])?;
                }
                for component in components {
                    let value = serde_json::to_string(&component.value)?;
                    upsert.execute(params![
                        component.id,
                        kind,
                        value,
                        component.processed,
                        component.timestamp,
                        written_at,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Wipe all persisted state.
    pub fn clear(&self) -> Result<(), TokenError> {
        self.conn.execute("DELETE FROM token_component", [])?;
        Ok(())
    }

    /// Component types with at least one stored entry, with entry counts.
    pub fn component_types(&self) -> Result<Vec<(String, usize)>, TokenError> {
        let mut stmt = self.conn.prepare(
            "SELECT component_type, COUNT(*) FROM token_component
             GROUP BY component_type ORDER BY component_type",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Row as read from SQLite, before the JSON payload is decoded.
struct RawComponent {
    id: String,
    kind: String,
    value: String,
    processed: bool,
    timestamp: i64,
}

impl RawComponent {
    fn into_component(self) -> Result<TokenComponent, TokenError> {
        Ok(TokenComponent {
            id: self.id,
            kind: self.kind,
            value: serde_json::from_str(&self.value)?,
            processed: self.processed,
            timestamp: self.timestamp,
        })
    }
}

fn row_to_raw(row: &Row) -> rusqlite::Result<RawComponent> {
    Ok(RawComponent {
        id: row.get(0)?,
        kind: row.get(1)?,
        value: row.get(2)?,
        processed: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn run_migrations(conn: &Connection) -> Result<(), TokenError> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}
