use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;

use crate::models::JournalEntry;

/// Local audit trail of processing attempts. Not consulted for deduplication.
pub struct Journal {
    conn: Connection,
}

impl Journal {
    pub fn open(path: &Path) -> SqlResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn in_memory() -> SqlResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqlResult<Self> {
        let mut journal = Journal { conn };
        journal.run_migrations()?;
        Ok(journal)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![(
            "001_create_processing_log.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/migrations/001_create_processing_log.sql"
            )),
        )];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    pub fn record(&self, entry: &JournalEntry) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_log (
                id, file_name, file_hash, outcome, rows_appended, message, extracted_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.file_name,
                entry.file_hash,
                entry.outcome,
                entry.rows_appended,
                entry.message,
                entry.extracted_json,
                entry.created_at
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn entries_for(&self, file_name: &str) -> SqlResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_name, file_hash, outcome, rows_appended, message, extracted_json, created_at
             FROM processing_log
             WHERE file_name = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![file_name], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                file_name: row.get(1)?,
                file_hash: row.get(2)?,
                outcome: row.get(3)?,
                rows_appended: row.get(4)?,
                message: row.get(5)?,
                extracted_json: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count_by_outcome(&self, outcome: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM processing_log WHERE outcome = ?1",
            params![outcome],
            |row| row.get(0),
        )
    }
}
