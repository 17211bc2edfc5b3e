pub mod credentials;
pub mod vault;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use credentials::CredentialStore;
pub use vault::Vault;

/// Thread-safe SQLite database holding linked platform accounts, sealed
/// with `vault`.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    vault: Arc<Vault>,
}

impl Store {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path, vault: Vault) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Migrate before wrapping in the async Mutex so no lock is needed here.
        Self::run_migrations(&conn)?;

        info!("Credential store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vault: Arc::new(vault),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vault: Arc::new(Vault::from_passphrase("test passphrase")?),
        })
    }

    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(self.conn.clone(), self.vault.clone())
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS credentials (
                user_id INTEGER NOT NULL,
                platform TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, platform)
            );
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }
}
