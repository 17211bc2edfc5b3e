use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::im::UserId;
use crate::store::Vault;

/// Per-user, per-platform credential records: JSON sealed by the [`Vault`].
#[derive(Clone)]
pub struct CredentialStore {
    conn: Arc<Mutex<Connection>>,
    vault: Arc<Vault>,
}

impl CredentialStore {
    pub fn new(conn: Arc<Mutex<Connection>>, vault: Arc<Vault>) -> Self {
        Self { conn, vault }
    }

    /// Insert or replace the record for `(user, platform)`.
    pub async fn save<T: Serialize>(
        &self,
        user: UserId,
        platform: &str,
        record: &T,
    ) -> Result<()> {
        let json = serde_json::to_vec(record).context("Failed to encode credentials")?;
        let data = self.vault.seal(&json)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO credentials (user_id, platform, data, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, platform)
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            rusqlite::params![user.0 as i64, platform, data, now],
        )
        .with_context(|| format!("Failed to save {} credentials for user {}", platform, user))?;
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        user: UserId,
        platform: &str,
    ) -> Result<Option<T>> {
        let data: Option<String> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT data FROM credentials WHERE user_id = ?1 AND platform = ?2",
                rusqlite::params![user.0 as i64, platform],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load {} credentials for user {}", platform, user))?
        };
        let Some(sealed) = data else {
            return Ok(None);
        };
        let json = self
            .vault
            .open(&sealed)
            .with_context(|| format!("Failed to open {} credentials for user {}", platform, user))?;
        serde_json::from_slice(&json)
            .map(Some)
            .context("Failed to decode credentials")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Account {
        server: String,
        token: String,
    }

    fn account(token: &str) -> Account {
        Account {
            server: "https://social.example".to_string(),
            token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = Store::open_in_memory().unwrap().credentials();
        store.save(UserId(1), "mastodon", &account("t1")).await.unwrap();

        let loaded: Option<Account> = store.load(UserId(1), "mastodon").await.unwrap();
        assert_eq!(loaded, Some(account("t1")));
    }

    #[tokio::test]
    async fn test_secrets_are_not_stored_in_clear() {
        let store = Store::open_in_memory().unwrap().credentials();
        store
            .save(UserId(1), "bluesky", &account("hunter2-secret"))
            .await
            .unwrap();

        let raw: String = store
            .conn
            .lock()
            .await
            .query_row("SELECT data FROM credentials", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("hunter2-secret"));
        assert!(!raw.contains("social.example"));
    }

    #[tokio::test]
    async fn test_other_passphrase_cannot_load() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        Store::run_migrations(&*conn.lock().await).unwrap();
        let writer = CredentialStore::new(
            conn.clone(),
            Arc::new(Vault::from_passphrase("right").unwrap()),
        );
        let reader = CredentialStore::new(conn, Arc::new(Vault::from_passphrase("wrong").unwrap()));

        writer.save(UserId(1), "mastodon", &account("t1")).await.unwrap();
        let err = reader.load::<Account>(UserId(1), "mastodon").await.unwrap_err();
        assert!(format!("{:#}", err).contains("decrypt"));
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = Store::open_in_memory().unwrap().credentials();
        let loaded: Option<Account> = store.load(UserId(1), "mastodon").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_and_is_scoped() {
        let store = Store::open_in_memory().unwrap().credentials();
        store.save(UserId(1), "mastodon", &account("old")).await.unwrap();
        store.save(UserId(1), "mastodon", &account("new")).await.unwrap();
        store.save(UserId(2), "mastodon", &account("other")).await.unwrap();

        let mine: Option<Account> = store.load(UserId(1), "mastodon").await.unwrap();
        assert_eq!(mine, Some(account("new")));
        let bsky: Option<Account> = store.load(UserId(1), "bluesky").await.unwrap();
        assert!(bsky.is_none());
    }
}
