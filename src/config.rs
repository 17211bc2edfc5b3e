use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Overrides `storage.secret_key`, so the passphrase can stay out of the file.
pub const SECRET_KEY_ENV: &str = "CROSSPOSTER_SECRET_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mastodon: MastodonConfig,
    #[serde(default)]
    pub bluesky: BlueskyConfig,
    #[serde(default)]
    pub posting: PostingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub allowed_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    /// Passphrase the stored credentials are encrypted with.
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            secret_key: None,
        }
    }
}

impl StorageConfig {
    /// The credential passphrase from the environment, else from the file.
    pub fn secret_key(&self) -> Result<String> {
        resolve_secret_key(std::env::var(SECRET_KEY_ENV).ok(), self.secret_key.as_deref())
    }
}

fn resolve_secret_key(env: Option<String>, configured: Option<&str>) -> Result<String> {
    env.filter(|key| !key.is_empty())
        .or_else(|| configured.filter(|key| !key.is_empty()).map(str::to_string))
        .with_context(|| {
            format!("Set {SECRET_KEY_ENV} or storage.secret_key to encrypt stored credentials")
        })
}

#[derive(Debug, Deserialize, Clone)]
pub struct MastodonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name shown on the user's authorized apps page.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_website")]
    pub website: String,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for MastodonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_name: default_client_name(),
            website: default_website(),
            scopes: default_scopes(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlueskyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// PDS the accounts live on.
    #[serde(default = "default_bluesky_service")]
    pub service_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_url: default_bluesky_service(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostingConfig {
    /// Languages given to `/new` drafts that name none.
    #[serde(default)]
    pub default_langs: Vec<String>,
    /// Upper bound on one platform's whole publish, uploads included.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            default_langs: Vec::new(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("crossposter.db")
}

fn default_client_name() -> String {
    "Crossposter".to_string()
}

fn default_website() -> String {
    "https://github.com/crossposter/crossposter".to_string()
}

fn default_scopes() -> String {
    "read write".to_string()
}

fn default_bluesky_service() -> String {
    "https://bsky.social".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    120
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        if config.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token must not be empty");
        }
        if config.telegram.allowed_user_ids.is_empty() {
            bail!("telegram.allowed_user_ids must list at least one user");
        }
        if config.mastodon.request_timeout_secs == 0
            || config.bluesky.request_timeout_secs == 0
            || config.posting.publish_timeout_secs == 0
        {
            bail!("timeouts must be at least one second");
        }
        Ok(config)
    }

    /// Names of the enabled publishing platforms, for startup logs.
    pub fn enabled_platforms(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.mastodon.enabled {
            names.push("mastodon");
        }
        if self.bluesky.enabled {
            names.push("bluesky");
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [telegram]
        bot_token = "123:abc"
        allowed_user_ids = [42]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.telegram.allowed_user_ids, vec![42]);
        assert_eq!(config.storage.database_path, PathBuf::from("crossposter.db"));
        assert!(config.mastodon.enabled);
        assert_eq!(config.mastodon.scopes, "read write");
        assert_eq!(config.bluesky.service_url, "https://bsky.social");
        assert!(config.posting.default_langs.is_empty());
        assert_eq!(config.posting.publish_timeout_secs, 120);
        assert_eq!(config.mastodon.request_timeout_secs, 30);
        assert_eq!(config.bluesky.request_timeout_secs, 30);
        assert_eq!(config.enabled_platforms(), vec!["mastodon", "bluesky"]);
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            [telegram]
            bot_token = "123:abc"
            allowed_user_ids = [1, 2]

            [storage]
            database_path = "/var/lib/crossposter/db.sqlite"
            secret_key = "s3cret"

            [mastodon]
            enabled = false

            [bluesky]
            service_url = "https://pds.example"

            [posting]
            default_langs = ["es", "en"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/var/lib/crossposter/db.sqlite")
        );
        assert_eq!(config.storage.secret_key.as_deref(), Some("s3cret"));
        assert!(!config.mastodon.enabled);
        assert_eq!(config.mastodon.client_name, "Crossposter");
        assert_eq!(config.bluesky.service_url, "https://pds.example");
        assert_eq!(config.posting.default_langs, vec!["es", "en"]);
        assert_eq!(config.enabled_platforms(), vec!["bluesky"]);
    }

    #[test]
    fn test_missing_telegram_section_is_rejected() {
        assert!(Config::from_toml_str("[storage]\ndatabase_path = \"x.db\"").is_err());
    }

    #[test]
    fn test_empty_allow_list_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [telegram]
            bot_token = "123:abc"
            allowed_user_ids = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("allowed_user_ids"));
    }

    #[test]
    fn test_secret_key_prefers_environment() {
        assert_eq!(
            resolve_secret_key(Some("from-env".to_string()), Some("from-file")).unwrap(),
            "from-env"
        );
        assert_eq!(
            resolve_secret_key(Some(String::new()), Some("from-file")).unwrap(),
            "from-file"
        );
        let err = resolve_secret_key(None, Some("")).unwrap_err();
        assert!(err.to_string().contains(SECRET_KEY_ENV));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = Config::from_toml_str(&format!("{MINIMAL}\n[posting]\npublish_timeout_secs = 0"))
            .unwrap_err();
        assert!(err.to_string().contains("timeouts"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = std::env::temp_dir().join(format!("crossposter-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.telegram.bot_token, "123:abc");

        std::fs::remove_dir_all(&dir).ok();
        assert!(Config::load(&path).is_err());
    }
}
