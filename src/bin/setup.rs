//! Crossposter setup wizard.
//!
//! Asks for the Telegram bot token, the allowed user ids, the database path,
//! the credential passphrase and which platforms to enable, then writes
//! `config.toml` to the project root (`CROSSPOSTER_ROOT`, or the current
//! directory).

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

struct ConfigParams<'a> {
    tg_token: &'a str,
    user_ids: &'a str,
    db_path: &'a str,
    secret_key: &'a str,
    mastodon: bool,
    bluesky: bool,
    default_langs: &'a str,
}

#[derive(Serialize)]
struct ConfigFile<'a> {
    telegram: TelegramSection<'a>,
    storage: StorageSection<'a>,
    mastodon: MastodonSection,
    bluesky: BlueskySection,
    posting: PostingSection<'a>,
}

#[derive(Serialize)]
struct TelegramSection<'a> {
    bot_token: &'a str,
    allowed_user_ids: Vec<u64>,
}

#[derive(Serialize)]
struct StorageSection<'a> {
    database_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<&'a str>,
}

#[derive(Serialize)]
struct MastodonSection {
    enabled: bool,
    client_name: &'static str,
    scopes: &'static str,
}

#[derive(Serialize)]
struct BlueskySection {
    enabled: bool,
    service_url: &'static str,
}

#[derive(Serialize)]
struct PostingSection<'a> {
    default_langs: Vec<&'a str>,
}

/// Produces a valid config.toml string. Extracted so it can be unit-tested.
fn format_config(p: &ConfigParams<'_>) -> Result<String> {
    let allowed_user_ids = split_list(p.user_ids)
        .into_iter()
        .map(|id| {
            id.parse::<u64>()
                .with_context(|| format!("User IDs must be numbers: {id}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let file = ConfigFile {
        telegram: TelegramSection {
            bot_token: p.tg_token,
            allowed_user_ids,
        },
        storage: StorageSection {
            database_path: p.db_path,
            secret_key: Some(p.secret_key).filter(|k| !k.is_empty()),
        },
        mastodon: MastodonSection {
            enabled: p.mastodon,
            client_name: "Crossposter",
            scopes: "read write",
        },
        bluesky: BlueskySection {
            enabled: p.bluesky,
            service_url: "https://bsky.social",
        },
        posting: PostingSection {
            default_langs: split_list(p.default_langs),
        },
    };
    toml::to_string(&file).context("Could not render config.toml")
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_yes_no(answer: &str, default: bool) -> Result<bool> {
    match answer.trim().to_lowercase().as_str() {
        "" => Ok(default),
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        other => bail!("expected y or n, got {other:?}"),
    }
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_owned())
}

fn run(project_root: &Path) -> Result<()> {
    println!("=== Crossposter Setup ===\n");

    let or_default = |s: String, default: &str| {
        if s.is_empty() {
            default.to_owned()
        } else {
            s
        }
    };

    let tg_token = read_line("Telegram bot token: ")?;
    let user_ids = read_line("Allowed Telegram user IDs (comma-separated): ")?;
    let db_path = or_default(
        read_line("Credential DB path [crossposter.db]: ")?,
        "crossposter.db",
    );
    let secret_key = read_line(
        "Passphrase for stored credentials (empty to use CROSSPOSTER_SECRET_KEY instead): ",
    )?;
    let mastodon = parse_yes_no(&read_line("Enable Mastodon? [Y/n]: ")?, true)?;
    let bluesky = parse_yes_no(&read_line("Enable Bluesky? [Y/n]: ")?, true)?;
    let default_langs = read_line("Default post languages (optional, e.g. en,es): ")?;

    let config = format_config(&ConfigParams {
        tg_token: &tg_token,
        user_ids: &user_ids,
        db_path: &db_path,
        secret_key: &secret_key,
        mastodon,
        bluesky,
        default_langs: &default_langs,
    })?;

    let config_path = project_root.join("config.toml");
    std::fs::write(&config_path, &config)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    println!("\n✓  config.toml saved to {}", config_path.display());
    println!("   Run the bot with:  cargo run");
    Ok(())
}

fn main() -> Result<()> {
    let project_root =
        PathBuf::from(std::env::var("CROSSPOSTER_ROOT").unwrap_or_else(|_| ".".to_string()));
    run(&project_root)
}
