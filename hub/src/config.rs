//! Typed environment configuration. No CLI flag parsing is introduced — that
//! belongs to the out-of-scope persistence layer (spec §1) — so this reads
//! plain environment variables once at startup, matching the hub's existing
//! `env_truthy`/`DATABASE_URL`/`RESET_DB` conventions. The declarative
//! `config.yml` systems roster is parsed here too, with `serde_yaml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub listen_addr: String,
    pub disable_password_auth: bool,
    pub csp: Option<String>,
    pub reset_db: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".into()),
            disable_password_auth: env_truthy("DISABLE_PASSWORD_AUTH"),
            csp: std::env::var("CSP").ok(),
            reset_db: env_truthy("RESET_DB"),
        }
    }
}

pub fn env_truthy(key: &str) -> bool {
    matches!(std::env::var(key).ok().as_deref(), Some("1") | Some("true") | Some("TRUE"))
}

/// One `config.yml` roster entry (spec §6). `token`, when present, pins the
/// system's enrollment token rather than letting the hub generate one.
#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Deserialize)]
struct RosterFile {
    systems: Vec<RosterEntry>,
}

/// Reads `<data_dir>/config.yml` if present. `None` means the file doesn't
/// exist (roster reconciliation is opt-in, spec §6 "optional").
pub fn load_roster(data_dir: &Path) -> Result<Option<Vec<RosterEntry>>> {
    let path = data_dir.join("config.yml");
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).context("reading config.yml")?;
    let parsed: RosterFile = serde_yaml::from_str(&raw).context("parsing config.yml")?;
    Ok(Some(parsed.systems))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_roster_returns_none_when_file_absent() {
        let dir = std::env::temp_dir().join(format!("beszel-hub-roster-{}", uuid::Uuid::new_v4()));
        assert!(load_roster(&dir).unwrap().is_none());
    }

    #[test]
    fn load_roster_parses_systems_list() {
        let dir = std::env::temp_dir().join(format!("beszel-hub-roster-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.yml"),
            "systems:\n  - name: web1\n    host: 10.0.0.1\n    port: \"45876\"\n",
        )
        .unwrap();

        let entries = load_roster(&dir).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "web1");
        assert!(entries[0].token.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
