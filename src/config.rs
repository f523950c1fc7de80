//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the event database.
    pub store_root: PathBuf,
    /// Listen address for WebSocket and relay info, e.g. `127.0.0.1:7777`.
    pub bind: String,
    /// NIP-11 relay name.
    pub relay_name: String,
    /// NIP-11 relay description.
    pub relay_description: String,
    /// Canonical ws URL checked against NIP-42 `relay` tags when set.
    pub relay_url: Option<String>,
    /// Gate EVENT and REQ behind NIP-42 authentication.
    pub auth_required: bool,
    /// Pubkeys allowed to publish; empty leaves the relay open.
    pub write_allow: Vec<String>,
    /// Per-connection delivery queue bound.
    pub queue_capacity: usize,
    /// Reader idle timeout in seconds, `0` disables it.
    pub idle_timeout_secs: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind = env::var("BIND")?;
        let relay_name = env::var("RELAY_NAME").unwrap_or_else(|_| "rostr".into());
        let relay_description = env::var("RELAY_DESCRIPTION").unwrap_or_default();
        let relay_url = env::var("RELAY_URL").ok().filter(|s| !s.is_empty());
        let auth_required = env::var("AUTH_REQUIRED").unwrap_or_else(|_| "0".into()) == "1";
        let write_allow = csv_strings(env::var("WRITE_ALLOW").unwrap_or_default());
        let queue_capacity = env::var("QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(256);
        let idle_timeout_secs = env::var("IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            store_root,
            bind,
            relay_name,
            relay_description,
            relay_url,
            auth_required,
            write_allow,
            queue_capacity,
            idle_timeout_secs,
        })
    }
}

/// Serialises tests that touch process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ENV_MUTEX;
    use std::{env, fs};
    use tempfile::tempdir;

    const VARS: [&str; 9] = [
        "STORE_ROOT",
        "BIND",
        "RELAY_NAME",
        "RELAY_DESCRIPTION",
        "RELAY_URL",
        "AUTH_REQUIRED",
        "WRITE_ALLOW",
        "QUEUE_CAPACITY",
        "IDLE_TIMEOUT_SECS",
    ];

    fn clear_vars() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp/rostr\n",
                "BIND=127.0.0.1:7777\n",
                "RELAY_NAME=\"test relay\"\n",
                "RELAY_URL=wss://relay.example\n",
                "AUTH_REQUIRED=1\n",
                "WRITE_ALLOW=\"aa, bb\"\n",
                "QUEUE_CAPACITY=32\n",
                "IDLE_TIMEOUT_SECS=60\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/rostr"));
        assert_eq!(cfg.bind, "127.0.0.1:7777");
        assert_eq!(cfg.relay_name, "test relay");
        assert_eq!(cfg.relay_url.as_deref(), Some("wss://relay.example"));
        assert!(cfg.auth_required);
        assert_eq!(cfg.write_allow, vec!["aa", "bb"]);
        assert_eq!(cfg.queue_capacity, 32);
        assert_eq!(cfg.idle_timeout_secs, 60);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_ROOT=/tmp\nBIND=127.0.0.1:7777\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relay_name, "rostr");
        assert!(cfg.relay_description.is_empty());
        assert!(cfg.relay_url.is_none());
        assert!(!cfg.auth_required);
        assert!(cfg.write_allow.is_empty());
        assert_eq!(cfg.queue_capacity, 256);
        assert_eq!(cfg.idle_timeout_secs, 0);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND=127.0.0.1:7777\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn invalid_queue_capacity_falls_back() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            "STORE_ROOT=/tmp\nBIND=127.0.0.1:7777\nQUEUE_CAPACITY=0\n",
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.queue_capacity, 256);
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
