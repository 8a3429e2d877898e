//! Runtime configuration from the environment.
//!
//! The helper takes no configuration files and persists nothing; everything
//! tunable comes from environment variables with conservative defaults.

use std::time::Duration;

use anyhow::{Context, Result};

/// Which UI backend the process presents dialogs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiKind {
    /// Prompt on the controlling terminal. Development only.
    Tty,
    /// No interaction surface; every confirmation is cancelled.
    Headless,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for a reader to be attached.
    pub reader_timeout: Duration,
    /// How long to wait for a card after a reader is present.
    pub card_timeout: Duration,
    /// Origin exceptions allowed to skip the https requirement,
    /// serialized form, e.g. `http://localhost:8080`.
    pub allowed_insecure_origins: Vec<String>,
    pub ui: UiKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reader_timeout: Duration::from_secs(30),
            card_timeout: Duration::from_secs(30),
            allowed_insecure_origins: Vec::new(),
            ui: if cfg!(unix) {
                UiKind::Tty
            } else {
                UiKind::Headless
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            reader_timeout: env_secs("WEB_EID_READER_TIMEOUT_SECS")?
                .unwrap_or(defaults.reader_timeout),
            card_timeout: env_secs("WEB_EID_CARD_TIMEOUT_SECS")?.unwrap_or(defaults.card_timeout),
            allowed_insecure_origins: std::env::var("WEB_EID_ALLOW_INSECURE_ORIGIN")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            ui: match std::env::var("WEB_EID_UI").as_deref() {
                Ok("tty") => UiKind::Tty,
                Ok("headless") => UiKind::Headless,
                Ok(other) => anyhow::bail!("invalid WEB_EID_UI value '{other}'"),
                Err(_) => defaults.ui,
            },
        })
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("invalid {name} value '{value}'"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
