use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use engine::{EngineConfig, ModerationPolicy};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub withdraw_window_seconds: u64,
    pub member_count_limit: i64,
    pub sensitive_categories: Vec<String>,
    pub dispatch_shards: usize,
    pub push_retry_attempts: u32,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            withdraw_window_seconds: engine.withdraw_window.as_secs(),
            member_count_limit: engine.default_member_limit,
            sensitive_categories: engine::moderation::DEFAULT_SENSITIVE_CATEGORIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            dispatch_shards: engine.dispatch_shards,
            push_retry_attempts: engine.push_retry_attempts,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            withdraw_window: Duration::from_secs(self.withdraw_window_seconds),
            default_member_limit: self.member_count_limit,
            moderation: ModerationPolicy::new(&self.sensitive_categories),
            dispatch_shards: self.dispatch_shards.max(1),
            push_retry_attempts: self.push_retry_attempts.max(1),
            ..EngineConfig::default()
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "withdraw_window_seconds" => set_parsed(&mut self.withdraw_window_seconds, key, value),
            "member_count_limit" => set_parsed(&mut self.member_count_limit, key, value),
            "sensitive_categories" => self.sensitive_categories = split_list(value),
            "dispatch_shards" => set_parsed(&mut self.dispatch_shards, key, value),
            "push_retry_attempts" => set_parsed(&mut self.push_retry_attempts, key, value),
            "max_body_bytes" => set_parsed(&mut self.max_body_bytes, key, value),
            _ => {}
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => {
            for (key, value) in file_cfg {
                let value = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                    other => other.to_string(),
                };
                settings.apply(&key, &value);
            }
        }
        Err(error) => warn!(%error, "ignoring unreadable server.toml"),
    }
}

/// Later names in each list win.
const ENV_KEYS: [(&str, &[&str]); 7] = [
    ("bind_addr", &["SERVER_BIND", "APP__BIND_ADDR"]),
    ("database_url", &["DATABASE_URL", "APP__DATABASE_URL"]),
    ("withdraw_window_seconds", &["APP__WITHDRAW_WINDOW_SECONDS"]),
    ("member_count_limit", &["APP__MEMBER_COUNT_LIMIT"]),
    ("sensitive_categories", &["APP__SENSITIVE_CATEGORIES"]),
    ("dispatch_shards", &["APP__DISPATCH_SHARDS"]),
    ("push_retry_attempts", &["APP__PUSH_RETRY_ATTEMPTS"]),
];

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    for (key, names) in ENV_KEYS {
        for name in names {
            if let Some(value) = lookup(name) {
                settings.apply(key, &value);
            }
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring invalid setting"),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
