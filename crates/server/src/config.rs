use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration as StdDuration,
};

use anyhow::{ensure, Context};
use broker::MqttConfig;
use chrono::Duration;
use coordinator::CoordinatorSettings;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "portrait.toml";
const CONFIG_PATH_VAR: &str = "PORTRAIT_CONFIG";
const ENV_PREFIX: &str = "PORTRAIT__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub http_bind: String,
    pub api_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub album_api_url: String,
    pub album_api_key: String,
    pub album_timeout_millis: u64,
    pub tick_millis: u64,
    pub skip_cooldown_secs: i64,
    pub roster_refresh_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/portrait.db".into(),
            http_bind: "127.0.0.1:8000".into(),
            api_url: "http://127.0.0.1:8000/api/v1".into(),
            mqtt_host: "localhost".into(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            mqtt_client_id: "portrait-coordinator".into(),
            album_api_url: "http://127.0.0.1:2283/api".into(),
            album_api_key: String::new(),
            album_timeout_millis: 1500,
            tick_millis: 2000,
            skip_cooldown_secs: 5,
            roster_refresh_secs: 60,
        }
    }
}

impl Settings {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid settings file")
    }

    /// Applies environment overrides. `PORTRAIT__<KEY>` wins over the legacy
    /// deployment names.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str, legacy: Option<&str>| {
            lookup(&format!("{ENV_PREFIX}{key}")).or_else(|| legacy.and_then(|name| lookup(name)))
        };

        if let Some(v) = var("DATABASE_URL", Some("DATABASE_URL")) {
            self.database_url = v;
        }
        if let Some(v) = var("HTTP_BIND", None) {
            self.http_bind = v;
        }
        if let Some(v) = var("API_URL", Some("API_URL")) {
            self.api_url = v;
        }
        if let Some(v) = var("MQTT_HOST", Some("MQTT_BROKER")) {
            self.mqtt_host = v;
        }
        parse_into(&mut self.mqtt_port, "MQTT_PORT", var("MQTT_PORT", Some("MQTT_PORT")));
        if let Some(v) = var("MQTT_USER", Some("MQTT_USER")) {
            self.mqtt_user = Some(v);
        }
        if let Some(v) = var("MQTT_PASSWORD", Some("MQTT_PASSWORD")) {
            self.mqtt_password = Some(v);
        }
        if let Some(v) = var("MQTT_CLIENT_ID", None) {
            self.mqtt_client_id = v;
        }
        if let Some(v) = var("ALBUM_API_URL", Some("IMMICH_API_PATH")) {
            self.album_api_url = v;
        }
        if let Some(v) = var("ALBUM_API_KEY", Some("IMMICH_API_KEY")) {
            self.album_api_key = v;
        }
        parse_into(
            &mut self.album_timeout_millis,
            "ALBUM_TIMEOUT_MILLIS",
            var("ALBUM_TIMEOUT_MILLIS", None),
        );
        parse_into(&mut self.tick_millis, "TICK_MILLIS", var("TICK_MILLIS", None));
        parse_into(
            &mut self.skip_cooldown_secs,
            "SKIP_COOLDOWN_SECS",
            var("SKIP_COOLDOWN_SECS", None),
        );
        parse_into(
            &mut self.roster_refresh_secs,
            "ROSTER_REFRESH_SECS",
            var("ROSTER_REFRESH_SECS", None),
        );
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.tick_millis > 0, "tick_millis must be positive");
        ensure!(
            self.album_timeout_millis > 0 && self.album_timeout_millis < self.tick_millis,
            "album_timeout_millis must be positive and shorter than tick_millis"
        );
        ensure!(
            self.skip_cooldown_secs >= 0,
            "skip_cooldown_secs cannot be negative"
        );
        ensure!(
            self.roster_refresh_secs > 0,
            "roster_refresh_secs must be positive"
        );
        ensure!(!self.api_url.trim().is_empty(), "api_url cannot be empty");
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            api_url: self.api_url.clone(),
            tick: StdDuration::from_millis(self.tick_millis),
            skip_cooldown: Duration::seconds(self.skip_cooldown_secs),
            roster_refresh: Duration::seconds(self.roster_refresh_secs),
        }
    }

    pub fn album_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.album_timeout_millis)
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        let mut config = MqttConfig::new(&self.mqtt_client_id, &self.mqtt_host, self.mqtt_port);
        config.username = self.mqtt_user.clone();
        config.password = self.mqtt_password.clone();
        config
    }
}

fn parse_into<T: FromStr>(slot: &mut T, key: &str, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting override"),
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => Settings::from_toml(&raw).with_context(|| format!("failed to load '{path}'"))?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => Settings::default(),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read settings file '{path}'"))
        }
    };
    settings.apply_env(|key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
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

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
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
